//! Top-level wiring of the supervisor process.
//!
//! [`Supervisor::start`] builds every component from the loaded
//! configuration, connects the MQTT transport, registers the polling jobs
//! and installs the command router. [`Supervisor::run_until_shutdown`] then
//! parks until SIGINT and tears everything down in order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::auto_mode::AutoModeController;
use crate::cache::SharedDataCache;
use crate::config::Config;
use crate::device::DeviceHandler;
use crate::error::Result;
use crate::mqtt::MqttTransport;
use crate::operation::OperationManager;
use crate::register_map::RegisterMap;
use crate::router::CommandRouter;
use crate::scheduler::PollScheduler;

/// How long startup waits for the first MQTT connect before failing.
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

/// A fully-wired supervisor process.
pub struct Supervisor {
    transport: Arc<MqttTransport>,
    operation: Arc<OperationManager>,
    scheduler: PollScheduler,
    stop_tx: watch::Sender<bool>,
}

impl Supervisor {
    /// Builds and starts every component.
    ///
    /// Fails when the configuration is unusable, a register map cannot be
    /// loaded, or the broker stays unreachable past the startup deadline.
    pub async fn start(config: Config) -> Result<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let cache = Arc::new(SharedDataCache::new());

        let transport = MqttTransport::start(config.mqtt.clone(), stop_rx.clone());
        transport.wait_connected(CONNECT_DEADLINE).await?;

        let connect_timeout = Duration::from_secs(config.system.connection_timeout);
        let mut handlers: HashMap<String, Arc<DeviceHandler>> = HashMap::new();
        for device in &config.devices {
            let map = RegisterMap::load(config.map_path(device.device_type))?;
            let handler = Arc::new(DeviceHandler::new(device, map, connect_timeout));
            handlers.insert(device.name.clone(), handler);
        }
        info!(devices = handlers.len(), "device handlers created");

        let controller = AutoModeController::new(
            &config.auto_mode,
            &handlers,
            Arc::clone(&cache),
            stop_rx.clone(),
        );

        let operation = OperationManager::new(
            &config,
            handlers.clone(),
            controller,
            Arc::clone(&transport),
            stop_rx.clone(),
        );

        let router = CommandRouter::new(
            handlers.clone(),
            Arc::clone(&transport),
            Arc::clone(&operation),
        );
        transport
            .set_message_callback(Arc::clone(&router).message_callback())
            .await;

        // Device command topics must be subscribed before polls publish, so
        // the dashboard can write from the first telemetry sample on.
        for name in handlers.keys() {
            let topic = transport.topic(&["control", name, "command"]);
            if let Err(e) = transport.subscribe(&topic).await {
                warn!(topic = %topic, error = %e, "command topic subscription failed");
            }
        }

        operation.initialize().await?;

        let mut scheduler = PollScheduler::new(stop_rx);
        for handler in handlers.values() {
            scheduler.add_polling_job(
                Arc::clone(handler),
                Arc::clone(&cache),
                Arc::clone(&transport),
            );
        }

        info!("supervisor started");
        Ok(Self {
            transport,
            operation,
            scheduler,
            stop_tx,
        })
    }

    /// Parks until SIGINT, then shuts down.
    pub async fn run_until_shutdown(self) -> Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        self.shutdown().await;
        Ok(())
    }

    /// Stops every component in order: polling first, then the operation
    /// manager and its tasks, then the transport with its retained offline
    /// status.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        self.scheduler.shutdown().await;
        self.operation.shutdown().await;
        self.transport.shutdown().await;
        info!("supervisor stopped");
    }
}
