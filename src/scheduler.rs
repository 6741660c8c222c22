//! Per-device polling scheduler.
//!
//! Every device gets its own task running `poll_and_publish` at the device's
//! poll interval. Within a device the runs never overlap, and ticks missed
//! while a slow run is in flight coalesce into a single follow-up run.
//! Across devices there is no ordering: a dead BMS cannot delay the PCS.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::cache::{Reading, SharedDataCache};
use crate::device::DeviceHandler;
use crate::error::Result;
use crate::mqtt::MqttTransport;
use crate::process;

/// Owns the polling tasks for the whole fleet.
pub struct PollScheduler {
    stop_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PollScheduler {
    /// Creates a scheduler that observes the given stop signal.
    pub fn new(stop_rx: watch::Receiver<bool>) -> Self {
        Self {
            stop_rx,
            tasks: Vec::new(),
        }
    }

    /// Registers the polling job for one device.
    pub fn add_polling_job(
        &mut self,
        handler: Arc<DeviceHandler>,
        cache: Arc<SharedDataCache>,
        transport: Arc<MqttTransport>,
    ) {
        info!(
            device = %handler.name(),
            interval = ?handler.poll_interval(),
            "polling job registered"
        );
        let stop_rx = self.stop_rx.clone();
        self.tasks.push(tokio::spawn(device_loop(
            handler, cache, transport, stop_rx,
        )));
    }

    /// Number of registered polling jobs.
    pub fn job_count(&self) -> usize {
        self.tasks.len()
    }

    /// Waits for all polling tasks to observe the stop signal and finish.
    pub async fn shutdown(self) {
        for task in self.tasks {
            let _ = task.await;
        }
        info!("scheduler stopped");
    }
}

async fn device_loop(
    handler: Arc<DeviceHandler>,
    cache: Arc<SharedDataCache>,
    transport: Arc<MqttTransport>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(handler.poll_interval());
    // Ticks that pile up behind a slow poll collapse into one late run
    // instead of a burst.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = poll_and_publish(&handler, &cache, &transport).await {
                    // Failures are isolated to this device and this tick.
                    error!(device = %handler.name(), error = %e, "poll failed");
                }
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    debug!(device = %handler.name(), "polling loop stopped");
                    return;
                }
            }
        }
    }
}

/// One full pipeline run: read, process, cache, enqueue for publish.
///
/// A failed read records an error status in the cache and skips publishing;
/// the next tick retries from a fresh connection.
pub async fn poll_and_publish(
    handler: &DeviceHandler,
    cache: &SharedDataCache,
    transport: &MqttTransport,
) -> Result<()> {
    let raw = match handler.read_data().await {
        Ok(raw) => raw,
        Err(e) => {
            cache
                .update_status(handler.name(), false, Some(e.to_string()))
                .await;
            return Err(e);
        }
    };

    let mut processed = process::process(&raw, handler.map());
    process::derive_fields(handler.kind(), &mut processed);

    let reading = Reading {
        device_name: handler.name().to_string(),
        device_type: handler.kind(),
        ip_address: handler.ip().to_string(),
        timestamp: Utc::now(),
        raw,
        processed,
    };

    let topic = transport.topic(&[handler.kind().as_str(), handler.name(), "data"]);
    let payload = reading.telemetry_payload();
    cache.update_reading(reading).await;

    if transport.is_connected() {
        transport.enqueue(&topic, payload).await;
    } else {
        debug!(device = %handler.name(), "mqtt disconnected, telemetry not queued");
    }

    Ok(())
}
