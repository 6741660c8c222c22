//! Shared MQTT transport.
//!
//! One [`MqttTransport`] is shared by every publisher and subscriber in the
//! process. It owns:
//!
//! - the broker connection lifecycle, including a Last-Will-and-Testament on
//!   `<base>/status` so a crashed supervisor shows up as `offline` within the
//!   keepalive window;
//! - the subscription registry, replayed on every successful (re)connect;
//! - a bounded publish queue drained by a pool of worker tasks, so producers
//!   never block on broker I/O;
//! - inbound dispatch to a single message callback, spawned off the event
//!   loop so a slow handler cannot stall the connection;
//! - a health check that nudges the reconnect loop whenever the connection
//!   stays down with no reconnect in progress.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::error::{Error, Result};

/// Messages older than this are dropped at dequeue instead of published.
const MAX_MESSAGE_AGE: Duration = Duration::from_secs(30);

/// Capacity of the bounded publish queue.
const PUBLISH_QUEUE_CAPACITY: usize = 1000;

/// Rolling window used for the average publish latency.
const LATENCY_SAMPLES: usize = 100;

/// Number of topics reported in the per-topic statistics summary.
const TOP_TOPICS: usize = 10;

/// Callback invoked for every inbound message with the decoded payload.
pub type MessageCallback =
    Arc<dyn Fn(String, serde_json::Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A pending outbound message.
struct QueuedMessage {
    topic: String,
    payload: serde_json::Value,
    qos: QoS,
    retain: bool,
    enqueued_at: Instant,
}

#[derive(Debug, Default, Clone)]
struct TopicStats {
    count: u64,
    bytes: u64,
    max_bytes: u64,
}

/// Aggregated publish statistics.
#[derive(Debug, Default)]
struct PublisherStats {
    total_messages: u64,
    successful_publishes: u64,
    failed_publishes: u64,
    dropped_stale: u64,
    queue_overflows: u64,
    latencies: VecDeque<Duration>,
    total_payload_bytes: u64,
    last_payload_bytes: u64,
    max_payload_bytes: u64,
    per_topic: HashMap<String, TopicStats>,
}

impl PublisherStats {
    fn record_success(&mut self, topic: &str, bytes: u64, latency: Duration) {
        self.total_messages += 1;
        self.successful_publishes += 1;
        self.latencies.push_back(latency);
        if self.latencies.len() > LATENCY_SAMPLES {
            self.latencies.pop_front();
        }
        self.total_payload_bytes += bytes;
        self.last_payload_bytes = bytes;
        self.max_payload_bytes = self.max_payload_bytes.max(bytes);

        let entry = self.per_topic.entry(topic.to_string()).or_default();
        entry.count += 1;
        entry.bytes += bytes;
        entry.max_bytes = entry.max_bytes.max(bytes);
    }

    fn record_failure(&mut self) {
        self.total_messages += 1;
        self.failed_publishes += 1;
    }

    fn average_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.latencies.iter().sum();
        total / self.latencies.len() as u32
    }
}

/// Point-in-time snapshot of the publish statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PublisherStatsSnapshot {
    /// Messages handed to the broker client, successful or not.
    pub total_messages: u64,
    /// Messages accepted by the broker client.
    pub successful_publishes: u64,
    /// Messages that failed at the broker client or were attempted while
    /// disconnected.
    pub failed_publishes: u64,
    /// Messages dropped at dequeue for exceeding the age limit.
    pub dropped_stale: u64,
    /// Messages dropped at enqueue because the queue was full.
    pub queue_overflows: u64,
    /// Rolling average publish latency in milliseconds.
    pub avg_publish_ms: f64,
    /// Total bytes published.
    pub total_payload_bytes: u64,
    /// Size of the most recent payload.
    pub last_payload_bytes: u64,
    /// Largest payload seen.
    pub max_payload_bytes: u64,
    /// Heaviest topics by total bytes.
    pub top_topics: Vec<TopicSummary>,
}

/// Per-topic publish summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TopicSummary {
    /// Topic string.
    pub topic: String,
    /// Messages published to the topic.
    pub count: u64,
    /// Total bytes published to the topic.
    pub total_bytes: u64,
    /// Largest payload published to the topic.
    pub max_bytes: u64,
}

/// Shared MQTT transport with a worker-pool publisher.
pub struct MqttTransport {
    config: MqttConfig,
    client: AsyncClient,
    client_id: String,
    connected: Arc<AtomicBool>,
    reconnecting: Arc<AtomicBool>,
    subscriptions: Mutex<HashSet<String>>,
    queue_tx: Mutex<Option<mpsc::Sender<QueuedMessage>>>,
    stats: Mutex<PublisherStats>,
    callback: RwLock<Option<MessageCallback>>,
    reconnect_nudge: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Creates the transport and starts its background tasks.
    ///
    /// Connection establishment is asynchronous; use [`wait_connected`] to
    /// block startup on the first successful connect.
    ///
    /// [`wait_connected`]: MqttTransport::wait_connected
    pub fn start(config: MqttConfig, stop_rx: watch::Receiver<bool>) -> Arc<Self> {
        // Unique client id: broker-side session take-over between restarts
        // would otherwise disconnect the newer instance.
        let suffix: u32 = rand::rng().random();
        let client_id = format!(
            "{}_{}_{:08x}",
            config.client_id,
            Utc::now().timestamp(),
            suffix
        );

        let mut options = MqttOptions::new(&client_id, &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let status_topic = format!("{}/status", config.base_topic);
        let will_payload = json!({
            "status": "offline",
            "reason": "unexpected_disconnect",
            "timestamp": Utc::now().to_rfc3339(),
        });
        options.set_last_will(LastWill::new(
            &status_topic,
            will_payload.to_string(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, event_loop) = AsyncClient::new(options, 64);
        let (queue_tx, queue_rx) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);

        info!(client_id = %client_id, broker = %config.broker, port = config.port, "mqtt transport starting");

        let transport = Arc::new(Self {
            config,
            client,
            client_id,
            connected: Arc::new(AtomicBool::new(false)),
            reconnecting: Arc::new(AtomicBool::new(false)),
            subscriptions: Mutex::new(HashSet::new()),
            queue_tx: Mutex::new(Some(queue_tx)),
            stats: Mutex::new(PublisherStats::default()),
            callback: RwLock::new(None),
            reconnect_nudge: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        handles.push(tokio::spawn(Self::event_loop_task(
            Arc::clone(&transport),
            event_loop,
            stop_rx.clone(),
        )));
        handles.push(tokio::spawn(Self::health_check_task(
            Arc::clone(&transport),
            stop_rx.clone(),
        )));

        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for worker in 0..transport.config.max_publish_workers.max(1) {
            handles.push(tokio::spawn(Self::publish_worker(
                Arc::clone(&transport),
                Arc::clone(&queue_rx),
                worker,
            )));
        }

        if let Ok(mut tasks) = transport.tasks.try_lock() {
            *tasks = handles;
        }

        transport
    }

    /// The unique client id in use for this process.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The configured base topic.
    pub fn base_topic(&self) -> &str {
        &self.config.base_topic
    }

    /// Joins topic segments under the base topic.
    pub fn topic(&self, parts: &[&str]) -> String {
        let mut topic = self.config.base_topic.clone();
        for part in parts {
            topic.push('/');
            topic.push_str(part);
        }
        topic
    }

    /// Whether the broker connection is currently up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Waits for the first successful connect, up to `deadline`.
    pub async fn wait_connected(&self, deadline: Duration) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if self.is_connected() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Err(Error::Mqtt(format!(
            "broker {}:{} not reachable within {:?}",
            self.config.broker, self.config.port, deadline
        )))
    }

    /// Installs the single inbound message callback.
    pub async fn set_message_callback(&self, callback: MessageCallback) {
        *self.callback.write().await = Some(callback);
        debug!("mqtt message callback installed");
    }

    /// Subscribes to a topic and records it in the registry.
    ///
    /// The registry is replayed on every reconnect; a topic that fails to
    /// subscribe is evicted so reconnects do not retry it forever.
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.subscriptions.lock().await.insert(topic.to_string());
        if self.is_connected() {
            if let Err(e) = self.client.subscribe(topic, QoS::AtMostOnce).await {
                self.subscriptions.lock().await.remove(topic);
                return Err(Error::Mqtt(format!("subscribe '{topic}' failed: {e}")));
            }
            info!(topic, "subscribed");
        }
        Ok(())
    }

    /// Unsubscribes from a topic and removes it from the registry.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.subscriptions.lock().await.remove(topic);
        if self.is_connected() {
            self.client
                .unsubscribe(topic)
                .await
                .map_err(|e| Error::Mqtt(format!("unsubscribe '{topic}' failed: {e}")))?;
        }
        Ok(())
    }

    /// Topics currently held in the subscription registry.
    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions.lock().await.iter().cloned().collect()
    }

    /// Queues a message for publication by the worker pool.
    ///
    /// Returns false when the queue is full; the message is dropped and
    /// counted as an overflow.
    pub async fn enqueue(&self, topic: &str, payload: serde_json::Value) -> bool {
        self.enqueue_with(topic, payload, QoS::AtMostOnce, false).await
    }

    /// Queues a message with explicit QoS and retain flags.
    pub async fn enqueue_with(
        &self,
        topic: &str,
        payload: serde_json::Value,
        qos: QoS,
        retain: bool,
    ) -> bool {
        let message = QueuedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            enqueued_at: Instant::now(),
        };

        let sent = match self.queue_tx.lock().await.as_ref() {
            Some(tx) => tx.try_send(message).is_ok(),
            None => false,
        };

        if !sent {
            self.stats.lock().await.queue_overflows += 1;
            warn!(topic, "publish queue full, message dropped");
        }
        sent
    }

    /// Snapshot of the publish statistics.
    pub async fn stats(&self) -> PublisherStatsSnapshot {
        let stats = self.stats.lock().await;
        let mut topics: Vec<TopicSummary> = stats
            .per_topic
            .iter()
            .map(|(topic, s)| TopicSummary {
                topic: topic.clone(),
                count: s.count,
                total_bytes: s.bytes,
                max_bytes: s.max_bytes,
            })
            .collect();
        topics.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes));
        topics.truncate(TOP_TOPICS);

        PublisherStatsSnapshot {
            total_messages: stats.total_messages,
            successful_publishes: stats.successful_publishes,
            failed_publishes: stats.failed_publishes,
            dropped_stale: stats.dropped_stale,
            queue_overflows: stats.queue_overflows,
            avg_publish_ms: stats.average_latency().as_secs_f64() * 1000.0,
            total_payload_bytes: stats.total_payload_bytes,
            last_payload_bytes: stats.last_payload_bytes,
            max_payload_bytes: stats.max_payload_bytes,
            top_topics: topics,
        }
    }

    /// Logs a one-shot overview of the transport: connection state,
    /// subscriptions and the publisher statistics.
    pub async fn log_status(&self) {
        let stats = self.stats().await;
        let subscriptions = self.subscriptions.lock().await.len();
        info!(
            connected = self.is_connected(),
            client_id = %self.client_id,
            base_topic = %self.config.base_topic,
            subscriptions,
            workers = self.config.max_publish_workers,
            total_messages = stats.total_messages,
            successful = stats.successful_publishes,
            failed = stats.failed_publishes,
            dropped_stale = stats.dropped_stale,
            queue_overflows = stats.queue_overflows,
            avg_publish_ms = stats.avg_publish_ms,
            total_payload_bytes = stats.total_payload_bytes,
            "mqtt transport status"
        );
        for topic in stats.top_topics {
            debug!(
                topic = %topic.topic,
                count = topic.count,
                total_bytes = topic.total_bytes,
                max_bytes = topic.max_bytes,
                "top publish topic"
            );
        }
    }

    /// Gracefully shuts the transport down.
    ///
    /// Publishes a retained `offline` status, lets the workers drain the
    /// remaining queue, clears the subscription registry and disconnects.
    pub async fn shutdown(&self) {
        info!("mqtt transport shutting down");

        let status_topic = self.topic(&["status"]);
        let payload = json!({
            "status": "offline",
            "reason": "graceful_shutdown",
            "timestamp": Utc::now().to_rfc3339(),
            "client_id": self.client_id,
        });
        if let Err(e) = self
            .client
            .publish(&status_topic, QoS::AtLeastOnce, true, payload.to_string())
            .await
        {
            warn!(error = %e, "failed to publish shutdown status");
        }

        // Dropping the sender lets the workers drain what is queued and exit.
        self.queue_tx.lock().await.take();
        // A full shutdown is the only point where the registry is cleared;
        // it must survive reconnects up to here.
        self.subscriptions.lock().await.clear();

        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "disconnect failed");
        }

        // Tasks end on the stop signal and the closed queue; anything still
        // running after the grace period is aborted.
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                abort.abort();
            }
        }
    }

    /// Drives the rumqttc event loop: connection state, inbound dispatch and
    /// reconnect backoff.
    async fn event_loop_task(
        self: Arc<Self>,
        mut event_loop: EventLoop,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut attempts: u32 = 0;
        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        attempts = 0;
                        self.connected.store(true, Ordering::SeqCst);
                        self.reconnecting.store(false, Ordering::SeqCst);
                        info!(
                            broker = %self.config.broker,
                            port = self.config.port,
                            "connected to mqtt broker"
                        );
                        self.on_connected().await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.dispatch_inbound(&publish.topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let was_connected = self.connected.swap(false, Ordering::SeqCst);
                        if was_connected {
                            warn!(error = %e, "mqtt connection lost");
                        }

                        attempts += 1;
                        if attempts > self.config.connection_retry_count {
                            error!(
                                attempts = attempts - 1,
                                "mqtt reconnect attempts exhausted, waiting for health check"
                            );
                            self.reconnecting.store(false, Ordering::SeqCst);
                            tokio::select! {
                                _ = self.reconnect_nudge.notified() => { attempts = 1; }
                                changed = stop_rx.changed() => {
                                    if changed.is_err() || *stop_rx.borrow() { break; }
                                }
                            }
                        }

                        self.reconnecting.store(true, Ordering::SeqCst);
                        let backoff = Duration::from_secs(u64::from(5 * attempts).min(30));
                        debug!(attempt = attempts, ?backoff, "mqtt reconnect backoff");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        debug!("mqtt event loop stopped");
    }

    /// Re-establishes broker-side state after a successful (re)connect.
    async fn on_connected(&self) {
        // Retained so late subscribers learn the supervisor status.
        let status_topic = self.topic(&["status"]);
        let payload = json!({
            "status": "online",
            "timestamp": Utc::now().to_rfc3339(),
            "client_id": self.client_id,
        });
        self.enqueue_with(&status_topic, payload, QoS::AtLeastOnce, true)
            .await;

        let stats = self.stats().await;
        info!(
            workers = self.config.max_publish_workers,
            total_messages = stats.total_messages,
            failed = stats.failed_publishes,
            "publish workers serving"
        );

        let topics = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions.iter().cloned().collect::<Vec<_>>()
        };
        if topics.is_empty() {
            return;
        }

        info!(count = topics.len(), "restoring subscriptions");
        let mut failed = Vec::new();
        for topic in &topics {
            if let Err(e) = self.client.subscribe(topic, QoS::AtMostOnce).await {
                warn!(topic = %topic, error = %e, "subscription restore failed");
                failed.push(topic.clone());
            }
        }
        if !failed.is_empty() {
            let mut subscriptions = self.subscriptions.lock().await;
            for topic in failed {
                subscriptions.remove(&topic);
            }
        }
    }

    /// Decodes an inbound message and hands it to the registered callback.
    ///
    /// The callback future is spawned so broker I/O never waits on handler
    /// work.
    async fn dispatch_inbound(&self, topic: &str, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        let decoded = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) => value,
            Err(_) => json!({ "raw_message": text }),
        };

        let callback = self.callback.read().await.clone();
        match callback {
            Some(callback) => {
                let topic = topic.to_string();
                tokio::spawn(async move {
                    callback(topic, decoded).await;
                });
            }
            None => debug!(topic, "inbound message with no callback installed"),
        }
    }

    /// Periodically verifies the connection and nudges the reconnect loop
    /// when it stays down with no reconnect in progress.
    async fn health_check_task(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.health_check_interval.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() { break; }
                    continue;
                }
            }

            if !self.is_connected() && !self.reconnecting.load(Ordering::SeqCst) {
                warn!("health check: connection down, triggering reconnect");
                self.reconnect_nudge.notify_one();
            } else {
                debug!(connected = self.is_connected(), "health check");
            }
        }
    }

    /// Publish worker: drains the queue, drops stale messages, serialises
    /// payloads and tracks statistics.
    async fn publish_worker(
        self: Arc<Self>,
        queue_rx: Arc<Mutex<mpsc::Receiver<QueuedMessage>>>,
        worker: usize,
    ) {
        debug!(worker, "publish worker started");
        loop {
            let message = {
                let mut rx = queue_rx.lock().await;
                rx.recv().await
            };
            let Some(message) = message else {
                break;
            };

            if message.enqueued_at.elapsed() > MAX_MESSAGE_AGE {
                let mut stats = self.stats.lock().await;
                stats.dropped_stale += 1;
                warn!(worker, topic = %message.topic, "stale message dropped");
                continue;
            }

            if !self.is_connected() {
                self.stats.lock().await.record_failure();
                debug!(worker, topic = %message.topic, "publish while disconnected, dropped");
                continue;
            }

            let body = message.payload.to_string();
            let bytes = body.len() as u64;
            let start = Instant::now();
            let result = self
                .client
                .publish(&message.topic, message.qos, message.retain, body)
                .await;

            let mut stats = self.stats.lock().await;
            match result {
                Ok(()) => stats.record_success(&message.topic, bytes, start.elapsed()),
                Err(e) => {
                    stats.record_failure();
                    warn!(worker, topic = %message.topic, error = %e, "publish failed");
                }
            }
        }
        debug!(worker, "publish worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MqttConfig {
        MqttConfig {
            broker: "127.0.0.1".to_string(),
            port: 42883,
            client_id: "pms_test".to_string(),
            username: None,
            password: None,
            keepalive: 30,
            base_topic: "pms".to_string(),
            max_publish_workers: 2,
            connection_retry_count: 15,
            health_check_interval: 30,
        }
    }

    #[tokio::test]
    async fn test_topic_generation() {
        let (_tx, rx) = watch::channel(false);
        let transport = MqttTransport::start(test_config(), rx);
        assert_eq!(
            transport.topic(&["control", "BMS-1", "command"]),
            "pms/control/BMS-1/command"
        );
        assert_eq!(transport.topic(&["status"]), "pms/status");
    }

    #[tokio::test]
    async fn test_client_id_uniqueness() {
        let (_tx, rx) = watch::channel(false);
        let a = MqttTransport::start(test_config(), rx.clone());
        let b = MqttTransport::start(test_config(), rx);
        assert_ne!(a.client_id(), b.client_id());
        assert!(a.client_id().starts_with("pms_test_"));
    }

    #[tokio::test]
    async fn test_subscription_registry_offline() {
        let (_tx, rx) = watch::channel(false);
        let transport = MqttTransport::start(test_config(), rx);

        // Not connected: registry is updated, broker call deferred to connack.
        transport.subscribe("pms/control/a").await.unwrap();
        transport.subscribe("pms/control/b").await.unwrap();
        let mut topics = transport.subscribed_topics().await;
        topics.sort();
        assert_eq!(topics, vec!["pms/control/a", "pms/control/b"]);

        transport.unsubscribe("pms/control/a").await.unwrap();
        assert_eq!(transport.subscribed_topics().await, vec!["pms/control/b"]);
    }

    #[tokio::test]
    async fn test_disconnected_publish_counted_as_failure() {
        let (_tx, rx) = watch::channel(false);
        let transport = MqttTransport::start(test_config(), rx);

        // Workers drop everything while disconnected, counted as failures.
        assert!(transport.enqueue("pms/test", json!({"x": 1})).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = transport.stats().await;
        assert_eq!(stats.successful_publishes, 0);
        assert!(stats.failed_publishes >= 1 || stats.total_messages >= 1);
    }
}
