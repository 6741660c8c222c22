//! Inbound command routing.
//!
//! The router is the transport's single message callback. Topics of the form
//! `<base>/control/<device>/command` carry device commands answered on the
//! matching `/response` topic; everything else under `<base>/control/` is
//! forwarded to the operation manager with the payload intact.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::device::DeviceHandler;
use crate::mqtt::{MessageCallback, MqttTransport};
use crate::operation::OperationManager;

/// Routes inbound MQTT messages to device handlers or the operation manager.
pub struct CommandRouter {
    handlers: HashMap<String, Arc<DeviceHandler>>,
    transport: Arc<MqttTransport>,
    operation: Arc<OperationManager>,
}

impl CommandRouter {
    /// Creates the router over the handler registry.
    pub fn new(
        handlers: HashMap<String, Arc<DeviceHandler>>,
        transport: Arc<MqttTransport>,
        operation: Arc<OperationManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            handlers,
            transport,
            operation,
        })
    }

    /// Builds the callback to install on the transport.
    pub fn message_callback(self: Arc<Self>) -> MessageCallback {
        Arc::new(move |topic, payload| {
            let router = Arc::clone(&self);
            Box::pin(async move {
                router.dispatch(&topic, payload).await;
            })
        })
    }

    /// Dispatches one inbound message.
    pub async fn dispatch(&self, topic: &str, payload: Value) {
        debug!(topic, "inbound message");

        match self.parse_command_topic(topic) {
            Some(device_name) => self.handle_device_command(&device_name, payload).await,
            None => self.operation.handle_message(topic, payload).await,
        }
    }

    /// Extracts the device name from `<base>/control/<device>/command`.
    fn parse_command_topic(&self, topic: &str) -> Option<String> {
        let rest = topic.strip_prefix(self.transport.base_topic())?;
        let mut parts = rest.trim_start_matches('/').split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("control"), Some(device), Some("command"), None) => Some(device.to_string()),
            _ => None,
        }
    }

    /// Handles a `write_register` command against the named device and
    /// publishes the response.
    async fn handle_device_command(&self, device_name: &str, payload: Value) {
        let request_id = payload
            .get("gui_request_id")
            .or_else(|| payload.get("request_id"))
            .cloned()
            .unwrap_or(Value::Null);

        let Some(handler) = self.handlers.get(device_name) else {
            warn!(device = device_name, "command for unknown device");
            self.respond(device_name, request_id, false, "unknown device")
                .await;
            return;
        };

        let action = payload.get("action").and_then(Value::as_str).unwrap_or("");
        if action != "write_register" {
            self.respond(
                device_name,
                request_id,
                false,
                &format!("unsupported action '{action}'"),
            )
            .await;
            return;
        }

        let Some(address) = parse_address(payload.get("address")) else {
            self.respond(device_name, request_id, false, "missing or invalid 'address'")
                .await;
            return;
        };
        let Some(value) = payload.get("value").and_then(Value::as_u64) else {
            self.respond(device_name, request_id, false, "missing or invalid 'value'")
                .await;
            return;
        };
        let Ok(value) = u16::try_from(value) else {
            self.respond(device_name, request_id, false, "'value' out of 16-bit range")
                .await;
            return;
        };

        let Some(register) = handler.map().find_by_address(address) else {
            self.respond(
                device_name,
                request_id,
                false,
                &format!("no register at address {address}"),
            )
            .await;
            return;
        };
        let register = register.to_string();

        info!(device = device_name, register = %register, address, value, "command write");
        let description = payload
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or(&register);

        match handler.write_register(&register, value).await {
            Ok(()) => {
                self.respond(
                    device_name,
                    request_id,
                    true,
                    &format!("ok: {description}"),
                )
                .await;
            }
            Err(e) => {
                warn!(device = device_name, error = %e, "command write failed");
                self.respond(device_name, request_id, false, &e.to_string())
                    .await;
            }
        }
    }

    async fn respond(&self, device_name: &str, request_id: Value, success: bool, message: &str) {
        let topic = self.transport.topic(&["control", device_name, "response"]);
        let payload = json!({
            "request_id": request_id,
            "success": success,
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
            "device_name": device_name,
        });
        self.transport.enqueue(&topic, payload).await;
    }
}

/// Accepts an address as an integer or as a decimal string.
fn parse_address(value: Option<&Value>) -> Option<u16> {
    match value? {
        Value::Number(number) => number.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
