//! Device handler tests against an in-process Modbus/TCP server.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use common::{spawn_device, FakeDevice};
use pms_supervisor::cache::SharedDataCache;
use pms_supervisor::config::{DeviceConfig, MqttConfig};
use pms_supervisor::device::{DeviceHandler, DeviceKind};
use pms_supervisor::mqtt::MqttTransport;
use pms_supervisor::register_map::RegisterMap;
use pms_supervisor::scheduler::poll_and_publish;

fn bms_map() -> RegisterMap {
    RegisterMap::from_json(&json!({
        "metering_registers": {
            "battery_soc": {
                "address": 256,
                "function_code": "0x03",
                "data_type": "uint16",
                "scale": 0.1,
                "unit": "%",
                "description": "Battery SOC"
            },
            "rack_current": {
                "address": 300,
                "function_code": "0x04",
                "data_type": "int16",
                "scale": 0.1,
                "unit": "A"
            },
            "total_energy": {
                "address": 310,
                "function_code": "0x03",
                "data_type": "uint32",
                "registers": 2,
                "unit": "Wh"
            }
        },
        "control_registers": {
            "error_reset": { "address": 400, "function_code": "0x06" },
            "dc_contactor_control": { "address": 401, "function_code": "0x06" }
        }
    }))
    .unwrap()
}

fn handler_at(addr: SocketAddr, kind: DeviceKind, map: RegisterMap) -> DeviceHandler {
    let config = DeviceConfig {
        name: format!("{kind}-1"),
        device_type: kind,
        ip: addr.ip().to_string(),
        port: addr.port(),
        slave_id: 1,
        poll_interval: 1,
    };
    DeviceHandler::new(&config, map, Duration::from_secs(2))
}

#[tokio::test]
async fn test_read_sweep_decodes_types() {
    let device = FakeDevice::new();
    device.set_register(256, 750); // 75.0 %
    device.set_register(300, 0xFFF6); // -10 as int16
    device.set_register(310, 0x0001); // high word
    device.set_register(311, 0x0002); // low word
    let addr = spawn_device(device).await;

    let handler = handler_at(addr, DeviceKind::Bms, bms_map());

    // Before the first sweep the snapshot shows a lazy, unopened connection.
    let status = handler.status().await;
    assert!(!status.connected);
    assert!(status.last_successful_read.is_none());

    let raw = handler.read_data().await.unwrap();

    assert_eq!(raw["battery_soc"], 750);
    assert_eq!(raw["rack_current"], -10);
    assert_eq!(raw["total_energy"], 0x10002);
    assert!(handler.is_connected().await);

    let status = handler.status().await;
    assert_eq!(status.name, "BMS-1");
    assert_eq!(status.device_type, DeviceKind::Bms);
    assert!(status.connected);
    assert!(status.last_successful_read.is_some());
    assert_eq!(status.poll_interval, 1);
}

#[tokio::test]
async fn test_write_register_round_trip() {
    let device = FakeDevice::new();
    let addr = spawn_device(device.clone()).await;

    let handler = handler_at(addr, DeviceKind::Bms, bms_map());
    handler.write_register("error_reset", 0x0050).await.unwrap();
    handler.control_dc_contactor(true).await.unwrap();

    assert_eq!(device.writes(), vec![(400, 0x0050), (401, 1)]);
}

#[tokio::test]
async fn test_write_rejected_without_touching_connection() {
    let device = FakeDevice::new();
    let addr = spawn_device(device.clone()).await;

    let handler = handler_at(addr, DeviceKind::Bms, bms_map());
    assert!(handler.write_register("battery_soc", 1).await.is_err());
    assert!(handler.write_register("no_such_register", 1).await.is_err());
    assert!(device.writes().is_empty());
}

#[tokio::test]
async fn test_read_failure_records_error_status() {
    // Nothing is listening on this port.
    let config = DeviceConfig {
        name: "BMS-dead".to_string(),
        device_type: DeviceKind::Bms,
        ip: "127.0.0.1".to_string(),
        port: 1, // reserved, connection refused
        slave_id: 1,
        poll_interval: 1,
    };
    let handler = DeviceHandler::new(&config, bms_map(), Duration::from_millis(500));

    let cache = SharedDataCache::new();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let transport = MqttTransport::start(
        MqttConfig {
            broker: "127.0.0.1".to_string(),
            port: 41883,
            client_id: "pms_test".to_string(),
            username: None,
            password: None,
            keepalive: 30,
            base_topic: "pms".to_string(),
            max_publish_workers: 1,
            connection_retry_count: 15,
            health_check_interval: 30,
        },
        stop_rx,
    );

    assert!(poll_and_publish(&handler, &cache, &transport).await.is_err());
    let status = cache.status("BMS-dead").await.unwrap();
    assert!(!status.connected);
    assert!(status.last_error.is_some());
    assert!(!handler.is_connected().await);
}

#[tokio::test]
async fn test_poll_pipeline_fills_cache() {
    let device = FakeDevice::new();
    device.set_register(256, 750);
    let addr = spawn_device(device).await;

    let map = bms_map();
    let handler = handler_at(addr, DeviceKind::Bms, map);

    let cache = SharedDataCache::new();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let transport = MqttTransport::start(
        MqttConfig {
            broker: "127.0.0.1".to_string(),
            port: 41884,
            client_id: "pms_test".to_string(),
            username: None,
            password: None,
            keepalive: 30,
            base_topic: "pms".to_string(),
            max_publish_workers: 1,
            connection_retry_count: 15,
            health_check_interval: 30,
        },
        stop_rx,
    );

    poll_and_publish(&handler, &cache, &transport).await.unwrap();

    let reading = cache.reading("BMS-1").await.unwrap();
    let soc = &reading.processed["battery_soc"];
    assert_eq!(soc.value.as_f64(), Some(75.0));
    assert_eq!(soc.unit, "%");
    assert_eq!(soc.raw_value, 750.0);

    // Derived fields appear alongside the mapped registers.
    assert!(reading.processed.contains_key("soc_band"));

    let payload = reading.telemetry_payload();
    assert_eq!(payload["device_name"], "BMS-1");
    assert_eq!(payload["device_type"], "BMS");
    assert_eq!(payload["data"]["battery_soc"]["value"], 75.0);
}

#[tokio::test]
async fn test_slow_device_polls_coalesce() {
    // A 2.5 s sweep against a 1 s interval must coalesce to two completed
    // polls over 5 s, never five and never overlapping.
    let device = FakeDevice::with_read_delay(Duration::from_millis(2500));
    device.set_register(256, 100);
    let addr = spawn_device(device.clone()).await;

    let map = RegisterMap::from_json(&json!({
        "metering_registers": {
            "battery_soc": {
                "address": 256,
                "function_code": "0x03",
                "scale": 0.1,
                "unit": "%"
            }
        }
    }))
    .unwrap();
    let handler = Arc::new(handler_at(addr, DeviceKind::Bms, map));

    let cache = Arc::new(SharedDataCache::new());
    let (stop_tx, stop_rx) = watch::channel(false);
    let transport = MqttTransport::start(
        MqttConfig {
            broker: "127.0.0.1".to_string(),
            port: 41885,
            client_id: "pms_test".to_string(),
            username: None,
            password: None,
            keepalive: 30,
            base_topic: "pms".to_string(),
            max_publish_workers: 1,
            connection_retry_count: 15,
            health_check_interval: 30,
        },
        stop_rx.clone(),
    );

    let mut scheduler = pms_supervisor::scheduler::PollScheduler::new(stop_rx);
    scheduler.add_polling_job(Arc::clone(&handler), Arc::clone(&cache), transport);

    tokio::time::sleep(Duration::from_millis(5200)).await;
    stop_tx.send(true).unwrap();
    scheduler.shutdown().await;

    assert_eq!(device.read_count(), 2);
}

#[tokio::test]
async fn test_control_message_dispatch() {
    let device = FakeDevice::new();
    let addr = spawn_device(device.clone()).await;

    let map = RegisterMap::from_json(&json!({
        "control_registers": {
            "operation_mode_control": { "address": 20, "function_code": "0x06" },
            "fault_reset": { "address": 21, "function_code": "0x06" },
            "power_reference": { "address": 22, "function_code": "0x06", "scale": 0.1 }
        }
    }))
    .unwrap();
    let handler = handler_at(addr, DeviceKind::Pcs, map);

    handler
        .handle_control_message(&json!({ "command": "operation_mode", "mode": "standby" }))
        .await
        .unwrap();
    handler
        .handle_control_message(&json!({ "command": "power_reference", "power_kw": 12.3 }))
        .await
        .unwrap();
    handler
        .handle_control_message(&json!({ "command": "reset_faults" }))
        .await
        .unwrap();

    assert_eq!(device.writes(), vec![(20, 3), (22, 123), (21, 1)]);
}
