//! Auto-recovery script tests against in-process Modbus/TCP devices.

mod common;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{spawn_device, FakeDevice};
use pms_supervisor::config::DeviceConfig;
use pms_supervisor::device::{DeviceHandler, DeviceKind};
use pms_supervisor::recovery::AutoRecoveryManager;
use pms_supervisor::register_map::RegisterMap;

fn bms_map() -> RegisterMap {
    RegisterMap::from_json(&json!({
        "control_registers": {
            "error_reset": { "address": 400, "function_code": "0x06" },
            "dc_contactor_control": { "address": 401, "function_code": "0x06" }
        }
    }))
    .unwrap()
}

fn pcs_map() -> RegisterMap {
    RegisterMap::from_json(&json!({
        "control_registers": {
            "fault_reset": { "address": 27, "function_code": "0x06" },
            "operation_mode_control": { "address": 26, "function_code": "0x06" }
        }
    }))
    .unwrap()
}

fn handler_at(addr: SocketAddr, name: &str, kind: DeviceKind, map: RegisterMap) -> Arc<DeviceHandler> {
    let config = DeviceConfig {
        name: name.to_string(),
        device_type: kind,
        ip: addr.ip().to_string(),
        port: addr.port(),
        slave_id: 1,
        poll_interval: 1,
    };
    Arc::new(DeviceHandler::new(&config, map, Duration::from_secs(2)))
}

#[tokio::test]
async fn test_recovery_script_order() {
    let bms_device = FakeDevice::new();
    let pcs_device = FakeDevice::new();
    let bms_addr = spawn_device(bms_device.clone()).await;
    let pcs_addr = spawn_device(pcs_device.clone()).await;

    let bms = handler_at(bms_addr, "BMS-1", DeviceKind::Bms, bms_map());
    let pcs = handler_at(pcs_addr, "PCS-1", DeviceKind::Pcs, pcs_map());
    let recovery = AutoRecoveryManager::new(bms, pcs);

    // Bit 3 of error_code_2 set: communication error.
    let raw = BTreeMap::from([("error_code_2".to_string(), 0x0008i64)]);
    let attempted = recovery.check_and_recover(&raw).await.unwrap();
    assert!(attempted);

    // reset_errors (magic 0x0050), then DC contactor on.
    assert_eq!(bms_device.writes(), vec![(400, 0x0050), (401, 1)]);
    // fault reset, then independent mode (4).
    assert_eq!(pcs_device.writes(), vec![(27, 1), (26, 4)]);

    let status = recovery.status().await;
    assert_eq!(status.total_recovery_count, 1);
    assert!(!status.recovery_in_progress);
    assert!(status.last_recovery_attempt.is_some());
}

#[tokio::test]
async fn test_no_recovery_without_error_bit() {
    let bms_device = FakeDevice::new();
    let pcs_device = FakeDevice::new();
    let bms_addr = spawn_device(bms_device.clone()).await;
    let pcs_addr = spawn_device(pcs_device.clone()).await;

    let bms = handler_at(bms_addr, "BMS-1", DeviceKind::Bms, bms_map());
    let pcs = handler_at(pcs_addr, "PCS-1", DeviceKind::Pcs, pcs_map());
    let recovery = AutoRecoveryManager::new(bms, pcs);

    // Other bits set but not bit 3.
    let raw = BTreeMap::from([("error_code_2".to_string(), 0x0007i64)]);
    assert!(!recovery.check_and_recover(&raw).await.unwrap());

    // No error register at all.
    let raw = BTreeMap::new();
    assert!(!recovery.check_and_recover(&raw).await.unwrap());

    assert!(bms_device.writes().is_empty());
    assert!(pcs_device.writes().is_empty());
    assert_eq!(recovery.status().await.total_recovery_count, 0);
}

#[tokio::test]
async fn test_failed_step_aborts_script() {
    // BMS map lacks the contactor register: step 2 fails after step 1.
    let broken_map = RegisterMap::from_json(&json!({
        "control_registers": {
            "error_reset": { "address": 400, "function_code": "0x06" }
        }
    }))
    .unwrap();

    let bms_device = FakeDevice::new();
    let pcs_device = FakeDevice::new();
    let bms_addr = spawn_device(bms_device.clone()).await;
    let pcs_addr = spawn_device(pcs_device.clone()).await;

    let bms = handler_at(bms_addr, "BMS-1", DeviceKind::Bms, broken_map);
    let pcs = handler_at(pcs_addr, "PCS-1", DeviceKind::Pcs, pcs_map());
    let recovery = AutoRecoveryManager::new(bms, pcs);

    let raw = BTreeMap::from([("error_code_2".to_string(), 0x0008i64)]);
    assert!(recovery.check_and_recover(&raw).await.is_err());

    // The PCS steps never ran.
    assert!(pcs_device.writes().is_empty());
    let status = recovery.status().await;
    assert_eq!(status.total_recovery_count, 0);
    assert!(!status.recovery_in_progress);
}
