//! Auto-recovery watchdog for BMS communication errors.
//!
//! After a long power-down the BMS can come back with its communication
//! error bit latched, which blocks the PCS from starting. The watchdog reads
//! the BMS live (not from the cache, the poll pipeline may itself be the
//! casualty), checks bit 3 of `error_code_2`, and runs a fixed recovery
//! script against the BMS and PCS when it is set.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::device::{DeviceHandler, PcsMode};
use crate::error::{Error, Result};

/// Bit index of the communication error flag in `error_code_2`.
const COMMUNICATION_ERROR_BIT: u8 = 3;

/// Watchdog status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStatus {
    /// Whether a recovery script is currently running.
    pub recovery_in_progress: bool,
    /// Number of completed recoveries since startup.
    pub total_recovery_count: u64,
    /// When a recovery script last started.
    pub last_recovery_attempt: Option<DateTime<Utc>>,
}

/// Detects the BMS communication error and runs the recovery script.
pub struct AutoRecoveryManager {
    bms: Arc<DeviceHandler>,
    pcs: Arc<DeviceHandler>,
    in_progress: AtomicBool,
    recovery_count: AtomicU64,
    last_attempt: RwLock<Option<DateTime<Utc>>>,
}

impl AutoRecoveryManager {
    /// Creates the manager over the BMS and PCS handlers.
    pub fn new(bms: Arc<DeviceHandler>, pcs: Arc<DeviceHandler>) -> Self {
        Self {
            bms,
            pcs,
            in_progress: AtomicBool::new(false),
            recovery_count: AtomicU64::new(0),
            last_attempt: RwLock::new(None),
        }
    }

    /// Returns true if `error_code_2` carries the communication error bit.
    pub fn has_communication_error(raw: &BTreeMap<String, i64>) -> bool {
        match raw.get("error_code_2") {
            Some(&value) => {
                let set = value & (1 << COMMUNICATION_ERROR_BIT) != 0;
                if set {
                    warn!(
                        error_code_2 = %format!("0x{value:04X}"),
                        "BMS communication error detected"
                    );
                }
                set
            }
            None => false,
        }
    }

    /// Checks a live BMS reading and runs the script if the error is set.
    ///
    /// Returns true when a recovery was attempted. Overlapping invocations
    /// are rejected while a script is in flight.
    pub async fn check_and_recover(&self, raw: &BTreeMap<String, i64>) -> Result<bool> {
        if !Self::has_communication_error(raw) {
            return Ok(false);
        }

        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("recovery already in progress");
            return Ok(false);
        }

        *self.last_attempt.write().await = Some(Utc::now());
        let result = self.run_script().await;
        self.in_progress.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                let total = self.recovery_count.fetch_add(1, Ordering::SeqCst) + 1;
                info!(total, "recovery script completed");
                Ok(true)
            }
            Err(e) => {
                error!(error = %e, "recovery script aborted");
                Err(e)
            }
        }
    }

    /// The fixed recovery script. Any failing step aborts the remainder.
    async fn run_script(&self) -> Result<()> {
        info!("recovery script started");

        self.bms
            .reset_errors()
            .await
            .map_err(|_| Error::RecoveryStep("bms reset_errors"))?;
        tokio::time::sleep(Duration::from_secs(2)).await;

        self.bms
            .control_dc_contactor(true)
            .await
            .map_err(|_| Error::RecoveryStep("bms dc_contactor on"))?;
        tokio::time::sleep(Duration::from_secs(3)).await;

        self.pcs
            .reset_faults()
            .await
            .map_err(|_| Error::RecoveryStep("pcs reset_faults"))?;
        tokio::time::sleep(Duration::from_secs(2)).await;

        self.pcs
            .set_pcs_mode(PcsMode::Independent)
            .await
            .map_err(|_| Error::RecoveryStep("pcs independent mode"))?;

        Ok(())
    }

    /// Status snapshot.
    pub async fn status(&self) -> RecoveryStatus {
        RecoveryStatus {
            recovery_in_progress: self.in_progress.load(Ordering::SeqCst),
            total_recovery_count: self.recovery_count.load(Ordering::SeqCst),
            last_recovery_attempt: *self.last_attempt.read().await,
        }
    }

    /// The supervised BMS handler.
    pub fn bms(&self) -> &Arc<DeviceHandler> {
        &self.bms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_communication_error_bit() {
        let mut raw = BTreeMap::new();
        raw.insert("error_code_2".to_string(), 0x0008i64);
        assert!(AutoRecoveryManager::has_communication_error(&raw));

        raw.insert("error_code_2".to_string(), 0x0007i64);
        assert!(!AutoRecoveryManager::has_communication_error(&raw));

        raw.remove("error_code_2");
        assert!(!AutoRecoveryManager::has_communication_error(&raw));
    }

    #[test]
    fn test_other_bits_do_not_trigger() {
        let mut raw = BTreeMap::new();
        // Every bit except bit 3.
        raw.insert("error_code_2".to_string(), 0xFFF7i64);
        assert!(!AutoRecoveryManager::has_communication_error(&raw));

        raw.insert("error_code_2".to_string(), 0xFFFFi64);
        assert!(AutoRecoveryManager::has_communication_error(&raw));
    }
}
