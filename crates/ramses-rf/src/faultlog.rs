//! Reading a controller's fault log (`0418`)

use tracing::{debug, info};

use ramses_tx::codec::FaultLog;
use ramses_tx::{Address, Command, Payload};

use crate::error::{Result, RfError};
use crate::gateway::GatewayHandle;

/// Slots a controller keeps
pub const MAX_FAULT_LOG_ENTRIES: u8 = 64;

impl GatewayHandle {
    /// Read fault log entries, newest first, stopping at the first empty slot
    pub async fn get_faults(&self, ctl: Address, limit: u8) -> Result<Vec<FaultLog>> {
        let mut faults = Vec::new();
        for log_idx in 0..limit.min(MAX_FAULT_LOG_ENTRIES) {
            let command = Command::get_fault_log_entry(ctl, log_idx);
            let fault = match self.send_command(command.clone()).await?.payload {
                Payload::FaultLog(fault) => fault,
                other => {
                    return Err(RfError::unexpected(
                        command,
                        format!("expected a fault log entry, got {}", other.to_json()),
                    ))
                }
            };
            if fault.entry.is_none() {
                debug!(%ctl, log_idx, "End of fault log");
                break;
            }
            faults.push(fault);
        }
        info!(%ctl, entries = faults.len(), "Fault log read");
        Ok(faults)
    }
}
