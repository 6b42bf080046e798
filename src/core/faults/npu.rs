// src/core/faults/npu.rs

//! Tracks NPU recovery attempts per instance. A critical hardware fault
//! aborts any in-flight recovery for the owning instance; the scheduler
//! skips its reconciliation pass while a recovery is running.

use crate::core::clusterd::validate::FaultLevel;
use dashmap::DashSet;
use tracing::info;

#[derive(Debug, Default)]
pub struct NpuRecoveryManager {
    recovering: DashSet<u64>,
}

impl NpuRecoveryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Levels severe enough to count as a hardware UNHEALTHY fault.
    pub fn has_critical_fault_level(&self, level: FaultLevel) -> bool {
        level == FaultLevel::UnHealthy
    }

    pub fn start_recovery(&self, instance_id: u64) -> bool {
        let inserted = self.recovering.insert(instance_id);
        if inserted {
            info!(instance_id, "NPU recovery started");
        }
        inserted
    }

    pub fn abort_recovery(&self, instance_id: u64) {
        if self.recovering.remove(&instance_id).is_some() {
            info!(instance_id, "NPU recovery aborted");
        }
    }

    pub fn finish_recovery(&self, instance_id: u64) {
        self.recovering.remove(&instance_id);
    }

    pub fn is_recovering(&self) -> bool {
        !self.recovering.is_empty()
    }
}
