// src/core/faults/mod.rs

//! Fault handling: applies fault signals recorded by the subscriber,
//! drives scale-in/out from membership diffs, and runs the non-redundant
//! scale-in timer that frees a prefill node when a decode replacement has
//! nowhere to land.

pub mod npu;
pub mod scaling;
pub mod timer;

use crate::config::{Config, DeployMode};
use crate::core::alarm::{AlarmKind, AlarmReporter};
use crate::core::process::ProcessManager;
use crate::core::ranktable::RankTableLoader;
use crate::core::requests::{CoordinatorRequestHandler, ServerRequestHandler};
use crate::core::status::{FaultKind, NodeStatus, Role};
use npu::NpuRecoveryManager;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use timer::ScaleInTimer;
use tracing::{debug, info, warn};

/// Software-observed fault categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoftwareFaultType {
    Unreachable,
}

/// Hardware fault categories reported by the cluster daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareFaultType {
    Unhealthy,
    SubHealthy,
}

/// Per-group tally of instances lost to faults, by role. Consumed by
/// scale-out to steer replacements back into the groups that lost them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GroupFaultCount {
    pub prefill: i32,
    pub decode: i32,
    pub flex: i32,
}

impl GroupFaultCount {
    fn slot_mut(&mut self, role: Role) -> Option<&mut i32> {
        match role {
            Role::Prefill => Some(&mut self.prefill),
            Role::Decode => Some(&mut self.decode),
            Role::Flex => Some(&mut self.flex),
            Role::Undefined => None,
        }
    }
}

pub struct FaultManager {
    pub(crate) config: Config,
    pub(crate) status: Arc<NodeStatus>,
    pub(crate) servers: ServerRequestHandler,
    pub(crate) coordinators: CoordinatorRequestHandler,
    pub(crate) loader: Arc<RankTableLoader>,
    pub(crate) npu: Arc<NpuRecoveryManager>,
    pub(crate) process: ProcessManager,
    pub(crate) alarms: AlarmReporter,
    pub(crate) deploy_mode: DeployMode,
    pub(crate) npu_exit_wait: Duration,
    pub(crate) server_online_attempts: u32,
    pub(crate) static_elastic_template_path: String,
    pub(crate) timer: ScaleInTimer,
    /// Guarded separately from NodeStatus: fault tallies are touched from
    /// the timer task as well as the scheduler loop.
    pub(crate) faulty_group_counts: Mutex<HashMap<u64, GroupFaultCount>>,
    registered_hardware: Mutex<HashSet<HardwareFaultType>>,
    registered_software: Mutex<HashSet<SoftwareFaultType>>,
    /// Handed to the timer task so its firings find their way back here.
    self_ref: Weak<FaultManager>,
}

impl FaultManager {
    pub fn new(
        config: &Config,
        status: Arc<NodeStatus>,
        servers: ServerRequestHandler,
        coordinators: CoordinatorRequestHandler,
        loader: Arc<RankTableLoader>,
        npu: Arc<NpuRecoveryManager>,
        process: ProcessManager,
        alarms: AlarmReporter,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|self_ref| Self {
            config: config.clone(),
            status,
            servers,
            coordinators,
            loader,
            npu,
            process,
            alarms,
            deploy_mode: config.deploy_mode,
            npu_exit_wait: config.timing.npu_exit_wait,
            server_online_attempts: config.timing.server_online_attempt_times,
            static_elastic_template_path: config.static_elastic_template_path.clone(),
            timer: ScaleInTimer::new(),
            faulty_group_counts: Mutex::new(HashMap::new()),
            registered_hardware: Mutex::new(HashSet::new()),
            registered_software: Mutex::new(HashSet::new()),
            self_ref: self_ref.clone(),
        });
        manager.register_hardware_fault_handler(HardwareFaultType::Unhealthy);
        manager.register_hardware_fault_handler(HardwareFaultType::SubHealthy);
        manager.register_software_fault_handler(SoftwareFaultType::Unreachable);
        manager
    }

    pub fn register_hardware_fault_handler(&self, fault: HardwareFaultType) {
        self.registered_hardware.lock().insert(fault);
    }

    pub fn register_software_fault_handler(&self, fault: SoftwareFaultType) {
        self.registered_software.lock().insert(fault);
    }

    /// Drains the faults the subscriber recorded and dispatches them.
    pub fn process_recorded_faults(&self) {
        for (id, kind) in self.status.take_faulty_nodes() {
            match kind {
                FaultKind::HardwareUnhealthy => {
                    self.handle_hardware_fault(id, HardwareFaultType::Unhealthy)
                }
                FaultKind::HardwareSubHealthy => {
                    self.handle_hardware_fault(id, HardwareFaultType::SubHealthy)
                }
                FaultKind::SoftwareUnreachable => {
                    self.handle_software_fault(id, SoftwareFaultType::Unreachable)
                }
            }
        }
    }

    pub fn handle_hardware_fault(&self, id: u64, fault: HardwareFaultType) {
        if !self.registered_hardware.lock().contains(&fault) {
            warn!(id, ?fault, "No handler registered for hardware fault; dropped");
            return;
        }
        match fault {
            HardwareFaultType::Unhealthy => self.unhealthy_hardware_fault_handler(id),
            HardwareFaultType::SubHealthy => self.sub_healthy_hardware_fault_handler(id),
        }
    }

    pub fn handle_software_fault(&self, id: u64, fault: SoftwareFaultType) {
        if !self.registered_software.lock().contains(&fault) {
            warn!(id, ?fault, "No handler registered for software fault; dropped");
            return;
        }
        match fault {
            SoftwareFaultType::Unreachable => {
                self.status.update_node(id, |n| n.is_healthy = false);
                info!(id, "Node marked unhealthy after software fault");
            }
        }
    }

    /// A critical hardware fault: resolve the owning instance, abort its
    /// NPU recovery, and arm the non-redundant scale-in timer.
    fn unhealthy_hardware_fault_handler(&self, id: u64) {
        let instance_id = self.status.node(id).map(|n| n.instance_id()).unwrap_or(id);
        self.npu.abort_recovery(instance_id);
        if let Some(node) = self.status.node(id) {
            self.record_group_fault(node.group_id, node.role, 1);
        }
        if let Some(manager) = self.self_ref.upgrade() {
            self.timer.start(manager);
        }
        let alarms = self.alarms.clone();
        tokio::spawn(async move {
            alarms
                .raise(AlarmKind::NodeFaultDetected, &format!("instance {instance_id}"))
                .await;
        });
        info!(id, instance_id, "Hardware fault applied; scale-in timer armed");
    }

    /// Reserved hook: sub-healthy faults are tracked upstream but carry no
    /// action yet.
    fn sub_healthy_hardware_fault_handler(&self, id: u64) {
        debug!(id, "Sub-healthy fault observed (reserved, no action)");
    }

    pub(crate) fn record_group_fault(&self, group_id: u64, role: Role, delta: i32) {
        let mut counts = self.faulty_group_counts.lock();
        let entry = counts.entry(group_id).or_default();
        if let Some(slot) = entry.slot_mut(role) {
            *slot = (*slot + delta).max(0);
        }
    }

    pub fn group_fault_counts(&self) -> HashMap<u64, GroupFaultCount> {
        self.faulty_group_counts.lock().clone()
    }

    pub fn is_scale_in_timer_active(&self) -> bool {
        self.timer.is_active()
    }

    pub fn stop(&self) {
        self.timer.stop();
    }
}
