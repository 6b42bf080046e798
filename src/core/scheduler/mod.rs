// src/core/scheduler/mod.rs

//! The main reconciliation loop. Leader-gated: re-reads the rank-table,
//! diffs it against the status store, hands membership changes to the
//! fault manager and role drift to the switcher, and keeps the
//! coordinators' view of the cluster current.

pub mod dp_group;
pub mod init;
pub mod recovery;
pub mod role_unknown;

use crate::config::{Config, DeployMode};
use crate::core::alarm::{AlarmKind, AlarmReporter};
use crate::core::clusterd::ClusterClient;
use crate::core::controller::Shutdown;
use crate::core::coordinator::CoordinatorStore;
use crate::core::faults::FaultManager;
use crate::core::leader::LeaderFlag;
use crate::core::process::ProcessManager;
use crate::core::ranktable::RankTableLoader;
use crate::core::requests::{CoordinatorRequestHandler, ServerRequestHandler};
use crate::core::roles::{RoleManager, RoleSwitcher};
use crate::core::status::{NodeStatus, Role, RoleState};
use crate::core::constants::{RANK_TABLE_MONITOR_INTERVAL, SCHEDULER_ALARM_INTERVAL};
use crate::core::faults::npu::NpuRecoveryManager;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Ids whose workers reported an UNKNOWN role state, bucketed by the role
/// the controller intends for them.
#[derive(Debug, Default)]
pub(crate) struct RoleUnknownSets {
    pub prefill: Vec<u64>,
    pub decode: Vec<u64>,
    pub flex: Vec<u64>,
}

impl RoleUnknownSets {
    fn is_empty(&self) -> bool {
        self.prefill.is_empty() && self.decode.is_empty() && self.flex.is_empty()
    }
}

pub struct NodeScheduler {
    pub(crate) config: Config,
    pub(crate) status: Arc<NodeStatus>,
    pub(crate) coordinator_store: Arc<CoordinatorStore>,
    pub(crate) servers: ServerRequestHandler,
    pub(crate) coordinators: CoordinatorRequestHandler,
    pub(crate) loader: Arc<RankTableLoader>,
    pub(crate) switcher: Arc<RoleSwitcher>,
    pub(crate) faults: Arc<FaultManager>,
    pub(crate) role_manager: RoleManager,
    pub(crate) process: ProcessManager,
    pub(crate) leader: Arc<LeaderFlag>,
    pub(crate) npu: Arc<NpuRecoveryManager>,
    pub(crate) cluster: Arc<ClusterClient>,
    pub(crate) alarms: AlarmReporter,
    pub(crate) shutdown: Arc<Shutdown>,
    pub(crate) role_unknown: Mutex<RoleUnknownSets>,
    /// Latest request-length summary observed from the master coordinator;
    /// feeds the decision engine instead of the configured defaults once
    /// real traffic has been seen.
    pub(crate) request_summary: Mutex<Option<(usize, usize)>>,
    /// Set by the monitor task when the rank-table file changes; wakes the
    /// loop out of its detection wait.
    ranktable_changed: AtomicBool,
    last_fingerprint: Mutex<Option<u64>>,
    membership_alarm_raised: AtomicBool,
}

impl NodeScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        status: Arc<NodeStatus>,
        coordinator_store: Arc<CoordinatorStore>,
        servers: ServerRequestHandler,
        coordinators: CoordinatorRequestHandler,
        loader: Arc<RankTableLoader>,
        switcher: Arc<RoleSwitcher>,
        faults: Arc<FaultManager>,
        role_manager: RoleManager,
        process: ProcessManager,
        leader: Arc<LeaderFlag>,
        npu: Arc<NpuRecoveryManager>,
        cluster: Arc<ClusterClient>,
        alarms: AlarmReporter,
        shutdown: Arc<Shutdown>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            status,
            coordinator_store,
            servers,
            coordinators,
            loader,
            switcher,
            faults,
            role_manager,
            process,
            leader,
            npu,
            cluster,
            alarms,
            shutdown,
            role_unknown: Mutex::new(RoleUnknownSets::default()),
            request_summary: Mutex::new(None),
            ranktable_changed: AtomicBool::new(false),
            last_fingerprint: Mutex::new(None),
            membership_alarm_raised: AtomicBool::new(false),
        })
    }

    /// The scheduler main task. Returns only on shutdown or a fatal
    /// bring-up failure.
    pub async fn run(self: Arc<Self>) {
        self.wait_until_leader().await;
        if !self.shutdown.is_running() {
            return;
        }
        self.wait_for_initial_ranktable().await;

        if let Err(e) = self.init_server_cluster().await {
            warn!("Cluster bring-up failed: {e}");
            return;
        }
        self.process.save(&self.status, self.loader.id_map_snapshot());

        while self.shutdown.is_running() {
            if !self.leader.is_leader() {
                self.wait_until_leader().await;
                continue;
            }
            if self.npu.is_recovering() {
                debug!("NPU recovery in progress; skipping this pass");
                self.wait().await;
                continue;
            }

            match self.config.deploy_mode {
                DeployMode::PdSeparate => self.run_for_pd_separate().await,
                DeployMode::SingleNode => self.run_for_single_node().await,
            }
            self.wait().await;
        }
        info!("Node scheduler stopped");
    }

    async fn wait_until_leader(&self) {
        while self.shutdown.is_running() && !self.leader.is_leader() {
            tokio::select! {
                _ = self.leader.wait_until_leader() => {}
                _ = sleep(Duration::from_secs(1)) => {}
            }
        }
    }

    /// Blocks until the cluster daemon has written an initial rank-table,
    /// bounded by the cluster synchronization window. An operator-provided
    /// file on disk also satisfies the wait.
    async fn wait_for_initial_ranktable(&self) {
        let deadline =
            tokio::time::Instant::now() + self.config.timing.cluster_synchronization;
        while self.shutdown.is_running() && tokio::time::Instant::now() < deadline {
            if self.cluster.has_saved_ranktable() || self.loader.path().exists() {
                return;
            }
            sleep(Duration::from_secs(1)).await;
        }
        warn!("Proceeding without a daemon-provided rank-table");
    }

    async fn run_for_pd_separate(&self) {
        let centralized = !self.config.is_multi_node_mode();
        if centralized {
            self.process_role_unknown().await;
        }

        self.faults.process_recorded_faults();
        self.reconcile_membership().await;

        if centralized {
            self.process_role_decision_changes().await;
        }

        match self.coordinators.coordinator_info().await {
            Ok(info) => {
                let lengths = &info.request_length_info;
                if lengths.input_len > 0 || lengths.output_len > 0 {
                    *self.request_summary.lock() =
                        Some((lengths.input_len, lengths.output_len));
                }
            }
            Err(e) => debug!("Coordinator info poll failed: {e}"),
        }
    }

    async fn run_for_single_node(&self) {
        self.faults.process_recorded_faults();
        self.reconcile_membership().await;
    }

    /// Loads the rank-table, diffs it against the store, and hands the
    /// changes to the fault manager. Load failures are recovered by the
    /// next iteration.
    async fn reconcile_membership(&self) {
        let loaded = match self.loader.load() {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("Rank-table reload failed: {e}");
                return;
            }
        };
        self.coordinator_store.replace(loaded.coordinators.clone());

        let snapshot: Vec<u64> = loaded.nodes.iter().map(|n| n.id).collect();
        let changes = self.status.detect_node_changes(&snapshot);
        if !changes.is_empty() {
            self.status.mark_ranktable_change();
            self.faults.scaling_instance(&loaded.nodes, &changes).await;
        }
        self.record_unknown_roles();
    }

    /// Buckets nodes whose workers reported UNKNOWN so the next pass can
    /// repair them.
    fn record_unknown_roles(&self) {
        let mut sets = self.role_unknown.lock();
        for node in self.status.all_nodes() {
            if node.is_deleted() || !node.is_healthy || node.role_state != RoleState::Unknown {
                continue;
            }
            let bucket = match node.role {
                Role::Prefill => &mut sets.prefill,
                Role::Decode => &mut sets.decode,
                Role::Flex => &mut sets.flex,
                Role::Undefined => continue,
            };
            if !bucket.contains(&node.id) {
                bucket.push(node.id);
            }
        }
        if !sets.is_empty() {
            debug!(
                prefill = sets.prefill.len(),
                decode = sets.decode.len(),
                flex = sets.flex.len(),
                "Role-unknown nodes recorded"
            );
        }
    }

    /// Applies any fresh decision batch from the engine as on-line role
    /// switches.
    async fn process_role_decision_changes(&self) {
        let decisions = self.role_manager.take_decisions();
        for decision in decisions {
            let Some(node) = self.status.node(decision.id) else {
                continue;
            };
            let unchanged = node.role == decision.role
                && (decision.role != Role::Flex
                    || node.static_info.flex_p_ratio == decision.flex_p_ratio);
            if unchanged {
                continue;
            }
            if let Err(e) = self.switcher.process_single_role_switching(decision).await {
                warn!(id = decision.id, "Role switch rejected: {e}");
                self.alarms
                    .raise(AlarmKind::RoleSwitchFailed, &format!("node {}: {e}", decision.id))
                    .await;
            }
        }
    }

    /// The inter-iteration wait: one-second polling so shutdown and
    /// rank-table signals are observed promptly.
    pub(crate) async fn wait(&self) {
        let rounds = self.config.timing.rank_table_detecting.as_secs().max(1);
        for _ in 0..rounds {
            if !self.shutdown.is_running() || self.ranktable_changed.swap(false, Ordering::SeqCst)
            {
                return;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    /// Background task: fingerprints the rank-table file and signals the
    /// loop when it changes.
    pub async fn monitor_rank_table(self: Arc<Self>) {
        while self.shutdown.is_running() {
            if let Some(fingerprint) = self.loader.fingerprint() {
                let mut last = self.last_fingerprint.lock();
                if last.map(|f| f != fingerprint).unwrap_or(true) {
                    *last = Some(fingerprint);
                    self.ranktable_changed.store(true, Ordering::SeqCst);
                    debug!("Rank-table fingerprint changed");
                }
            }
            sleep(RANK_TABLE_MONITOR_INTERVAL).await;
        }
    }

    /// Background task: raises a membership alarm while the live table and
    /// the store disagree, and clears it once they converge.
    pub async fn alarm_task(self: Arc<Self>) {
        while self.shutdown.is_running() {
            if self.leader.is_leader() {
                if let Ok(loaded) = self.loader.load() {
                    let snapshot: Vec<u64> = loaded.nodes.iter().map(|n| n.id).collect();
                    let changes = self.status.detect_node_changes(&snapshot);
                    if !changes.is_empty() {
                        if !self.membership_alarm_raised.swap(true, Ordering::SeqCst) {
                            self.alarms
                                .raise(
                                    AlarmKind::MembershipChanged,
                                    &format!(
                                        "new={:?} removed={:?} reappeared={:?}",
                                        changes.new_ids, changes.removed_ids, changes.reappear_ids
                                    ),
                                )
                                .await;
                        }
                    } else if self.membership_alarm_raised.swap(false, Ordering::SeqCst) {
                        self.alarms
                            .clear(AlarmKind::MembershipChanged, "membership converged")
                            .await;
                    }
                }
            }
            sleep(SCHEDULER_ALARM_INTERVAL).await;
        }
    }
}
