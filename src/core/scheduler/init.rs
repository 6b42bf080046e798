// src/core/scheduler/init.rs

//! First-time cluster bring-up: reload until every node answers, run the
//! decision engine, lay out groups, and perform the only mass role push
//! the controller ever does.

use super::NodeScheduler;
use super::dp_group;
use crate::config::DeployMode;
use crate::core::constants::{MAX_PD_RATE, MAX_RELOAD_RANK_TABLE_TIMES, ROLE_DECISION_WAIT, ROLE_SEND_RETRY_INTERVAL};
use crate::core::errors::ControlError;
use crate::core::ranktable::LoadedRankTable;
use crate::core::roles::decision::{EngineInputs, InstanceCollector, InstanceSnapshot};
use crate::core::roles::groups;
use crate::core::roles::RoleManager;
use crate::core::status::{
    InferenceType, Node, NodeStatus, Role, RoleDecision, RoleLabel, RoleState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

impl NodeScheduler {
    /// Bring-up entry: reloads until a table arrives whose nodes all
    /// respond (bounded), then either recovers from the persisted process
    /// file or initializes fresh.
    pub(crate) async fn init_server_cluster(&self) -> Result<(), ControlError> {
        let mut loaded: Option<LoadedRankTable> = None;
        let mut available: Vec<u64> = Vec::new();

        for attempt in 0..MAX_RELOAD_RANK_TABLE_TIMES {
            if !self.shutdown.is_running() {
                return Err(ControlError::Unavailable("shutting down".to_string()));
            }
            match self.loader.load() {
                Ok(candidate) if !candidate.nodes.is_empty() => {
                    let (avail, faulty) =
                        self.servers.get_available_nodes(&candidate.nodes, 1).await;
                    let complete = faulty.is_empty();
                    available = avail;
                    loaded = Some(candidate);
                    if complete {
                        break;
                    }
                    debug!(attempt, unreachable = faulty.len(), "Waiting for every node to answer");
                }
                Ok(_) => debug!(attempt, "Rank-table lists no workers yet"),
                Err(e) => debug!(attempt, "Rank-table not loadable yet: {e}"),
            }
            sleep(Duration::from_secs(1)).await;
        }

        let loaded = loaded.ok_or_else(|| {
            ControlError::ResourceLimit("no usable rank-table after bounded reloads".to_string())
        })?;
        self.coordinator_store.replace(loaded.coordinators.clone());

        match self.config.deploy_mode {
            DeployMode::SingleNode => self.single_mode_init(&loaded, &available).await,
            DeployMode::PdSeparate => {
                let persisted = self.process.load().unwrap_or_default();
                match persisted {
                    Some(snapshot) if snapshot.has_assigned_roles() => {
                        self.recover_server_cluster(snapshot, &loaded).await
                    }
                    _ => self.pd_mode_init(loaded).await,
                }
            }
        }
    }

    /// Single-node mode keeps no groups: reachable nodes are simply stored
    /// and published.
    async fn single_mode_init(
        &self,
        loaded: &LoadedRankTable,
        available: &[u64],
    ) -> Result<(), ControlError> {
        for node in &loaded.nodes {
            let mut stored = node.clone();
            stored.is_healthy = available.contains(&node.id);
            self.status.add_node(stored);
        }
        for id in available {
            if let Err(e) = self.servers.update_node_info(*id, true).await {
                warn!(id, "Initial info collection failed: {e}");
            }
        }
        info!(total = loaded.nodes.len(), available = available.len(), "Single-node init done");
        if let Err(e) = self.coordinators.send_node_status().await {
            warn!("Initial coordinator refresh failed: {e}");
        }
        Ok(())
    }

    /// Fresh PD bring-up.
    pub(crate) async fn pd_mode_init(&self, loaded: LoadedRankTable) -> Result<(), ControlError> {
        let mut nodes = loaded.nodes;

        self.init_multi_pd_role(&mut nodes);
        self.init_role_and_role_manager(&nodes)?;
        let decisions = self.wait_for_role_decision(nodes.len()).await?;

        let (p_rate, d_rate) = if self.config.engine.heterogeneous {
            RoleManager::derive_pd_rate(&decisions, MAX_PD_RATE)
                .unwrap_or((self.config.engine.p_rate, self.config.engine.d_rate))
        } else {
            (self.config.engine.p_rate, self.config.engine.d_rate)
        };
        info!(p_rate, d_rate, decisions = decisions.len(), "Role decisions accepted");

        let mut p_ids = Vec::new();
        let mut d_ids = Vec::new();
        let mut f_ids = Vec::new();
        for decision in &decisions {
            match decision.role {
                Role::Prefill => p_ids.push(decision.id),
                Role::Decode => d_ids.push(decision.id),
                Role::Flex => f_ids.push(decision.id),
                Role::Undefined => {}
            }
        }
        let layout = groups::generate_groups(
            &p_ids,
            &d_ids,
            &f_ids,
            self.config.engine.limit_of_nodes_per_type_in_group,
        );

        if self.config.is_multi_node_mode() {
            for decision in &decisions {
                if let Some(node) = nodes.iter_mut().find(|n| n.id == decision.id) {
                    node.role = decision.role;
                }
            }
            dp_group::allocate_all(&self.config, &mut nodes)?;
            for node in &nodes {
                self.status.update_node(node.id, |n| n.servers = node.servers.clone());
            }
        }

        // Commit the layout before any push so every payload carries the
        // final membership.
        for (group_id, group) in &layout {
            self.status.upsert_group(*group_id, group.clone());
        }
        for (group_id, group) in &layout {
            for id in &group.prefill_ids {
                self.status
                    .commit_role(*id, *group_id, Role::Prefill, RoleLabel::PrefillPrefer);
            }
            for id in &group.decode_ids {
                self.status
                    .commit_role(*id, *group_id, Role::Decode, RoleLabel::DecodePrefer);
            }
            for id in &group.flex_ids {
                self.status
                    .commit_role(*id, *group_id, Role::Flex, RoleLabel::FlexStatic);
            }
            for decision in &decisions {
                if decision.role == Role::Flex && group.flex_ids.contains(&decision.id) {
                    self.status.update_node(decision.id, |n| {
                        n.static_info.flex_p_ratio = decision.flex_p_ratio;
                    });
                }
            }
            groups::apply_group_peers(&self.status, *group_id);
        }

        self.send_role().await;
        Ok(())
    }

    /// Multi-PD pre-assignment: with different node counts per side, the
    /// instance size alone identifies the role.
    pub(crate) fn init_multi_pd_role(&self, nodes: &mut [Node]) {
        if !self.config.is_multi_node_mode() {
            return;
        }
        let p_size = self.config.multi_node.p_node_num as usize;
        let d_size = self.config.multi_node.d_node_num as usize;
        if p_size == d_size {
            return;
        }
        for node in nodes.iter_mut() {
            if node.role.is_assigned() {
                continue;
            }
            let size = node.dp_group_peers.len().max(node.servers.len());
            if size == p_size {
                node.role = Role::Prefill;
            } else if size == d_size {
                node.role = Role::Decode;
            }
        }
    }

    /// Stores the nodes and starts the decision engine over a collector
    /// that re-reports the live instance list on demand.
    pub(crate) fn init_role_and_role_manager(&self, nodes: &[Node]) -> Result<(), ControlError> {
        for node in nodes {
            if !self.status.contains(node.id) {
                let mut stored = node.clone();
                stored.is_healthy = true;
                self.status.add_node(stored);
            }
        }

        let status: Arc<NodeStatus> = self.status.clone();
        let collector: InstanceCollector = Arc::new(move || {
            status
                .all_nodes()
                .into_iter()
                .filter(|n| !n.is_deleted())
                .map(|n| InstanceSnapshot {
                    id: n.id,
                    group_id: n.group_id,
                    role: n.role,
                    hardware_type: n.hardware_type.clone(),
                })
                .collect()
        });

        let (input_len, output_len) = self.request_summary.lock().unwrap_or((
            self.config.engine.request_input_len,
            self.config.engine.request_output_len,
        ));
        let inputs = EngineInputs {
            p_rate: self.config.engine.p_rate,
            d_rate: self.config.engine.d_rate,
            has_flex: self.config.engine.has_flex,
            request_input_len: input_len,
            request_output_len: output_len,
            is_recovering: false,
        };
        self.role_manager.start(inputs, collector)
    }

    /// Blocks until the engine has decided for every server, bounded by
    /// the decision window.
    pub(crate) async fn wait_for_role_decision(
        &self,
        expected: usize,
    ) -> Result<Vec<RoleDecision>, ControlError> {
        let deadline = tokio::time::Instant::now() + ROLE_DECISION_WAIT;
        loop {
            if self.role_manager.decisions_len() >= expected {
                return Ok(self.role_manager.decisions());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ControlError::Unavailable(format!(
                    "decision engine produced {}/{} decisions in time",
                    self.role_manager.decisions_len(),
                    expected
                )));
            }
            sleep(Duration::from_millis(200)).await;
        }
    }

    /// The mass role push: per group, bounded retry rounds followed by a
    /// READY wait; nodes that never link up land in the faulty set and
    /// their group sheds them before the coordinators are told.
    pub(crate) async fn send_role(&self) {
        let layout = self.status.groups();
        let mut all_faulty: Vec<u64> = Vec::new();

        for (group_id, group) in &layout {
            let members: Vec<u64> = group
                .prefill_ids
                .iter()
                .chain(group.decode_ids.iter())
                .chain(group.flex_ids.iter())
                .copied()
                .collect();
            if members.is_empty() {
                continue;
            }
            let ready = self.send_pd_role_within_attempt(&members).await;
            let faulty: Vec<u64> = members
                .iter()
                .copied()
                .filter(|id| !ready.contains(id))
                .collect();
            self.update_node_status_after_send_role(*group_id, &ready, &faulty);
            all_faulty.extend(faulty);
        }

        if !all_faulty.is_empty() {
            warn!(?all_faulty, "Nodes failed bring-up and were shed from their groups");
        }
        if let Err(e) = self.coordinators.send_node_status().await {
            warn!("Coordinator refresh after role push failed: {e}");
        }
        self.process.save(&self.status, self.loader.id_map_snapshot());
    }

    /// Bounded retry rounds for one group's members, then a READY check
    /// for everyone that accepted the post.
    pub(crate) async fn send_pd_role_within_attempt(&self, members: &[u64]) -> Vec<u64> {
        let mut remaining: Vec<u64> = members.to_vec();
        let mut posted: Vec<u64> = Vec::new();
        for round in 0..self.config.timing.init_role_attempt_times.max(1) {
            let success = self.servers.batch_post_role(&remaining).await;
            posted.extend(success.iter().copied());
            remaining.retain(|id| !success.contains(id));
            if remaining.is_empty() {
                break;
            }
            debug!(round, pending = remaining.len(), "Retrying role posts");
            sleep(ROLE_SEND_RETRY_INTERVAL).await;
        }
        self.servers.check_status(&posted, true).await
    }

    /// Commits the outcome of a group's push: verified members become
    /// READY/AVAILABLE, the rest are marked unhealthy and shed.
    pub(crate) fn update_node_status_after_send_role(
        &self,
        group_id: u64,
        ready: &[u64],
        faulty: &[u64],
    ) {
        for id in ready {
            self.status.update_node(*id, |n| {
                n.role_state = RoleState::Ready;
                n.inference_type = InferenceType::Available;
                n.is_initialized = true;
            });
        }
        for id in faulty {
            self.status.update_node(*id, |n| {
                n.is_healthy = false;
                n.role_state = RoleState::Unknown;
            });
            self.status.remove_from_group(group_id, *id);
        }
        if !faulty.is_empty() {
            groups::apply_group_peers(&self.status, group_id);
        }
    }
}
