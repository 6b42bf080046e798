// src/core/roles/switcher.rs

//! On-line role transitions. A switch is a staged protocol: drain the
//! switching instance through the coordinator, verify the peer-side task
//! accounting, rewrite group membership and peer lists under the store
//! lock, push the new roles with bounded retries, and only then publish
//! the updated view. Every stage has an abort path that restores the
//! previous picture.

use crate::config::Config;
use crate::core::constants::ROLE_SEND_RETRY_INTERVAL;
use crate::core::errors::ControlError;
use crate::core::process::ProcessManager;
use crate::core::ranktable::RankTableLoader;
use crate::core::requests::coordinator::RoleChangeType;
use crate::core::requests::{CoordinatorRequestHandler, ServerRequestHandler};
use crate::core::roles::groups;
use crate::core::status::{
    InferenceType, Node, NodeStatus, Role, RoleDecision, RoleLabel, RoleState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Which side of the P/D split a flex ratio pins the node to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlexPolarity {
    PrefillOnly,
    DecodeOnly,
    Mixed,
}

fn flex_polarity(ratio: u32) -> FlexPolarity {
    match ratio {
        0 => FlexPolarity::DecodeOnly,
        100 => FlexPolarity::PrefillOnly,
        _ => FlexPolarity::Mixed,
    }
}

pub struct RoleSwitcher {
    status: Arc<NodeStatus>,
    servers: ServerRequestHandler,
    coordinators: CoordinatorRequestHandler,
    process: ProcessManager,
    loader: Arc<RankTableLoader>,
    init_role_attempt_times: u32,
    tasks_end_wait: Duration,
}

impl RoleSwitcher {
    pub fn new(
        config: &Config,
        status: Arc<NodeStatus>,
        servers: ServerRequestHandler,
        coordinators: CoordinatorRequestHandler,
        process: ProcessManager,
        loader: Arc<RankTableLoader>,
    ) -> Self {
        Self {
            status,
            servers,
            coordinators,
            process,
            loader,
            init_role_attempt_times: config.timing.init_role_attempt_times,
            tasks_end_wait: config.timing.tasks_end_wait,
        }
    }

    /// Applies one decision from the engine. Rejected outright when the
    /// node is missing, unhealthy, or already at the target.
    pub async fn process_single_role_switching(
        &self,
        decision: RoleDecision,
    ) -> Result<(), ControlError> {
        let node = self
            .status
            .node(decision.id)
            .ok_or_else(|| ControlError::NotFound(format!("node {}", decision.id)))?;
        if !node.is_healthy || node.is_deleted() {
            return Err(ControlError::Unavailable(format!(
                "node {} is not healthy enough to switch",
                decision.id
            )));
        }
        if node.role == decision.role
            && (decision.role != Role::Flex
                || node.static_info.flex_p_ratio == decision.flex_p_ratio)
        {
            return Ok(());
        }

        match (node.role, decision.role) {
            (_, Role::Flex) => self.switch_flex(&node, &decision).await,
            (Role::Prefill, Role::Decode) => self.switch_p_to_d(&node, &decision).await,
            (Role::Decode, Role::Prefill) => self.switch_d_to_p(&node, &decision).await,
            (from, to) => Err(ControlError::InvalidInput(format!(
                "unsupported transition {from} -> {to} for node {}",
                decision.id
            ))),
        }
    }

    /// Takes the instance out of rotation and waits for its task count to
    /// drain. On timeout the instance is put back online and the switch
    /// aborts.
    async fn old_instance_offline(&self, id: u64) -> Result<(), ControlError> {
        self.coordinators.offline(&[id]).await?;
        let deadline = tokio::time::Instant::now() + self.tasks_end_wait;
        loop {
            match self.coordinators.tasks(&[id]).await {
                Ok(tasks) if tasks.iter().all(|t| *t <= 0) => return Ok(()),
                Ok(_) => {}
                Err(e) => warn!(id, "Task poll failed during drain: {e}"),
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(id, "Tasks did not drain in time; re-onlining");
                if let Err(e) = self.coordinators.online(&[id]).await {
                    warn!(id, "Re-online after drain timeout failed: {e}");
                }
                return Err(ControlError::Unavailable(format!(
                    "node {id} still has tasks after drain window"
                )));
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    /// Pushes roles to every affected id with bounded retry rounds, then
    /// waits for READY. Ids that answered OK are not re-posted in later
    /// rounds, so each node sees at most one payload per attempt cycle.
    async fn send_switched_pd_roles(&self, ids: &[u64]) -> Result<Vec<u64>, ControlError> {
        let mut remaining: Vec<u64> = ids.to_vec();
        let mut posted = Vec::new();
        for round in 0..self.init_role_attempt_times.max(1) {
            let success = self.servers.batch_post_role(&remaining).await;
            posted.extend(success.iter().copied());
            remaining.retain(|id| !success.contains(id));
            if remaining.is_empty() {
                break;
            }
            warn!(round, pending = remaining.len(), "Role pushes pending; retrying");
            sleep(ROLE_SEND_RETRY_INTERVAL).await;
        }

        let ready = self.servers.check_status(&posted, true).await;
        for id in &ready {
            self.status.update_node(*id, |n| {
                n.role_state = RoleState::Ready;
                if n.role == Role::Prefill {
                    n.inference_type = InferenceType::Available;
                }
            });
        }
        if ready.len() != ids.len() {
            warn!(
                expected = ids.len(),
                ready = ready.len(),
                "Some nodes did not confirm the switched role"
            );
        }
        Ok(ready)
    }

    async fn publish(&self) {
        if let Err(e) = self.coordinators.send_node_status().await {
            warn!("Coordinator refresh after switch failed: {e}");
        }
        self.process.save(&self.status, self.loader.id_map_snapshot());
    }

    async fn switch_flex(&self, node: &Node, decision: &RoleDecision) -> Result<(), ControlError> {
        let old_ratio = node.static_info.flex_p_ratio;
        let flipped = node.role == Role::Flex
            && flex_polarity(old_ratio) != flex_polarity(decision.flex_p_ratio);

        if flipped || node.role != Role::Flex {
            self.old_instance_offline(node.id).await?;
            // A polarity flip reverses the traffic direction; the peers'
            // queues must be empty before the node rebinds.
            if !self
                .servers
                .wait_for_queue_drain(&node.dynamic_info.peers, self.tasks_end_wait)
                .await
            {
                if let Err(e) = self.coordinators.online(&[node.id]).await {
                    warn!(id = node.id, "Re-online after drain timeout failed: {e}");
                }
                return Err(ControlError::Unavailable(format!(
                    "peers of node {} did not drain before the flex switch",
                    node.id
                )));
            }
        }

        self.status.update_node(node.id, |n| {
            n.static_info.flex_p_ratio = decision.flex_p_ratio;
            n.role_state = RoleState::Switching;
        });
        self.status
            .commit_role(node.id, decision.group_id, Role::Flex, RoleLabel::FlexStatic);
        groups::apply_group_peers(&self.status, decision.group_id);

        let ready = self.send_switched_pd_roles(&[node.id]).await?;
        if ready.is_empty() {
            return Err(ControlError::Unavailable(format!(
                "flex switch of node {} did not reach READY",
                node.id
            )));
        }
        if let Err(e) = self.coordinators.online(&[node.id]).await {
            warn!(id = node.id, "Re-online after flex switch failed: {e}");
        }
        info!(id = node.id, ratio = decision.flex_p_ratio, "Flex switch complete");
        self.publish().await;
        Ok(())
    }

    async fn switch_p_to_d(&self, node: &Node, decision: &RoleDecision) -> Result<(), ControlError> {
        let group_id = decision.group_id;
        let group = self
            .status
            .group(group_id)
            .ok_or_else(|| ControlError::NotFound(format!("group {group_id}")))?;

        // Drain the prefill node that is about to become a decode.
        self.old_instance_offline(node.id).await?;

        // Verify the peer-side accounting: any (new D, old D) pair that
        // still carries tasks vetoes the switch.
        for old_d in &group.decode_ids {
            let drained = self
                .coordinators
                .query_tasks(node.id, *old_d, RoleChangeType::PrefillToDecode)
                .await
                .unwrap_or(false);
            if !drained {
                warn!(
                    switching = node.id,
                    old_decode = old_d,
                    "Peer tasks still active; reverting switch"
                );
                self.revert_to_ready(&group.decode_ids).await;
                if let Err(e) = self.coordinators.online(&[node.id]).await {
                    warn!(id = node.id, "Re-online after veto failed: {e}");
                }
                return Err(ControlError::Unavailable(format!(
                    "peer tasks between {} and {old_d} still active",
                    node.id
                )));
            }
        }

        let p_nodes: Vec<u64> = group
            .prefill_ids
            .iter()
            .copied()
            .filter(|id| *id != node.id)
            .collect();
        let mut d_nodes = group.decode_ids.clone();
        d_nodes.push(node.id);

        // Rewrite membership and peers in one pass before anything is
        // pushed, so every payload below already carries the final lists.
        self.status
            .commit_role(node.id, group_id, Role::Decode, RoleLabel::DecodeStatic);
        self.status.update_node(node.id, |n| {
            n.role_state = RoleState::Switching;
        });
        for old_d in &group.decode_ids {
            self.status.update_node(*old_d, |n| {
                n.role_state = RoleState::Ready;
            });
        }
        for old_p in &p_nodes {
            self.status.update_node(*old_p, |n| {
                n.role_state = RoleState::Switching;
                n.inference_type = InferenceType::PrefillUpdatingPeers;
            });
        }
        groups::apply_group_peers(&self.status, group_id);

        let mut affected = vec![node.id];
        affected.extend(group.decode_ids.iter().copied());
        affected.extend(p_nodes.iter().copied());
        self.send_switched_pd_roles(&affected).await?;

        if let Err(e) = self.coordinators.online(&[node.id]).await {
            warn!(id = node.id, "Re-online after switch failed: {e}");
        }
        info!(
            id = node.id,
            group = group_id,
            prefill = p_nodes.len(),
            decode = d_nodes.len(),
            "Prefill-to-decode switch complete"
        );
        self.publish().await;
        Ok(())
    }

    async fn switch_d_to_p(&self, node: &Node, decision: &RoleDecision) -> Result<(), ControlError> {
        let group_id = decision.group_id;
        let group = self
            .status
            .group(group_id)
            .ok_or_else(|| ControlError::NotFound(format!("group {group_id}")))?;

        self.old_instance_offline(node.id).await?;

        for old_p in &group.prefill_ids {
            let drained = self
                .coordinators
                .query_tasks(*old_p, node.id, RoleChangeType::DecodeToPrefill)
                .await
                .unwrap_or(false);
            if !drained {
                warn!(
                    switching = node.id,
                    old_prefill = old_p,
                    "Peer tasks still active; reverting switch"
                );
                self.revert_to_ready(&group.prefill_ids).await;
                if let Err(e) = self.coordinators.online(&[node.id]).await {
                    warn!(id = node.id, "Re-online after veto failed: {e}");
                }
                return Err(ControlError::Unavailable(format!(
                    "peer tasks between {old_p} and {} still active",
                    node.id
                )));
            }
        }

        let d_nodes: Vec<u64> = group
            .decode_ids
            .iter()
            .copied()
            .filter(|id| *id != node.id)
            .collect();

        self.status
            .commit_role(node.id, group_id, Role::Prefill, RoleLabel::PrefillStatic);
        self.status.update_node(node.id, |n| {
            n.role_state = RoleState::Switching;
            n.inference_type = InferenceType::PrefillUpdatingPeers;
        });
        for old_d in &d_nodes {
            self.status.update_node(*old_d, |n| {
                n.role_state = RoleState::Ready;
            });
        }
        for old_p in &group.prefill_ids {
            self.status.update_node(*old_p, |n| {
                n.role_state = RoleState::Switching;
                n.inference_type = InferenceType::PrefillUpdatingPeers;
            });
        }
        groups::apply_group_peers(&self.status, group_id);

        let mut affected = vec![node.id];
        affected.extend(group.prefill_ids.iter().copied());
        affected.extend(d_nodes.iter().copied());
        self.send_switched_pd_roles(&affected).await?;

        if let Err(e) = self.coordinators.online(&[node.id]).await {
            warn!(id = node.id, "Re-online after switch failed: {e}");
        }
        info!(id = node.id, group = group_id, "Decode-to-prefill switch complete");
        self.publish().await;
        Ok(())
    }

    /// Restores a set of untouched nodes to READY with their original peer
    /// sets after a vetoed switch.
    async fn revert_to_ready(&self, ids: &[u64]) {
        for id in ids {
            self.status.update_node(*id, |n| n.role_state = RoleState::Ready);
            if let Err(e) = self.servers.post_single_role_by_id(*id).await {
                warn!(id, "Revert role post failed: {e}");
            }
        }
    }

    /// Repairs a node whose on-wire role disagrees with the persisted group
    /// assignment after a controller restart. The server survived and
    /// refuses mismatched traffic on its own, so only the in-memory picture
    /// is mutated; no coordinator offline dance, no role post.
    pub fn update_abnormal_role_when_recovering(&self, node_id: u64, reported: Role) {
        let Some(node) = self.status.node(node_id) else {
            return;
        };
        if node.role == reported || !reported.is_assigned() {
            return;
        }
        info!(
            id = node_id,
            persisted = %node.role,
            reported = %reported,
            "Reconciling persisted role with the server's view"
        );
        let label = match reported {
            Role::Prefill => RoleLabel::PrefillStatic,
            Role::Decode => RoleLabel::DecodeStatic,
            _ => RoleLabel::FlexStatic,
        };
        self.status.commit_role(node_id, node.group_id, reported, label);
        groups::apply_group_peers(&self.status, node.group_id);
    }
}
