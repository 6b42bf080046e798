// src/core/faults/scaling.rs

//! Scale-in and scale-out driven by rank-table membership diffs, plus the
//! non-redundant scale-in strategy behind the timer.

use super::FaultManager;
use crate::config::DeployMode;
use crate::core::constants::GROUP_NOT_SCALED_OUT;
use crate::core::errors::ControlError;
use crate::core::roles::groups as group_util;
use crate::core::status::{
    InferenceType, Node, NodeChanges, Role, RoleLabel, RoleState,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Direction of a group update; scale-out inserts an NPU-exit grace
/// between the new-node pushes and the old-node peer updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    ScaleIn,
    ScaleOut,
}

/// Static elastic-scaling template consulted by non-redundant scale-in.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ElasticPdCount {
    #[serde(default)]
    pub expected_prefill_count: i64,
    #[serde(default)]
    pub expected_decode_count: i64,
}

/// Per-group update unit: which members are new and which only need to
/// learn the reduced/extended peer set.
#[derive(Debug, Clone, Default)]
struct GroupUpdateMsg {
    new_ids: Vec<u64>,
    old_ids: Vec<u64>,
}

impl FaultManager {
    /// Entry point from the scheduler loop: applies one membership diff.
    pub async fn scaling_instance(
        &self,
        server_nodes: &[Node],
        changes: &NodeChanges,
    ) {
        if changes.is_empty() {
            return;
        }
        info!(
            new = changes.new_ids.len(),
            removed = changes.removed_ids.len(),
            reappear = changes.reappear_ids.len(),
            "Applying membership changes"
        );
        if !changes.removed_ids.is_empty() {
            self.process_scale_in(changes).await;
        }
        if !changes.new_ids.is_empty() || !changes.reappear_ids.is_empty() {
            self.process_scale_out(server_nodes, changes).await;
        }
    }

    /// Tombstones removed ids, books the loss per group/role, shrinks the
    /// groups, and tells the survivors about the reduced peer set.
    async fn process_scale_in(&self, changes: &NodeChanges) {
        let mut changed_groups: BTreeMap<u64, GroupUpdateMsg> = BTreeMap::new();
        for id in &changes.removed_ids {
            let Some(node) = self.status.node(*id) else {
                continue;
            };
            self.status.update_delete_time(*id, true);
            self.record_group_fault(node.group_id, node.role, 1);
            self.status.remove_from_group(node.group_id, *id);
            changed_groups.entry(node.group_id).or_default();
            info!(id, group = node.group_id, role = %node.role, "Node scaled in");
        }
        for (group_id, msg) in changed_groups.iter_mut() {
            msg.old_ids = self.status.live_group_members(*group_id);
        }
        self.scaling_update_all_groups(changed_groups, ScalingMode::ScaleIn)
            .await;
    }

    async fn process_scale_out(
        &self,
        server_nodes: &[Node],
        changes: &NodeChanges,
    ) {
        let candidate_ids: Vec<u64> = changes
            .new_ids
            .iter()
            .chain(changes.reappear_ids.iter())
            .copied()
            .collect();

        match self.deploy_mode {
            DeployMode::SingleNode => {
                self.process_scale_out_single(server_nodes, &candidate_ids).await
            }
            DeployMode::PdSeparate => {
                self.process_scale_out_pd(server_nodes, changes, &candidate_ids).await
            }
        }
    }

    /// Single-node mode: probe each candidate and admit the healthy ones.
    async fn process_scale_out_single(&self, server_nodes: &[Node], candidate_ids: &[u64]) {
        let mut admitted = false;
        for id in candidate_ids {
            let Some(node) = server_nodes.iter().find(|n| n.id == *id) else {
                continue;
            };
            if !self.status.contains(*id) {
                self.status.add_node(node.clone());
            } else {
                self.status.update_delete_time(*id, false);
            }
            match self.servers.update_node_info(*id, true).await {
                Ok(()) => {
                    self.status.update_node(*id, |n| n.is_healthy = true);
                    admitted = true;
                    info!(id, "Node admitted");
                }
                Err(e) => {
                    warn!(id, "Candidate node is unreachable: {e}");
                    self.status.update_node(*id, |n| n.is_healthy = false);
                }
            }
        }
        if admitted && let Err(e) = self.coordinators.send_node_status().await {
            warn!("Coordinator refresh after scale-out failed: {e}");
        }
    }

    /// PD mode: stop the timer if the new capacity covers the losses,
    /// probe candidates, place each survivor into a group and role, and
    /// run the two-phase group update.
    async fn process_scale_out_pd(
        &self,
        server_nodes: &[Node],
        changes: &NodeChanges,
        candidate_ids: &[u64],
    ) {
        self.try_stop_timer(candidate_ids);

        let candidates: Vec<Node> = server_nodes
            .iter()
            .filter(|n| candidate_ids.contains(&n.id))
            .cloned()
            .collect();
        let (available, faulty) = self.filter_available_servers(&candidates).await;
        if !faulty.is_empty() {
            warn!(?faulty, "Scale-out candidates failed their probes");
        }

        let mut changed_groups: BTreeMap<u64, GroupUpdateMsg> = BTreeMap::new();
        for id in &available {
            let Some(template) = candidates.iter().find(|n| n.id == *id) else {
                continue;
            };
            if changes.reappear_ids.contains(id) {
                self.status.update_delete_time(*id, false);
                self.status.update_node(*id, |n| {
                    n.is_healthy = true;
                    n.inference_type = InferenceType::Available;
                });
            } else if !self.status.contains(*id) {
                self.status.add_node(template.clone());
            }
            if let Err(e) = self.servers.update_node_info(*id, true).await {
                warn!(id, "Static info refresh failed: {e}");
            }

            let (group_id, role) = self.place_instance(template);
            if group_id == GROUP_NOT_SCALED_OUT {
                warn!(id, "No group can take the instance; parking it");
                continue;
            }

            let mut node = self.status.node(*id).unwrap_or_else(|| template.clone());
            node.role = role;
            if self.is_all_peers_unavailable(&node, group_id) {
                warn!(id, group = group_id, "All peers gone; terminating the instance");
                self.status.set_inference_type(*id, InferenceType::Unavailable);
                self.servers.terminate_service(&node).await;
                continue;
            }

            if self.config.is_multi_node_mode() && !node.servers.is_empty() {
                if let Err(e) =
                    crate::core::scheduler::dp_group::allocate_dp_group(&self.config, &mut node)
                {
                    debug!(id, "Dp allocation skipped: {e}");
                }
                self.status.update_node(*id, |n| n.servers = node.servers.clone());
            }

            let label = match role {
                Role::Prefill => RoleLabel::PrefillStatic,
                Role::Flex => RoleLabel::FlexStatic,
                _ => RoleLabel::DecodeStatic,
            };
            self.status.commit_role(*id, group_id, role, label);
            self.status.update_node(*id, |n| n.role_state = RoleState::Switching);
            changed_groups
                .entry(group_id)
                .or_default()
                .new_ids
                .push(*id);
            info!(id, group = group_id, role = %role, "Node placed for scale-out");
        }

        for (group_id, msg) in changed_groups.iter_mut() {
            msg.old_ids = self
                .status
                .live_group_members(*group_id)
                .into_iter()
                .filter(|id| !msg.new_ids.contains(id))
                .collect();
        }
        self.scaling_update_all_groups(changed_groups, ScalingMode::ScaleOut)
            .await;
    }

    /// The faulty tallies steer replacements back into the groups that
    /// lost instances; otherwise the instance lands where its role is
    /// scarcest.
    fn place_instance(&self, node: &Node) -> (u64, Role) {
        // A recorded loss wins: take the (group, role) with the largest tally.
        {
            let mut counts = self.faulty_group_counts.lock();
            let best = counts
                .iter()
                .flat_map(|(gid, c)| {
                    [
                        (*gid, Role::Prefill, c.prefill),
                        (*gid, Role::Decode, c.decode),
                        (*gid, Role::Flex, c.flex),
                    ]
                })
                .filter(|(_, role, count)| {
                    *count > 0 && (!node.role.is_assigned() || node.role == *role)
                })
                .max_by_key(|(_, _, count)| *count);
            if let Some((gid, role, _)) = best {
                if let Some(slot) = counts.get_mut(&gid).and_then(|c| c.slot_mut(role)) {
                    *slot -= 1;
                }
                return (gid, role);
            }
        }

        let role = if node.role.is_assigned() { node.role } else { Role::Decode };
        let group_ids = self.status.group_ids();
        if group_ids.is_empty() {
            return (GROUP_NOT_SCALED_OUT, role);
        }
        let gid = if node.servers.iter().any(|s| s.super_pod_id.is_some()) {
            self.add_instance_to_group_a3(node, &group_ids)
        } else {
            self.select_best_group(role, &group_ids)
        };
        (gid, role)
    }

    /// A2 placement: the group with the fewest members of the same role.
    pub(crate) fn select_best_group(&self, role: Role, group_ids: &[u64]) -> u64 {
        group_ids
            .iter()
            .min_by_key(|gid| {
                self.status
                    .group(**gid)
                    .map(|g| g.ids_for(role).len())
                    .unwrap_or(usize::MAX)
            })
            .copied()
            .unwrap_or(GROUP_NOT_SCALED_OUT)
    }

    /// A3 placement: prefer a group that already hosts members of the same
    /// super pod, falling back to A2.
    fn add_instance_to_group_a3(&self, node: &Node, group_ids: &[u64]) -> u64 {
        let pod = node
            .servers
            .iter()
            .find_map(|s| s.super_pod_id.clone());
        if let Some(pod) = pod {
            for gid in group_ids {
                let members = self.status.live_group_members(*gid);
                let same_pod = members.iter().any(|id| {
                    self.status
                        .node(*id)
                        .map(|n| n.servers.iter().any(|s| s.super_pod_id.as_deref() == Some(pod.as_str())))
                        .unwrap_or(false)
                });
                if same_pod {
                    return *gid;
                }
            }
        }
        self.select_best_group(node.role, group_ids)
    }

    /// Whether every opposite-side peer of the chosen group is gone. A
    /// group whose opposite side is still empty is a legitimate target.
    pub(crate) fn is_all_peers_unavailable(&self, node: &Node, group_id: u64) -> bool {
        let Some(group) = self.status.group(group_id) else {
            return false;
        };
        let opposite: &[u64] = match node.role {
            Role::Prefill => &group.decode_ids,
            Role::Decode => &group.prefill_ids,
            _ => return false,
        };
        if opposite.is_empty() {
            return false;
        }
        opposite.iter().all(|id| {
            self.status
                .node(*id)
                .map(|n| n.is_deleted() || !n.is_healthy)
                .unwrap_or(true)
        })
    }

    /// Stops the scale-in timer once the arriving capacity covers every
    /// recorded decode loss.
    pub(crate) fn try_stop_timer(&self, new_node_ids: &[u64]) {
        if !self.timer.is_active() {
            return;
        }
        let decode_deficit: i32 = self
            .faulty_group_counts
            .lock()
            .values()
            .map(|c| c.decode)
            .sum();
        if new_node_ids.len() as i32 >= decode_deficit {
            self.timer.stop();
        }
    }

    pub(crate) async fn filter_available_servers(&self, nodes: &[Node]) -> (Vec<u64>, Vec<u64>) {
        self.servers
            .get_available_nodes(nodes, self.server_online_attempts)
            .await
    }

    /// Two-phase group update. Scale-out pushes the new members first,
    /// waits out the NPU-exit grace so the previous kernel processes die,
    /// then updates the veterans; the coordinator refresh always comes
    /// last so dispatch never observes a peer set the workers do not hold.
    async fn scaling_update_all_groups(
        &self,
        changed_groups: BTreeMap<u64, GroupUpdateMsg>,
        mode: ScalingMode,
    ) {
        if changed_groups.is_empty() {
            return;
        }
        for (group_id, msg) in &changed_groups {
            group_util::apply_group_peers(&self.status, *group_id);

            if mode == ScalingMode::ScaleOut && !msg.new_ids.is_empty() {
                let pushed = self.servers.batch_post_role(&msg.new_ids).await;
                if pushed.len() != msg.new_ids.len() {
                    warn!(group = group_id, "Some new members rejected their role push");
                }
                sleep(self.npu_exit_wait).await;
            }

            let pushed_old = self.servers.batch_post_role(&msg.old_ids).await;
            if pushed_old.len() != msg.old_ids.len() {
                warn!(group = group_id, "Some members rejected their peer update");
            }

            let mut to_check: Vec<u64> = msg.new_ids.clone();
            to_check.extend(pushed_old.iter().copied());
            let ready = self.servers.check_status(&to_check, mode == ScalingMode::ScaleOut).await;
            for id in &ready {
                self.status.update_node(*id, |n| {
                    n.role_state = RoleState::Ready;
                    n.inference_type = InferenceType::Available;
                });
            }
        }

        if let Err(e) = self.coordinators.send_node_status().await {
            warn!("Coordinator refresh after group update failed: {e}");
        }
        self.process.save(&self.status, self.loader.id_map_snapshot());
    }

    /// Reads the static elastic template; a missing file reads as zeros.
    pub(crate) fn static_elastic_pd_count(&self) -> ElasticPdCount {
        if self.static_elastic_template_path.is_empty() {
            return ElasticPdCount::default();
        }
        match std::fs::read_to_string(&self.static_elastic_template_path)
            .map_err(ControlError::from)
            .and_then(|raw| serde_json::from_str::<ElasticPdCount>(&raw).map_err(ControlError::from))
        {
            Ok(counts) => counts,
            Err(e) => {
                debug!("Elastic template unavailable: {e}");
                ElasticPdCount::default()
            }
        }
    }

    /// Live P/D counts from the controller's view of the cluster.
    pub(crate) fn live_pd_count(&self) -> (i64, i64) {
        let nodes = self.status.all_nodes();
        let p = nodes
            .iter()
            .filter(|n| !n.is_deleted() && n.role == Role::Prefill)
            .count() as i64;
        let d = nodes
            .iter()
            .filter(|n| !n.is_deleted() && n.role == Role::Decode)
            .count() as i64;
        (p, d)
    }

    /// The strategy behind the timer: when the cluster is short of decode
    /// instances and no spare exists, free one prefill node so a
    /// replacement decode can land on its NPUs. Best-effort throughout; a
    /// failed release is logged and retried on the next firing.
    pub(crate) async fn instance_level_non_redundant_scale_in(&self) {
        let expected = self.static_elastic_pd_count();
        let (_actual_p, actual_d) = self.live_pd_count();
        let decode_deficit = expected.expected_decode_count - actual_d;
        if decode_deficit <= 0 {
            debug!(actual_d, "No decode deficit; nothing to release");
            return;
        }

        let group_id = self.select_group_to_release();
        if let Err(e) = self.release_prefill_instance(group_id).await {
            warn!(group = group_id, "Prefill release failed: {e}");
        }
    }

    /// Prefer the group that recorded decode losses; any group with an
    /// active prefill otherwise.
    fn select_group_to_release(&self) -> u64 {
        let from_faulty = {
            let counts = self.faulty_group_counts.lock();
            counts
                .iter()
                .filter(|(_, c)| c.decode > 0)
                .max_by_key(|(_, c)| c.decode)
                .map(|(gid, _)| *gid)
        };
        from_faulty
            .or_else(|| {
                self.status
                    .group_ids()
                    .into_iter()
                    .find(|gid| self.active_prefill_count(*gid) > 0)
            })
            .unwrap_or(0)
    }

    fn active_prefill_count(&self, group_id: u64) -> usize {
        self.status
            .group(group_id)
            .map(|g| {
                g.prefill_ids
                    .iter()
                    .filter(|id| {
                        self.status
                            .node(**id)
                            .map(|n| !n.is_deleted() && n.is_healthy)
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// Terminates one prefill instance of the group (and every dp-group
    /// peer backing it) to free its NPUs.
    async fn release_prefill_instance(
        &self,
        group_id: u64,
    ) -> Result<(), ControlError> {
        let group = self
            .status
            .group(group_id)
            .ok_or_else(|| ControlError::NotFound(format!("group {group_id}")))?;
        let victim = group
            .prefill_ids
            .iter()
            .find_map(|id| {
                self.status
                    .node(*id)
                    .filter(|n| !n.is_deleted() && n.is_healthy)
            })
            .ok_or_else(|| {
                ControlError::ResourceLimit(format!("group {group_id} has no releasable prefill"))
            })?;

        info!(id = victim.id, group = group_id, "Releasing a prefill instance for decode capacity");
        for peer_id in &victim.dp_group_peers {
            if let Some(peer) = self.status.node(*peer_id) {
                self.servers.terminate_service(&peer).await;
            }
        }
        if victim.dp_group_peers.is_empty() {
            self.servers.terminate_service(&victim).await;
        }
        self.record_group_fault(group_id, Role::Prefill, 1);
        Ok(())
    }
}
