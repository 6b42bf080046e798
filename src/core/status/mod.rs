// src/core/status/mod.rs

//! The in-memory source of truth for cluster membership: nodes, groups,
//! flex groups, and change detection. All mutation funnels through one
//! RW lock; writers hold it for the whole of a multi-field update so that
//! readers never observe a half-applied transition.

pub mod node;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub use node::{
    DeviceInfo, InferenceType, Node, NodeChanges, NodeDynamicInfo, NodeScheduleInfo,
    NodeStaticInfo, Role, RoleDecision, RoleLabel, RoleState, ServerInfo,
};

/// The smallest scheduling unit: an ordered P-set coupled with an ordered
/// D-set, and optionally a flex set serving both sides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub prefill_ids: Vec<u64>,
    pub decode_ids: Vec<u64>,
    pub flex_ids: Vec<u64>,
}

impl Group {
    pub fn ids_for(&self, role: Role) -> &[u64] {
        match role {
            Role::Prefill => &self.prefill_ids,
            Role::Decode => &self.decode_ids,
            Role::Flex => &self.flex_ids,
            Role::Undefined => &[],
        }
    }

    pub fn ids_for_mut(&mut self, role: Role) -> Option<&mut Vec<u64>> {
        match role {
            Role::Prefill => Some(&mut self.prefill_ids),
            Role::Decode => Some(&mut self.decode_ids),
            Role::Flex => Some(&mut self.flex_ids),
            Role::Undefined => None,
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.prefill_ids.contains(&id)
            || self.decode_ids.contains(&id)
            || self.flex_ids.contains(&id)
    }

    pub fn remove(&mut self, id: u64) {
        self.prefill_ids.retain(|x| *x != id);
        self.decode_ids.retain(|x| *x != id);
        self.flex_ids.retain(|x| *x != id);
    }
}

/// A fault recorded against a node, kept until the fault manager consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    HardwareUnhealthy,
    HardwareSubHealthy,
    SoftwareUnreachable,
}

#[derive(Debug, Default)]
struct NodeStatusInner {
    nodes: HashMap<u64, Node>,
    groups: BTreeMap<u64, Group>,
    faulty: Vec<(u64, FaultKind)>,
    ranktable_change_time: u64,
}

/// Shared handle over the cluster state. Every component receives one
/// `Arc<NodeStatus>` at construction and keeps no other back-references.
#[derive(Debug, Default)]
pub struct NodeStatus {
    inner: RwLock<NodeStatusInner>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl NodeStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a node, replacing any previous entry with the same id.
    pub fn add_node(&self, node: Node) {
        let mut inner = self.inner.write();
        if inner.nodes.insert(node.id, node).is_some() {
            debug!("Replaced existing node entry during add");
        }
    }

    pub fn remove_node(&self, id: u64) -> Option<Node> {
        self.inner.write().nodes.remove(&id)
    }

    pub fn node(&self, id: u64) -> Option<Node> {
        self.inner.read().nodes.get(&id).cloned()
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.inner.read().nodes.values().cloned().collect()
    }

    pub fn node_ids(&self) -> Vec<u64> {
        self.inner.read().nodes.keys().copied().collect()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.read().nodes.contains_key(&id)
    }

    /// Finds the live node backed by the given host IP, if any.
    pub fn node_id_by_host(&self, host: &str) -> Option<u64> {
        self.inner
            .read()
            .nodes
            .values()
            .find(|n| n.host == host || n.servers.iter().any(|s| s.server_ip == host))
            .map(|n| n.id)
    }

    /// Applies `f` to the stored node under the write lock. Returns false
    /// when the id is unknown.
    pub fn update_node<F>(&self, id: u64, f: F) -> bool
    where
        F: FnOnce(&mut Node),
    {
        let mut inner = self.inner.write();
        match inner.nodes.get_mut(&id) {
            Some(node) => {
                f(node);
                true
            }
            None => false,
        }
    }

    /// Replaces a stored node wholesale.
    pub fn replace_node(&self, node: Node) -> bool {
        let mut inner = self.inner.write();
        match inner.nodes.get_mut(&node.id) {
            Some(slot) => {
                *slot = node;
                true
            }
            None => false,
        }
    }

    /// Tombstones a node (or revives it when `deleted` is false).
    pub fn update_delete_time(&self, id: u64, deleted: bool) -> bool {
        let stamp = if deleted { unix_now() } else { 0 };
        self.update_node(id, |n| n.delete_time = stamp)
    }

    pub fn set_inference_type(&self, id: u64, it: InferenceType) -> bool {
        self.update_node(id, |n| n.inference_type = it)
    }

    /// Folds coordinator-reported allocations back into a node.
    pub fn update_node_schedule_info(&self, id: u64, info: NodeScheduleInfo) -> bool {
        self.update_node(id, |n| n.schedule_info = info)
    }

    pub fn upsert_group(&self, group_id: u64, group: Group) {
        self.inner.write().groups.insert(group_id, group);
    }

    pub fn group(&self, group_id: u64) -> Option<Group> {
        self.inner.read().groups.get(&group_id).cloned()
    }

    pub fn groups(&self) -> BTreeMap<u64, Group> {
        self.inner.read().groups.clone()
    }

    pub fn group_ids(&self) -> Vec<u64> {
        self.inner.read().groups.keys().copied().collect()
    }

    /// Removes a node from its group membership lists. Groups themselves
    /// are never destroyed; empty groups are tolerated.
    pub fn remove_from_group(&self, group_id: u64, id: u64) {
        let mut inner = self.inner.write();
        if let Some(group) = inner.groups.get_mut(&group_id) {
            group.remove(id);
        }
    }

    /// Commits a role move inside one group as a single locked transaction:
    /// membership lists and the node's own role/group fields stay in step.
    pub fn commit_role(&self, id: u64, group_id: u64, role: Role, label: RoleLabel) {
        let mut inner = self.inner.write();
        for group in inner.groups.values_mut() {
            group.remove(id);
        }
        let group = inner.groups.entry(group_id).or_default();
        if let Some(ids) = group.ids_for_mut(role)
            && !ids.contains(&id)
        {
            ids.push(id);
        }
        if let Some(node) = inner.nodes.get_mut(&id) {
            node.role = role;
            node.label = label;
            node.group_id = group_id;
        } else {
            warn!(id, "Role committed for a node the store does not hold");
        }
    }

    pub fn add_faulty_node(&self, id: u64, kind: FaultKind) {
        self.inner.write().faulty.push((id, kind));
    }

    /// Drains the recorded faults for the fault manager to process.
    pub fn take_faulty_nodes(&self) -> Vec<(u64, FaultKind)> {
        std::mem::take(&mut self.inner.write().faulty)
    }

    pub fn mark_ranktable_change(&self) {
        self.inner.write().ranktable_change_time = unix_now();
    }

    pub fn ranktable_change_time(&self) -> u64 {
        self.inner.read().ranktable_change_time
    }

    /// Diffs the latest rank-table snapshot against stored membership.
    ///
    /// - `removed`: stored live nodes missing from the snapshot (tombstones excluded);
    /// - `new`: snapshot ids the store has never seen;
    /// - `reappear`: snapshot ids the store holds as tombstones.
    pub fn detect_node_changes(&self, snapshot: &[u64]) -> NodeChanges {
        let inner = self.inner.read();
        let snapshot_set: HashSet<u64> = snapshot.iter().copied().collect();
        let mut changes = NodeChanges::default();

        for (id, node) in &inner.nodes {
            if !snapshot_set.contains(id) && !node.is_deleted() {
                changes.removed_ids.push(*id);
            }
        }
        for id in &snapshot_set {
            match inner.nodes.get(id) {
                None => changes.new_ids.push(*id),
                Some(node) if node.is_deleted() => changes.reappear_ids.push(*id),
                Some(_) => {}
            }
        }
        changes.new_ids.sort_unstable();
        changes.removed_ids.sort_unstable();
        changes.reappear_ids.sort_unstable();
        changes
    }

    /// Live (non-tombstoned) peer ids of a group, from the P and D and flex sides.
    pub fn live_group_members(&self, group_id: u64) -> Vec<u64> {
        let inner = self.inner.read();
        let Some(group) = inner.groups.get(&group_id) else {
            return Vec::new();
        };
        group
            .prefill_ids
            .iter()
            .chain(group.decode_ids.iter())
            .chain(group.flex_ids.iter())
            .filter(|id| {
                inner
                    .nodes
                    .get(id)
                    .map(|n| !n.is_deleted())
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }
}
