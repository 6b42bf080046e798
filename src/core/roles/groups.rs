// src/core/roles/groups.rs

//! The default group generator: packs decided P/D/flex ids into groups,
//! bounded by the per-type node limit, spreading both sides round-robin so
//! every group keeps a workable P:D balance.

use crate::core::status::{Group, NodeStatus, Role};
use std::collections::BTreeMap;

/// Produces the group layout for a fresh bring-up. Group ids are dense
/// starting at 0. Flex ids are shared round-robin too; a cluster with no
/// flex nodes gets plain (P, D) tuples.
pub fn generate_groups(
    prefill_ids: &[u64],
    decode_ids: &[u64],
    flex_ids: &[u64],
    limit_per_type: usize,
) -> BTreeMap<u64, Group> {
    let limit = limit_per_type.max(1);
    let group_count = prefill_ids
        .len()
        .div_ceil(limit)
        .max(decode_ids.len().div_ceil(limit))
        .max(1);

    let mut groups: BTreeMap<u64, Group> = (0..group_count as u64)
        .map(|gid| (gid, Group::default()))
        .collect();

    for (idx, id) in prefill_ids.iter().enumerate() {
        let gid = (idx % group_count) as u64;
        groups.get_mut(&gid).expect("group exists").prefill_ids.push(*id);
    }
    for (idx, id) in decode_ids.iter().enumerate() {
        let gid = (idx % group_count) as u64;
        groups.get_mut(&gid).expect("group exists").decode_ids.push(*id);
    }
    for (idx, id) in flex_ids.iter().enumerate() {
        let gid = (idx % group_count) as u64;
        groups.get_mut(&gid).expect("group exists").flex_ids.push(*id);
    }

    groups
}

/// Peer set a prefill node of the group must bind to: every decode id plus
/// every flex id.
pub fn prefill_peers(group: &Group) -> Vec<u64> {
    group
        .decode_ids
        .iter()
        .chain(group.flex_ids.iter())
        .copied()
        .collect()
}

/// Peer set a decode node of the group must bind to: every prefill id plus
/// every flex id.
pub fn decode_peers(group: &Group) -> Vec<u64> {
    group
        .prefill_ids
        .iter()
        .chain(group.flex_ids.iter())
        .copied()
        .collect()
}

/// Rewrites the stored peer list of every member of a group from its
/// membership tuple, dropping tombstoned ids. Flex nodes bind to both sides.
pub fn apply_group_peers(status: &NodeStatus, group_id: u64) {
    let Some(group) = status.group(group_id) else {
        return;
    };
    let live = |ids: Vec<u64>| -> Vec<u64> {
        ids.into_iter()
            .filter(|id| status.node(*id).map(|n| !n.is_deleted()).unwrap_or(false))
            .collect()
    };
    let for_prefill = live(prefill_peers(&group));
    let for_decode = live(decode_peers(&group));
    let both: Vec<u64> = live(
        group
            .prefill_ids
            .iter()
            .chain(group.decode_ids.iter())
            .copied()
            .collect(),
    );

    for id in group
        .prefill_ids
        .iter()
        .chain(group.decode_ids.iter())
        .chain(group.flex_ids.iter())
    {
        let Some(node) = status.node(*id) else {
            continue;
        };
        let peers = match node.role {
            Role::Prefill => for_prefill.clone(),
            Role::Decode => for_decode.clone(),
            Role::Flex => both.iter().filter(|p| **p != *id).copied().collect(),
            Role::Undefined => Vec::new(),
        };
        status.update_node(*id, |n| n.dynamic_info.peers = peers);
    }
}
