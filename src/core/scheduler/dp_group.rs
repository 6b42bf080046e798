// src/core/scheduler/dp_group.rs

//! Data-parallel group allocation for multi-node instances. Every server
//! of a node gets a dp id derived from the node id, so ids stay unique and
//! stable across reloads.

use crate::config::Config;
use crate::core::constants::DP_GROUP_NUM;
use crate::core::errors::ControlError;
use crate::core::status::{Node, Role};
use tracing::debug;

/// Assigns `dp_id = node_id * 10000 + local_idx` across the node's server
/// list. Whether one server carries a whole `TP x CP` slice decides
/// single-server versus cross-server grouping: in the cross-server case
/// every server of the slice shares the slice's dp id.
pub fn allocate_dp_group(config: &Config, node: &mut Node) -> Result<(), ControlError> {
    if node.servers.is_empty() {
        return Err(ControlError::InvalidInput(format!(
            "node {} has no servers to allocate dp groups for",
            node.id
        )));
    }
    let slice_devices = config.slice_devices(node.role == Role::Prefill).max(1);
    let per_server = node.servers[0].devices.len();
    let single_server_slices = per_server >= slice_devices;

    if single_server_slices {
        for (local_idx, server) in node.servers.iter_mut().enumerate() {
            server.dp_id = node.id * DP_GROUP_NUM + local_idx as u64;
        }
    } else {
        // Consecutive servers pool their devices into one slice and share
        // its dp id.
        let mut local_idx = 0u64;
        let mut devices = 0usize;
        for server in node.servers.iter_mut() {
            server.dp_id = node.id * DP_GROUP_NUM + local_idx;
            devices += server.devices.len();
            if devices >= slice_devices {
                local_idx += 1;
                devices = 0;
            }
        }
    }
    debug!(
        id = node.id,
        servers = node.servers.len(),
        single_server_slices,
        "Dp groups allocated"
    );
    Ok(())
}

/// Allocates dp groups for every multi-node instance in the slice.
pub fn allocate_all(config: &Config, nodes: &mut [Node]) -> Result<(), ControlError> {
    if !config.is_multi_node_mode() {
        return Ok(());
    }
    for node in nodes.iter_mut() {
        allocate_dp_group(config, node)?;
    }
    Ok(())
}
