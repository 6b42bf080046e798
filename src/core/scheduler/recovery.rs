// src/core/scheduler/recovery.rs

//! Warm recovery after a controller restart or leader failover: resume
//! from the persisted process file instead of re-initializing, repair
//! role drift in memory only, and clean up instances the previous leader
//! left unusable.

use super::NodeScheduler;
use crate::core::errors::ControlError;
use crate::core::process::PersistedCluster;
use crate::core::ranktable::LoadedRankTable;
use crate::core::roles::groups;
use crate::core::status::{InferenceType, RoleState};
use std::collections::HashSet;
use tracing::{info, warn};

impl NodeScheduler {
    /// Rebuilds the in-memory picture from the persisted snapshot, then
    /// reconciles it against the live rank-table and the workers' own
    /// reports. Workers whose state already matches are not re-posted.
    pub(crate) async fn recover_server_cluster(
        &self,
        snapshot: PersistedCluster,
        live: &LoadedRankTable,
    ) -> Result<(), ControlError> {
        info!(
            nodes = snapshot.nodes.len(),
            groups = snapshot.groups.len(),
            "Recovering cluster state from the process file"
        );
        self.loader.update_id_map_from_recovery(snapshot.id_map.clone());

        let live_ids: HashSet<u64> = live.nodes.iter().map(|n| n.id).collect();

        // Persisted nodes come back as stored; groups come back verbatim.
        for node in &snapshot.nodes {
            self.status.add_node(node.clone());
        }
        for (group_id, group) in &snapshot.groups {
            self.status.upsert_group(*group_id, group.clone());
        }

        for node in &snapshot.nodes {
            if node.is_deleted() {
                continue;
            }
            if !live_ids.contains(&node.id) {
                // Gone from the live table; the next reconciliation pass
                // scales it in properly.
                warn!(id = node.id, "Persisted node is absent from the live rank-table");
                continue;
            }

            // Leftovers the previous leader already gave up on: terminate
            // so their NPU processes free up for replacements.
            if node.inference_type == InferenceType::Unavailable {
                info!(id = node.id, "Terminating an unavailable leftover instance");
                self.servers.terminate_service(node).await;
                self.status.update_delete_time(node.id, true);
                continue;
            }

            match self.servers.query_reported_role(node).await {
                Ok((reported, _)) => {
                    self.status.update_node(node.id, |n| n.is_healthy = true);
                    if reported.is_assigned() && reported != node.role {
                        self.switcher
                            .update_abnormal_role_when_recovering(node.id, reported);
                    }
                    if let Err(e) = self.servers.update_node_info(node.id, false).await {
                        warn!(id = node.id, "Dynamic info refresh failed: {e}");
                    }
                }
                Err(e) => {
                    warn!(id = node.id, "Recovered node does not answer: {e}");
                    self.status.update_node(node.id, |n| n.is_healthy = false);
                }
            }
        }

        // Live nodes the snapshot never saw join through the ordinary
        // scale-out path on the next pass.
        for node in &live.nodes {
            if !self.status.contains(node.id) {
                info!(id = node.id, "Live node unknown to the snapshot; leaving it for scale-out");
            }
        }

        for group_id in self.status.group_ids() {
            groups::apply_group_peers(&self.status, group_id);
        }

        // READY workers whose view matches persistence keep serving; only
        // drifted ones were touched above.
        let ready = self
            .status
            .all_nodes()
            .iter()
            .filter(|n| !n.is_deleted() && n.role_state == RoleState::Ready)
            .count();
        info!(ready, "Cluster recovery finished");
        if let Err(e) = self.coordinators.send_node_status().await {
            warn!("Coordinator refresh after recovery failed: {e}");
        }
        self.process.save(&self.status, self.loader.id_map_snapshot());
        Ok(())
    }
}
