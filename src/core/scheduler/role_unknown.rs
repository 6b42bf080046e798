// src/core/scheduler/role_unknown.rs

//! Repair of nodes whose workers reported an UNKNOWN role state. The
//! repair order matters: a prefill node can only re-link after its peers
//! hold a consistent view, so peers are re-posted around the node itself.

use super::NodeScheduler;
use crate::core::constants::MAX_LINK_SERVER_TIMES;
use crate::core::status::{Role, RoleState};
use tracing::{debug, info, warn};

impl NodeScheduler {
    /// Drains the recorded role-unknown sets. The unified PD path is used
    /// when the two sides run different parallelism and a plain re-post
    /// would race the peers' own view.
    pub(crate) async fn process_role_unknown(&self) {
        let (p_ids, d_ids, f_ids) = {
            let mut sets = self.role_unknown.lock();
            (
                std::mem::take(&mut sets.prefill),
                std::mem::take(&mut sets.decode),
                std::mem::take(&mut sets.flex),
            )
        };
        if p_ids.is_empty() && d_ids.is_empty() && f_ids.is_empty() {
            return;
        }
        info!(
            prefill = p_ids.len(),
            decode = d_ids.len(),
            flex = f_ids.len(),
            "Repairing role-unknown nodes"
        );

        let unified = self.config.multi_node.p_tp_size != self.config.multi_node.d_tp_size;
        if unified {
            let mut all = p_ids;
            all.extend(d_ids);
            all.extend(f_ids);
            self.process_role_unknown_for_pd(&all).await;
            return;
        }

        self.process_role_unknown_for_p(&p_ids).await;
        self.process_role_unknown_for_d(&d_ids).await;
        // Flex nodes re-link the same way decode nodes do: self only.
        self.process_role_unknown_for_d(&f_ids).await;
    }

    /// P-path: re-post in-sync peers first, then the node itself (counting
    /// the retry), then the peers again so they learn the fresh self-id.
    async fn process_role_unknown_for_p(&self, p_ids: &[u64]) {
        for id in p_ids {
            let Some(node) = self.status.node(*id) else {
                continue;
            };
            let in_sync_peers: Vec<u64> = node
                .dynamic_info
                .peers
                .iter()
                .filter(|peer_id| {
                    self.status
                        .node(**peer_id)
                        .map(|p| p.role_state == RoleState::Ready && !p.is_deleted())
                        .unwrap_or(false)
                })
                .copied()
                .collect();

            for peer_id in &in_sync_peers {
                if let Err(e) = self.servers.post_single_role_by_id(*peer_id).await {
                    debug!(peer = peer_id, "Peer pre-post failed: {e}");
                }
            }

            self.status.update_node(*id, |n| n.init_retry_times += 1);
            if let Err(e) = self.servers.post_single_role_by_id(*id).await {
                warn!(id, "Self re-post failed: {e}");
                self.restore_unknown(*id, Role::Prefill);
                continue;
            }

            for peer_id in &in_sync_peers {
                if let Err(e) = self.servers.post_single_role_by_id(*peer_id).await {
                    debug!(peer = peer_id, "Peer re-post failed: {e}");
                }
            }

            let verified = self.servers.check_status(&[*id], true).await;
            if verified.is_empty() {
                self.restore_unknown(*id, Role::Prefill);
            } else {
                info!(id, "Prefill node repaired");
            }
        }
    }

    /// D-path: the decode side holds no fan-out state, so re-posting the
    /// node itself is enough.
    async fn process_role_unknown_for_d(&self, d_ids: &[u64]) {
        for id in d_ids {
            let Some(node) = self.status.node(*id) else {
                continue;
            };
            self.status.update_node(*id, |n| n.init_retry_times += 1);
            if let Err(e) = self.servers.post_single_role_by_id(*id).await {
                warn!(id, "Self re-post failed: {e}");
                self.restore_unknown(*id, node.role);
                continue;
            }
            let verified = self.servers.check_status(&[*id], true).await;
            if verified.is_empty() {
                self.restore_unknown(*id, node.role);
            } else {
                info!(id, role = %node.role, "Node repaired");
            }
        }
    }

    /// Unified PD path: detach the node from every peer, re-post it, then
    /// re-attach, bounding the link attempts per peer.
    async fn process_role_unknown_for_pd(&self, ids: &[u64]) {
        for id in ids {
            let Some(node) = self.status.node(*id) else {
                continue;
            };
            self.unlink_node_from_peers(*id).await;

            self.status.update_node(*id, |n| n.init_retry_times += 1);
            if let Err(e) = self.servers.post_single_role_by_id(*id).await {
                warn!(id, "Self re-post failed during unified repair: {e}");
                self.restore_unknown(*id, node.role);
                continue;
            }

            self.link_node_to_peers(*id).await;
            let verified = self.servers.check_status(&[*id], true).await;
            if verified.is_empty() {
                self.restore_unknown(*id, node.role);
            } else {
                info!(id, "Node repaired through the unified path");
            }
        }
    }

    /// Removes the id from every peer's peer list and pushes the reduced
    /// view.
    pub(crate) async fn unlink_node_from_peers(&self, node_id: u64) {
        let Some(node) = self.status.node(node_id) else {
            return;
        };
        for peer_id in &node.dynamic_info.peers {
            self.status.update_node(*peer_id, |p| {
                p.dynamic_info.peers.retain(|x| *x != node_id);
            });
            if let Err(e) = self.servers.post_single_role_by_id(*peer_id).await {
                debug!(peer = peer_id, "Unlink push failed: {e}");
            }
        }
    }

    /// Adds the id back to every peer's peer list and pushes, retrying
    /// each peer a bounded number of times.
    pub(crate) async fn link_node_to_peers(&self, node_id: u64) {
        let Some(node) = self.status.node(node_id) else {
            return;
        };
        for peer_id in &node.dynamic_info.peers {
            self.status.update_node(*peer_id, |p| {
                if !p.dynamic_info.peers.contains(&node_id) {
                    p.dynamic_info.peers.push(node_id);
                }
            });
            let mut linked = false;
            for _ in 0..MAX_LINK_SERVER_TIMES {
                if self.servers.post_single_role_by_id(*peer_id).await.is_ok() {
                    linked = true;
                    break;
                }
            }
            if !linked {
                warn!(peer = peer_id, "Peer did not take the re-link push");
            }
        }
    }

    /// Puts an id back into its unknown bucket for the next pass.
    fn restore_unknown(&self, id: u64, role: Role) {
        let mut sets = self.role_unknown.lock();
        let bucket = match role {
            Role::Prefill => &mut sets.prefill,
            Role::Decode => &mut sets.decode,
            Role::Flex => &mut sets.flex,
            Role::Undefined => return,
        };
        if !bucket.contains(&id) {
            bucket.push(id);
        }
    }
}
