// src/core/requests/server.rs

//! Talks to the inference workers: status and config queries, role posts,
//! termination, and link verification. All role/state strings are parsed
//! here; the rest of the core never sees them.

use crate::config::Config;
use crate::core::errors::ControlError;
use crate::core::http::{HttpClient, HttpRequest};
use crate::core::status::{
    Node, NodeDynamicInfo, NodeStaticInfo, NodeStatus, Role, RoleState,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const PATH_CONFIG: &str = "/v1/config";
const PATH_STATUS_V1: &str = "/v1/status";
const PATH_STATUS_V2: &str = "/v2/status";
const PATH_STOP_SERVICE: &str = "/stopService";

/// Body of a role post: the peer set the worker must bind to before it
/// accepts traffic, plus the flex split when the role is flex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolePostBody {
    pub peers: Vec<PeerEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flex_p_ratio: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: u64,
    pub server_ip: String,
    pub predict_port: u16,
    pub inter_comm_port: u16,
    #[serde(default)]
    pub dp_id: u64,
    /// Sub-servers of a distributed peer; only carried on the v2 surface.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<PeerServerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerServerEntry {
    pub server_ip: String,
    pub dp_id: u64,
    pub device_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigResponse {
    max_seq_len: u64,
    max_output_len: u64,
    total_blocks: u64,
    block_size: u64,
    #[serde(default)]
    node_res: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct StatusResponse {
    role: String,
    role_state: String,
    #[serde(default)]
    avail_slots: i64,
    #[serde(default)]
    avail_blocks: i64,
    #[serde(default)]
    prefix_hash: String,
    #[serde(default)]
    peers: Vec<u64>,
    #[serde(default)]
    waiting: u64,
    #[serde(default)]
    running: u64,
    #[serde(default)]
    swapped: u64,
}

/// Handler over every worker endpoint. Cheap to clone; the underlying
/// HTTP connection pool is shared.
#[derive(Clone)]
pub struct ServerRequestHandler {
    status: Arc<NodeStatus>,
    base_client: HttpClient,
    timeout: Duration,
    retries: u32,
    check_role_attempt_times: u32,
    check_role_wait: Duration,
    multi_node: bool,
}

impl ServerRequestHandler {
    pub fn new(config: &Config, status: Arc<NodeStatus>) -> Result<Self, ControlError> {
        Ok(Self {
            status,
            base_client: HttpClient::new("0.0.0.0", config.server_control_port, &config.server_tls)?,
            timeout: config.timing.http_timeout,
            retries: config.timing.http_retries,
            check_role_attempt_times: config.timing.check_role_attempt_times,
            check_role_wait: config.timing.check_role_wait,
            multi_node: config.is_multi_node_mode(),
        })
    }

    fn client_for(&self, node: &Node) -> HttpClient {
        let mut client = self.base_client.clone();
        client.set_host_and_port(node.host.clone(), node.mgmt_port);
        client
    }

    fn role_path(&self, role: Role) -> Result<&'static str, ControlError> {
        let path = match (role, self.multi_node) {
            (Role::Prefill, false) => "/v1/role/prefill",
            (Role::Decode, false) => "/v1/role/decode",
            (Role::Flex, false) => "/v1/role/flex",
            (Role::Prefill, true) => "/v2/role/prefill",
            (Role::Decode, true) => "/v2/role/decode",
            (Role::Flex, true) => "/v2/role/flex",
            (Role::Undefined, _) => {
                return Err(ControlError::InvalidInput(
                    "cannot post an undefined role".to_string(),
                ));
            }
        };
        Ok(path)
    }

    /// GET `/v1/config`: the static capability record.
    pub async fn query_instance_info(&self, node: &Node) -> Result<NodeStaticInfo, ControlError> {
        let request = HttpRequest::get(PATH_CONFIG, self.timeout, self.retries);
        let response = self.client_for(node).send(&request).await?;
        if !response.is_ok() {
            return Err(ControlError::Unavailable(format!(
                "config query for node {} returned {}",
                node.id, response.status
            )));
        }
        let parsed: ConfigResponse = response.json()?;
        Ok(NodeStaticInfo {
            max_seq_len: parsed.max_seq_len,
            max_output_len: parsed.max_output_len,
            total_blocks: parsed.total_blocks,
            block_size: parsed.block_size,
            node_res: parsed.node_res,
            flex_p_ratio: node.static_info.flex_p_ratio,
        })
    }

    /// Probes the status endpoint and folds dynamic info, role state, and
    /// health back into the store. With `init_static` the static record is
    /// refreshed too.
    pub async fn update_node_info(&self, id: u64, init_static: bool) -> Result<(), ControlError> {
        let node = self
            .status
            .node(id)
            .ok_or_else(|| ControlError::NotFound(format!("node {id}")))?;
        let (reported_role, role_state, dynamic) = self.fetch_status(&node).await?;

        let static_info = if init_static {
            Some(self.query_instance_info(&node).await?)
        } else {
            None
        };

        self.status.update_node(id, |n| {
            n.dynamic_info = dynamic;
            n.role_state = role_state;
            n.is_healthy = true;
            if let Some(info) = static_info {
                n.static_info = info;
                n.is_initialized = true;
            }
            if n.role == Role::Undefined && reported_role.is_assigned() {
                n.role = reported_role;
            }
        });
        Ok(())
    }

    async fn fetch_status(
        &self,
        node: &Node,
    ) -> Result<(Role, RoleState, NodeDynamicInfo), ControlError> {
        let path = if self.multi_node { PATH_STATUS_V2 } else { PATH_STATUS_V1 };
        let request = HttpRequest::get(path, self.timeout, self.retries);
        let response = self.client_for(node).send(&request).await?;
        if !response.is_ok() {
            return Err(ControlError::Unavailable(format!(
                "status query for node {} returned {}",
                node.id, response.status
            )));
        }
        let parsed: StatusResponse = response.json()?;
        let role = Role::from_str(&parsed.role).unwrap_or(Role::Undefined);
        let role_state = RoleState::from_str(&parsed.role_state).unwrap_or(RoleState::Unknown);
        Ok((
            role,
            role_state,
            NodeDynamicInfo {
                avail_slots: parsed.avail_slots,
                avail_blocks: parsed.avail_blocks,
                prefix_hash: parsed.prefix_hash,
                peers: parsed.peers,
                waiting: parsed.waiting,
                running: parsed.running,
                swapped: parsed.swapped,
            },
        ))
    }

    /// The role and state the worker itself reports, without touching the
    /// store. Recovery compares this against the persisted assignment.
    pub async fn query_reported_role(
        &self,
        node: &Node,
    ) -> Result<(Role, RoleState), ControlError> {
        let (role, state, _) = self.fetch_status(node).await?;
        Ok((role, state))
    }

    /// Probes every node up to `max_attempts` times and splits the set into
    /// reachable and faulty ids. Applied twice with no membership change the
    /// result is the same.
    pub async fn get_available_nodes(
        &self,
        nodes: &[Node],
        max_attempts: u32,
    ) -> (Vec<u64>, Vec<u64>) {
        let mut available = Vec::new();
        let mut faulty = Vec::new();
        for node in nodes {
            let mut reachable = false;
            for attempt in 0..max_attempts.max(1) {
                match self.fetch_status(node).await {
                    Ok(_) => {
                        reachable = true;
                        break;
                    }
                    Err(e) => {
                        debug!(id = node.id, attempt, "Status probe failed: {e}");
                    }
                }
            }
            if reachable {
                available.push(node.id);
            } else {
                warn!(id = node.id, host = %node.host, "Node unreachable during probe");
                faulty.push(node.id);
            }
        }
        (available, faulty)
    }

    fn peers_payload(&self, node: &Node) -> RolePostBody {
        let peers = node
            .dynamic_info
            .peers
            .iter()
            .filter_map(|peer_id| {
                let peer = self.status.node(*peer_id)?;
                if peer.is_deleted() {
                    return None;
                }
                let servers = if self.multi_node {
                    peer.servers
                        .iter()
                        .map(|s| PeerServerEntry {
                            server_ip: s.server_ip.clone(),
                            dp_id: s.dp_id,
                            device_count: s.devices.len(),
                        })
                        .collect()
                } else {
                    Vec::new()
                };
                Some(PeerEntry {
                    id: peer.id,
                    server_ip: peer.host.clone(),
                    predict_port: peer.predict_port,
                    inter_comm_port: peer.inter_comm_port,
                    dp_id: peer.servers.first().map(|s| s.dp_id).unwrap_or(0),
                    servers,
                })
            })
            .collect();
        RolePostBody {
            peers,
            flex_p_ratio: (node.role == Role::Flex).then_some(node.static_info.flex_p_ratio),
        }
    }

    /// POSTs the node's current role with its current peer set.
    pub async fn post_single_role(&self, node: &Node) -> Result<(), ControlError> {
        let path = self.role_path(node.role)?;
        let body = self.peers_payload(node);
        let request = HttpRequest::post(path, &body, self.timeout)?;
        let response = self.client_for(node).send(&request).await?;
        if !response.is_ok() {
            return Err(ControlError::Unavailable(format!(
                "role post to node {} returned {}",
                node.id, response.status
            )));
        }
        debug!(id = node.id, role = %node.role, peers = body.peers.len(), "Role posted");
        Ok(())
    }

    /// Looks the node up in the store before posting; recovery paths use
    /// this after mutating peers in place.
    pub async fn post_single_role_by_id(&self, id: u64) -> Result<(), ControlError> {
        let node = self
            .status
            .node(id)
            .ok_or_else(|| ControlError::NotFound(format!("node {id}")))?;
        self.post_single_role(&node).await
    }

    /// Posts the current role to each node of the slice, stopping at the
    /// first failure so the caller can retry the remainder as one unit.
    pub async fn post_single_role_by_vec(&self, nodes: &[Node]) -> Result<(), ControlError> {
        for node in nodes {
            self.post_single_role(node).await?;
        }
        Ok(())
    }

    /// Posts roles to every id, returning those whose HTTP round-trip was OK.
    pub async fn batch_post_role(&self, ids: &[u64]) -> Vec<u64> {
        let mut success = Vec::new();
        for id in ids {
            match self.post_single_role_by_id(*id).await {
                Ok(()) => success.push(*id),
                Err(e) => warn!(id, "Role post failed: {e}"),
            }
        }
        success
    }

    /// Re-queries status for every id. With `require_ready` the call waits
    /// up to `check_role_attempt_times x check_role_wait` for READY and
    /// returns only the ids that reached it.
    pub async fn check_status(&self, ids: &[u64], require_ready: bool) -> Vec<u64> {
        let mut pending: Vec<u64> = ids.to_vec();
        let mut confirmed = Vec::new();
        let rounds = if require_ready { self.check_role_attempt_times.max(1) } else { 1 };

        for round in 0..rounds {
            let mut still_pending = Vec::new();
            for id in &pending {
                let Some(node) = self.status.node(*id) else {
                    continue;
                };
                match self.fetch_status(&node).await {
                    Ok((_, role_state, dynamic)) => {
                        self.status.update_node(*id, |n| {
                            n.role_state = role_state;
                            n.dynamic_info = dynamic;
                        });
                        if !require_ready || role_state == RoleState::Ready {
                            confirmed.push(*id);
                        } else {
                            still_pending.push(*id);
                        }
                    }
                    Err(e) => {
                        debug!(id, round, "Status re-check failed: {e}");
                        still_pending.push(*id);
                    }
                }
            }
            pending = still_pending;
            if pending.is_empty() || !require_ready {
                break;
            }
            sleep(self.check_role_wait).await;
        }

        if !pending.is_empty() {
            warn!(?pending, "Nodes did not reach READY within the check window");
        }
        confirmed
    }

    /// Waits until every listed node reports empty queues (no waiting,
    /// running, or swapped requests), bounded by the window. Returns
    /// whether all of them drained.
    pub async fn wait_for_queue_drain(&self, ids: &[u64], window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        let mut pending: Vec<u64> = ids.to_vec();
        while !pending.is_empty() {
            let mut still_busy = Vec::new();
            for id in &pending {
                let Some(node) = self.status.node(*id) else {
                    continue;
                };
                match self.fetch_status(&node).await {
                    Ok((_, _, dynamic)) => {
                        if dynamic.waiting + dynamic.running + dynamic.swapped > 0 {
                            still_busy.push(*id);
                        }
                    }
                    Err(e) => {
                        debug!(id, "Queue probe failed during drain: {e}");
                        still_busy.push(*id);
                    }
                }
            }
            pending = still_busy;
            if pending.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(?pending, "Queues did not drain within the window");
                return false;
            }
            sleep(Duration::from_secs(1)).await;
        }
        true
    }

    /// POST `/stopService`. Fire-and-forget: failure is logged, the NPUs
    /// will be reclaimed by the platform either way.
    pub async fn terminate_service(&self, node: &Node) {
        let request = match HttpRequest::post(PATH_STOP_SERVICE, &serde_json::json!({}), self.timeout)
        {
            Ok(r) => r,
            Err(e) => {
                warn!(id = node.id, "Terminate encode failed: {e}");
                return;
            }
        };
        match self.client_for(node).send(&request).await {
            Ok(resp) if resp.is_ok() => {
                info!(id = node.id, host = %node.host, "Service terminated")
            }
            Ok(resp) => warn!(id = node.id, status = resp.status, "Terminate refused"),
            Err(e) => warn!(id = node.id, "Terminate failed: {e}"),
        }
    }

    /// Whether the worker's reported role disagrees with the controller's
    /// intent for it.
    pub async fn is_update_role_needed(&self, node: &Node) -> bool {
        match self.fetch_status(node).await {
            Ok((reported, state, _)) => {
                reported != node.role || state == RoleState::Unknown
            }
            Err(_) => false,
        }
    }

    pub async fn is_update_p_to_d_needed(&self, node: &Node) -> bool {
        match self.fetch_status(node).await {
            Ok((reported, _, _)) => reported == Role::Prefill && node.role == Role::Decode,
            Err(_) => false,
        }
    }

    pub async fn is_update_d_to_p_needed(&self, node: &Node) -> bool {
        match self.fetch_status(node).await {
            Ok((reported, _, _)) => reported == Role::Decode && node.role == Role::Prefill,
            Err(_) => false,
        }
    }
}
