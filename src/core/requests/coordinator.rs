// src/core/requests/coordinator.rs

//! Talks to the coordinators: cluster snapshots, rotation control, task
//! accounting, and the master/backup exchange.

use crate::config::Config;
use crate::core::coordinator::{Coordinator, CoordinatorStore};
use crate::core::errors::ControlError;
use crate::core::http::{HttpClient, HttpRequest};
use crate::core::status::{Node, NodeScheduleInfo, NodeStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const PATH_REFRESH: &str = "/v1/instances/refresh";
const PATH_OFFLINE: &str = "/v1/instances/offline";
const PATH_ONLINE: &str = "/v1/instances/online";
const PATH_TASKS: &str = "/v1/instances/tasks";
const PATH_QUERY_TASKS: &str = "/v1/instances/query_tasks";
const PATH_COORDINATOR_INFO: &str = "/v1/coordinator_info";
const PATH_RECVS_INFO: &str = "/recvs_info";
const PATH_BACKUP_INFO: &str = "/backup_info";

/// Direction of an in-flight role switch, as the coordinator tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChangeType {
    PrefillToDecode,
    DecodeToPrefill,
}

impl RoleChangeType {
    fn code(self) -> u8 {
        match self {
            RoleChangeType::PrefillToDecode => 0,
            RoleChangeType::DecodeToPrefill => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct IdsBody<'a> {
    ids: &'a [u64],
}

#[derive(Debug, Clone, Serialize)]
struct RefreshInstance {
    id: u64,
    port: u16,
    model_name: String,
    static_info: serde_json::Value,
    dynamic_info: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct TasksResponse {
    tasks: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct QueryTasksResponse {
    is_end: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    pub id: u64,
    #[serde(default)]
    pub allocated_slots: i64,
    #[serde(default)]
    pub allocated_blocks: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestLengthInfo {
    #[serde(default)]
    pub input_len: usize,
    #[serde(default)]
    pub output_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorInfo {
    #[serde(default)]
    pub schedule_info: Vec<ScheduleEntry>,
    #[serde(default)]
    pub request_length_info: RequestLengthInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecvsInfo {
    pub is_master: bool,
    pub recv_flow: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub is_master: bool,
    pub is_abnormal: bool,
    pub is_random_pick: bool,
}

/// Handler over the coordinator endpoints. Clone-cheap.
#[derive(Clone)]
pub struct CoordinatorRequestHandler {
    status: Arc<NodeStatus>,
    coordinators: Arc<CoordinatorStore>,
    base_client: HttpClient,
    timeout: Duration,
    retries: u32,
    model_id: String,
}

impl CoordinatorRequestHandler {
    pub fn new(
        config: &Config,
        status: Arc<NodeStatus>,
        coordinators: Arc<CoordinatorStore>,
    ) -> Result<Self, ControlError> {
        Ok(Self {
            status,
            coordinators,
            base_client: HttpClient::new("0.0.0.0", config.coordinator_port, &config.coordinator_tls)?,
            timeout: config.timing.http_timeout,
            retries: config.timing.http_retries,
            model_id: config.model_id.clone(),
        })
    }

    fn client_for(&self, coordinator: &Coordinator) -> HttpClient {
        let mut client = self.base_client.clone();
        client.set_host_and_port(coordinator.ip.clone(), coordinator.port);
        client
    }

    fn refresh_payload(&self, nodes: &[Node]) -> serde_json::Value {
        let ids: Vec<u64> = nodes.iter().map(|n| n.id).collect();
        let instances: Vec<RefreshInstance> = nodes
            .iter()
            .map(|n| RefreshInstance {
                id: n.id,
                port: n.predict_port,
                model_name: self.model_id.clone(),
                static_info: serde_json::json!({
                    "role": n.role.to_string(),
                    "max_seq_len": n.static_info.max_seq_len,
                    "max_output_len": n.static_info.max_output_len,
                    "total_blocks": n.static_info.total_blocks,
                    "block_size": n.static_info.block_size,
                    "flex_p_ratio": n.static_info.flex_p_ratio,
                }),
                dynamic_info: serde_json::json!({
                    "peers": n.dynamic_info.peers,
                }),
            })
            .collect();
        serde_json::json!({ "ids": ids, "instances": instances })
    }

    /// Pushes a full cluster snapshot to every coordinator.
    pub async fn send_node_status(&self) -> Result<(), ControlError> {
        let nodes: Vec<Node> = self
            .status
            .all_nodes()
            .into_iter()
            .filter(|n| !n.is_deleted())
            .collect();
        let payload = self.refresh_payload(&nodes);
        let request = HttpRequest::post(PATH_REFRESH, &payload, self.timeout)?;

        let mut last_err = None;
        for coordinator in self.coordinators.coordinators() {
            match self.client_for(&coordinator).send(&request).await {
                Ok(resp) if resp.is_ok() => {
                    debug!(coordinator = %coordinator.endpoint(), nodes = nodes.len(), "Snapshot refreshed")
                }
                Ok(resp) => {
                    warn!(coordinator = %coordinator.endpoint(), status = resp.status, "Refresh refused");
                    last_err = Some(ControlError::Unavailable(format!(
                        "refresh returned {}",
                        resp.status
                    )));
                }
                Err(e) => {
                    warn!(coordinator = %coordinator.endpoint(), "Refresh failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn post_ids(&self, path: &str, ids: &[u64]) -> Result<(), ControlError> {
        if ids.is_empty() {
            return Ok(());
        }
        let request = HttpRequest::post(path, &IdsBody { ids }, self.timeout)?;
        let mut succeeded = false;
        for coordinator in self.coordinators.coordinators() {
            match self.client_for(&coordinator).send(&request).await {
                Ok(resp) if resp.is_ok() => succeeded = true,
                Ok(resp) => {
                    warn!(coordinator = %coordinator.endpoint(), status = resp.status, %path, "Post refused")
                }
                Err(e) => warn!(coordinator = %coordinator.endpoint(), %path, "Post failed: {e}"),
            }
        }
        if succeeded {
            Ok(())
        } else {
            Err(ControlError::Unreachable(format!(
                "no coordinator accepted {path}"
            )))
        }
    }

    /// Takes instances out of rotation.
    pub async fn offline(&self, ids: &[u64]) -> Result<(), ControlError> {
        self.post_ids(PATH_OFFLINE, ids).await
    }

    /// Re-introduces instances into rotation.
    pub async fn online(&self, ids: &[u64]) -> Result<(), ControlError> {
        self.post_ids(PATH_ONLINE, ids).await
    }

    /// In-flight task counts per id, from the master coordinator. -1 means
    /// the coordinator does not track the id.
    pub async fn tasks(&self, ids: &[u64]) -> Result<Vec<i64>, ControlError> {
        let master = self
            .coordinators
            .master()
            .or_else(|| self.coordinators.coordinators().into_iter().next())
            .ok_or_else(|| ControlError::NotFound("no coordinator".to_string()))?;
        let query: Vec<String> = ids.iter().map(|id| format!("id={id}")).collect();
        let path = format!("{}?{}", PATH_TASKS, query.join("&"));
        let request = HttpRequest::get(path, self.timeout, self.retries);
        let response = self.client_for(&master).send(&request).await?;
        if !response.is_ok() {
            return Err(ControlError::Unavailable(format!(
                "tasks query returned {}",
                response.status
            )));
        }
        let parsed: TasksResponse = response.json()?;
        Ok(parsed.tasks)
    }

    /// Whether traffic between a (P, D) pair has fully drained.
    pub async fn query_tasks(
        &self,
        p_id: u64,
        d_id: u64,
        change: RoleChangeType,
    ) -> Result<bool, ControlError> {
        let master = self
            .coordinators
            .master()
            .or_else(|| self.coordinators.coordinators().into_iter().next())
            .ok_or_else(|| ControlError::NotFound("no coordinator".to_string()))?;
        let body = serde_json::json!({
            "p_id": p_id,
            "d_id": d_id,
            "role_change_type": change.code(),
        });
        let request = HttpRequest::post(PATH_QUERY_TASKS, &body, self.timeout)?;
        let response = self.client_for(&master).send(&request).await?;
        if !response.is_ok() {
            return Err(ControlError::Unavailable(format!(
                "query_tasks returned {}",
                response.status
            )));
        }
        let parsed: QueryTasksResponse = response.json()?;
        Ok(parsed.is_end)
    }

    /// Pulls allocation figures and the request-length summary from the
    /// master coordinator, folding per-node allocations into the store.
    pub async fn coordinator_info(&self) -> Result<CoordinatorInfo, ControlError> {
        let master = self
            .coordinators
            .master()
            .or_else(|| self.coordinators.coordinators().into_iter().next())
            .ok_or_else(|| ControlError::NotFound("no coordinator".to_string()))?;
        let request = HttpRequest::get(PATH_COORDINATOR_INFO, self.timeout, self.retries);
        let response = self.client_for(&master).send(&request).await?;
        if !response.is_ok() {
            return Err(ControlError::Unavailable(format!(
                "coordinator_info returned {}",
                response.status
            )));
        }
        let parsed: CoordinatorInfo = response.json()?;
        for entry in &parsed.schedule_info {
            self.status.update_node_schedule_info(
                entry.id,
                NodeScheduleInfo {
                    allocated_slots: entry.allocated_slots,
                    allocated_blocks: entry.allocated_blocks,
                },
            );
        }
        Ok(parsed)
    }

    /// GET `/recvs_info` from one coordinator.
    pub async fn recvs_info(&self, coordinator: &Coordinator) -> Result<RecvsInfo, ControlError> {
        let request = HttpRequest::get(PATH_RECVS_INFO, self.timeout, self.retries);
        let response = self.client_for(coordinator).send(&request).await?;
        if !response.is_ok() {
            return Err(ControlError::Unavailable(format!(
                "recvs_info returned {}",
                response.status
            )));
        }
        response.json()
    }

    /// POST `/backup_info` to one coordinator.
    pub async fn post_backup_info(
        &self,
        coordinator: &Coordinator,
        info: &BackupInfo,
    ) -> Result<(), ControlError> {
        let request = HttpRequest::post(PATH_BACKUP_INFO, info, self.timeout)?;
        let response = self.client_for(coordinator).send(&request).await?;
        if !response.is_ok() {
            return Err(ControlError::Unavailable(format!(
                "backup_info returned {}",
                response.status
            )));
        }
        Ok(())
    }
}
