// src/core/status/node.rs

//! The node model: everything the controller knows about a single worker,
//! plus the tagged enums shared across the core. Strings only exist at the
//! wire edge; inside the core every state is one of these variants.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// The inference role a worker is serving.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Prefill,
    Decode,
    Flex,
    #[default]
    Undefined,
}

impl Role {
    /// Whether this role participates in serving (anything but `Undefined`).
    pub fn is_assigned(self) -> bool {
        self != Role::Undefined
    }
}

/// Placement label attached by the decision engine. `*Static` labels pin a
/// node to its role; `*Prefer` labels leave it eligible for switching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleLabel {
    #[default]
    PrefillPrefer,
    DecodePrefer,
    PrefillStatic,
    DecodeStatic,
    FlexStatic,
}

/// Where a node stands in the role hand-off protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleState {
    #[default]
    Unknown,
    Switching,
    Ready,
}

/// Whether the coordinator may dispatch onto this node right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InferenceType {
    #[default]
    Available,
    PrefillUpdatingPeers,
    Unavailable,
}

/// One NPU device as declared by the rank-table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: u32,
    pub device_ip: String,
    pub device_logical_id: u32,
    pub rank_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub super_device_id: Option<u64>,
}

/// One physical server participating in a (possibly multi-server) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_ip: String,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub super_pod_id: Option<String>,
    /// Data-parallel group id assigned by the scheduler, 0 until allocated.
    #[serde(default)]
    pub dp_id: u64,
}

impl ServerInfo {
    /// The smallest rank id carried by this server, used to pick the master
    /// sub-node of a multi-server instance.
    pub fn min_rank_id(&self) -> u32 {
        self.devices.iter().map(|d| d.rank_id).min().unwrap_or(u32::MAX)
    }
}

/// Capabilities reported once by the worker's `/v1/config` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStaticInfo {
    pub max_seq_len: u64,
    pub max_output_len: u64,
    pub total_blocks: u64,
    pub block_size: u64,
    pub node_res: u64,
    /// Share of prefill traffic a flex node takes, 0..=100.
    pub flex_p_ratio: u32,
}

/// Telemetry refreshed from the worker's status endpoint on every probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDynamicInfo {
    pub avail_slots: i64,
    pub avail_blocks: i64,
    pub prefix_hash: String,
    pub peers: Vec<u64>,
    pub waiting: u64,
    pub running: u64,
    pub swapped: u64,
}

/// Per-node allocation figures folded back from the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeScheduleInfo {
    pub allocated_slots: i64,
    pub allocated_blocks: i64,
}

/// A managed worker. Centralized layouts map one node to one process;
/// distributed instances map one node to one dp-group slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    /// Shared across all slices of a distributed instance; equals `id` otherwise.
    pub virtual_id: u64,
    pub host: String,
    pub predict_port: u16,
    pub mgmt_port: u16,
    pub metric_port: u16,
    pub inter_comm_port: u16,
    pub role: Role,
    pub label: RoleLabel,
    pub group_id: u64,
    pub static_info: NodeStaticInfo,
    pub dynamic_info: NodeDynamicInfo,
    pub schedule_info: NodeScheduleInfo,
    pub role_state: RoleState,
    pub inference_type: InferenceType,
    pub is_healthy: bool,
    pub is_initialized: bool,
    /// Tombstone timestamp (unix seconds); 0 means the node is live.
    pub delete_time: u64,
    pub init_retry_times: u32,
    /// Node ids of every slice belonging to the same distributed instance.
    pub dp_group_peers: Vec<u64>,
    pub servers: Vec<ServerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_type: Option<String>,
}

impl Node {
    pub fn new(id: u64, host: impl Into<String>, mgmt_port: u16) -> Self {
        Self {
            id,
            virtual_id: id,
            host: host.into(),
            predict_port: 0,
            mgmt_port,
            metric_port: 0,
            inter_comm_port: 0,
            role: Role::Undefined,
            label: RoleLabel::default(),
            group_id: 0,
            static_info: NodeStaticInfo::default(),
            dynamic_info: NodeDynamicInfo::default(),
            schedule_info: NodeScheduleInfo::default(),
            role_state: RoleState::Unknown,
            inference_type: InferenceType::Available,
            is_healthy: false,
            is_initialized: false,
            delete_time: 0,
            init_retry_times: 0,
            dp_group_peers: Vec::new(),
            servers: Vec::new(),
            hardware_type: None,
        }
    }

    /// Whether the node is tombstoned.
    pub fn is_deleted(&self) -> bool {
        self.delete_time > 0
    }

    /// The owning instance of a distributed node is keyed by the smallest
    /// id among its dp-group peers.
    pub fn instance_id(&self) -> u64 {
        self.dp_group_peers.iter().copied().min().unwrap_or(self.id)
    }

    /// The master sub-node of a multi-server instance carries the smallest rank id.
    pub fn master_server(&self) -> Option<&ServerInfo> {
        self.servers.iter().min_by_key(|s| s.min_rank_id())
    }

    /// Management endpoint of this node, `host:mgmt_port`.
    pub fn mgmt_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.mgmt_port)
    }
}

/// The result of diffing a fresh rank-table snapshot against the status store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeChanges {
    pub new_ids: Vec<u64>,
    pub removed_ids: Vec<u64>,
    pub reappear_ids: Vec<u64>,
}

impl NodeChanges {
    pub fn is_empty(&self) -> bool {
        self.new_ids.is_empty() && self.removed_ids.is_empty() && self.reappear_ids.is_empty()
    }
}

/// A role assignment proposed by the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoleDecision {
    pub id: u64,
    pub group_id: u64,
    pub flex_p_ratio: u32,
    pub role: Role,
}
