// src/core/ranktable/schema.rs

//! Wire schema of the rank-table file and its strict validation. Every
//! field arrives as a string; parsing yields either a validated record or
//! an `InvalidInput` error, never a partial table.

use crate::core::constants::{
    MAX_COORDINATORS, MAX_DEVICES_PER_SERVER, MAX_GROUPS_MULTI_NODE, MAX_GROUPS_SINGLE_NODE,
    MAX_PORT, MAX_SERVER_NODES, MIN_PORT,
};
use crate::core::errors::ControlError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;

pub const COORDINATOR_GROUP_ID: &str = "0";
pub const WORKER_GROUP_ID: &str = "2";

/// `deploy_server` values carried by multi-instance groups.
pub const DEPLOY_SERVER_PREFILL: &str = "0";
pub const DEPLOY_SERVER_DECODE: &str = "1";

const MAX_DEVICE_ID: u32 = 2048;
const MAX_SUPER_DEVICE_ID: u64 = 1 << 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankTableFile {
    pub server_group_list: Vec<ServerGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerGroup {
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub super_pod_list: Option<Vec<SuperPod>>,
    pub server_list: Vec<ServerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperPod {
    pub super_pod_id: String,
    pub server_list: Vec<SuperPodMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperPodMember {
    pub server_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub server_id: String,
    pub server_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predict_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mgmt_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inter_comm_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Vec<DeviceEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub device_ip: String,
    pub device_logical_id: String,
    pub rank_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub super_device_id: Option<String>,
}

impl RankTableFile {
    pub fn parse(raw: &str) -> Result<Self, ControlError> {
        let table: RankTableFile = serde_json::from_str(raw)
            .map_err(|e| ControlError::InvalidInput(format!("rank-table schema: {e}")))?;
        table.validate()?;
        Ok(table)
    }

    /// Exhaustive structural validation; any violation fails the whole load.
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.server_group_list.is_empty() {
            return Err(ControlError::InvalidInput(
                "server_group_list is empty".to_string(),
            ));
        }

        let mut seen_groups = HashSet::new();
        let mut worker_count = 0usize;
        let mut multi_node = false;

        for group in &self.server_group_list {
            validate_group_id(&group.group_id)?;
            if !seen_groups.insert(group.group_id.clone()) {
                return Err(ControlError::OperationRepeat(format!(
                    "duplicate group_id {}",
                    group.group_id
                )));
            }
            if group.group_id != COORDINATOR_GROUP_ID && group.group_id != WORKER_GROUP_ID {
                multi_node = true;
            }

            if group.group_id == COORDINATOR_GROUP_ID {
                if group.server_list.len() > MAX_COORDINATORS {
                    return Err(ControlError::InvalidInput(format!(
                        "coordinator group lists {} endpoints, at most {} allowed",
                        group.server_list.len(),
                        MAX_COORDINATORS
                    )));
                }
                for entry in &group.server_list {
                    validate_ipv4(&entry.server_ip)?;
                }
                continue;
            }

            if let Some(deploy) = &group.deploy_server
                && deploy != DEPLOY_SERVER_PREFILL
                && deploy != DEPLOY_SERVER_DECODE
            {
                return Err(ControlError::InvalidInput(format!(
                    "deploy_server must be \"0\" or \"1\", got {deploy:?}"
                )));
            }

            worker_count += group.server_list.len();
            for entry in &group.server_list {
                entry.validate()?;
            }
            if let Some(pods) = &group.super_pod_list {
                for pod in pods {
                    if pod.super_pod_id.is_empty() || pod.server_list.is_empty() {
                        return Err(ControlError::InvalidInput(
                            "super_pod entries need an id and at least one server".to_string(),
                        ));
                    }
                }
            }
        }

        if worker_count > MAX_SERVER_NODES {
            return Err(ControlError::InvalidInput(format!(
                "{worker_count} workers exceed the {MAX_SERVER_NODES}-node limit"
            )));
        }
        let group_limit = if multi_node {
            MAX_GROUPS_MULTI_NODE
        } else {
            MAX_GROUPS_SINGLE_NODE
        };
        if self.server_group_list.len() > group_limit {
            return Err(ControlError::InvalidInput(format!(
                "{} server groups exceed the limit of {group_limit}",
                self.server_group_list.len()
            )));
        }
        Ok(())
    }

    pub fn coordinator_group(&self) -> Option<&ServerGroup> {
        self.server_group_list
            .iter()
            .find(|g| g.group_id == COORDINATOR_GROUP_ID)
    }

    pub fn worker_groups(&self) -> impl Iterator<Item = &ServerGroup> {
        self.server_group_list
            .iter()
            .filter(|g| g.group_id != COORDINATOR_GROUP_ID)
    }
}

impl ServerEntry {
    fn validate(&self) -> Result<(), ControlError> {
        validate_ipv4(&self.server_id)?;
        validate_ipv4(&self.server_ip)?;
        for port in [
            &self.predict_port,
            &self.mgmt_port,
            &self.metric_port,
            &self.inter_comm_port,
        ]
        .into_iter()
        .flatten()
        {
            parse_port(port)?;
        }
        if let Some(devices) = &self.device {
            if devices.len() > MAX_DEVICES_PER_SERVER {
                return Err(ControlError::InvalidInput(format!(
                    "server {} declares {} devices, at most {} allowed",
                    self.server_id,
                    devices.len(),
                    MAX_DEVICES_PER_SERVER
                )));
            }
            for device in devices {
                device.validate()?;
            }
        }
        Ok(())
    }

    pub fn mgmt_port_or(&self, fallback: u16) -> Result<u16, ControlError> {
        match &self.mgmt_port {
            Some(p) => parse_port(p),
            None => Ok(fallback),
        }
    }

    pub fn port_or_zero(port: &Option<String>) -> Result<u16, ControlError> {
        match port {
            Some(p) => parse_port(p),
            None => Ok(0),
        }
    }
}

impl DeviceEntry {
    fn validate(&self) -> Result<(), ControlError> {
        for (name, value) in [
            ("device_id", &self.device_id),
            ("device_logical_id", &self.device_logical_id),
            ("rank_id", &self.rank_id),
        ] {
            let parsed: u32 = value.parse().map_err(|_| {
                ControlError::InvalidInput(format!("{name} {value:?} is not a number"))
            })?;
            if parsed > MAX_DEVICE_ID {
                return Err(ControlError::InvalidInput(format!(
                    "{name} {parsed} exceeds {MAX_DEVICE_ID}"
                )));
            }
        }
        validate_ipv4(&self.device_ip)?;
        if let Some(sdid) = &self.super_device_id {
            let parsed: u64 = sdid.parse().map_err(|_| {
                ControlError::InvalidInput(format!("super_device_id {sdid:?} is not a number"))
            })?;
            if parsed > MAX_SUPER_DEVICE_ID {
                return Err(ControlError::InvalidInput(format!(
                    "super_device_id {parsed} exceeds {MAX_SUPER_DEVICE_ID}"
                )));
            }
        }
        Ok(())
    }
}

/// Coordinators are "0", the flat worker group is "2", and numeric ids >= 3
/// denote distributed layouts. There is no enum on the wire, so the check
/// is exhaustive here.
fn validate_group_id(group_id: &str) -> Result<(), ControlError> {
    match group_id {
        COORDINATOR_GROUP_ID | WORKER_GROUP_ID => Ok(()),
        other => {
            let parsed: u64 = other.parse().map_err(|_| {
                ControlError::InvalidInput(format!("group_id {other:?} is not numeric"))
            })?;
            if parsed < 3 {
                return Err(ControlError::InvalidInput(format!(
                    "group_id {parsed} is reserved"
                )));
            }
            Ok(())
        }
    }
}

pub fn parse_port(raw: &str) -> Result<u16, ControlError> {
    let port: u16 = raw
        .parse()
        .map_err(|_| ControlError::InvalidInput(format!("port {raw:?} is not a number")))?;
    if !(MIN_PORT..=MAX_PORT).contains(&port) {
        return Err(ControlError::InvalidInput(format!(
            "port {port} outside [{MIN_PORT}, {MAX_PORT}]"
        )));
    }
    Ok(port)
}

pub fn validate_ipv4(raw: &str) -> Result<(), ControlError> {
    raw.parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| ControlError::InvalidInput(format!("{raw:?} is not a valid IPv4 address")))
}
