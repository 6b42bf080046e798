// src/core/clusterd/validate.rs

//! Strict validation of every string the cluster daemon puts on the wire.
//! Anything that fails is logged and skipped by the caller, never routed
//! into the core.

use crate::core::ranktable::schema::validate_ipv4;

const MAX_NODE_NAME_LEN: usize = 253;
const MAX_DEVICE_ID: u32 = 2048;

/// The fault severity reported for a node, parsed at the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultLevel {
    UnHealthy,
    SubHealthy,
    Healthy,
}

pub fn parse_fault_level(raw: &str) -> Option<FaultLevel> {
    match raw {
        "UnHealthy" => Some(FaultLevel::UnHealthy),
        "SubHealthy" => Some(FaultLevel::SubHealthy),
        "Healthy" => Some(FaultLevel::Healthy),
        _ => None,
    }
}

pub fn is_valid_ip(raw: &str) -> bool {
    validate_ipv4(raw).is_ok()
}

/// Node names follow DNS-label rules: alphanumerics plus `-`, `_`, `.`.
pub fn is_valid_node_name(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_NODE_NAME_LEN
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

pub fn is_valid_device_id(raw: &str) -> bool {
    raw.parse::<u32>().map(|v| v <= MAX_DEVICE_ID).unwrap_or(false)
}
