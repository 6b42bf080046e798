// src/core/process.rs

//! Persists the controller's view of the cluster (nodes, groups, and the
//! id map) to the process file on every meaningful transition, so a warm
//! standby can resume without re-posting roles to workers whose state
//! already matches.

use crate::config::Config;
use crate::core::constants::CONTROLLED_FILE_MODE;
use crate::core::errors::ControlError;
use crate::core::ranktable::loader::IdMap;
use crate::core::status::{Group, Node, NodeStatus, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedCluster {
    pub nodes: Vec<Node>,
    pub groups: BTreeMap<u64, Group>,
    pub id_map: IdMap,
}

impl PersistedCluster {
    /// A persisted view counts as a recovery source when any node carries
    /// an assigned role.
    pub fn has_assigned_roles(&self) -> bool {
        self.nodes.iter().any(|n| n.role != Role::Undefined)
    }
}

/// Writes and reads the process file. Disabled managers silently skip
/// saves and report no recovery state.
#[derive(Debug, Clone)]
pub struct ProcessManager {
    enabled: bool,
    path: PathBuf,
}

impl ProcessManager {
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.process_file.to_file && !config.process_file.file_path.is_empty(),
            path: PathBuf::from(&config.process_file.file_path),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Snapshots the live state. Failures are logged, not propagated: the
    /// process file is an optimization for failover, never a correctness
    /// dependency of the running leader.
    pub fn save(&self, status: &NodeStatus, id_map: IdMap) {
        if !self.enabled {
            return;
        }
        let snapshot = PersistedCluster {
            nodes: status.all_nodes(),
            groups: status.groups(),
            id_map,
        };
        if let Err(e) = self.write(&snapshot) {
            warn!(path = %self.path.display(), "Process file save failed: {e}");
        } else {
            debug!(
                path = %self.path.display(),
                nodes = snapshot.nodes.len(),
                "Process file saved"
            );
        }
    }

    fn write(&self, snapshot: &PersistedCluster) -> Result<(), ControlError> {
        let blob = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &blob)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(CONTROLLED_FILE_MODE))?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Loads the persisted view; `None` when persistence is off or no file
    /// has been written yet.
    pub fn load(&self) -> Result<Option<PersistedCluster>, ControlError> {
        if !self.enabled || !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let snapshot: PersistedCluster = serde_json::from_str(&raw)?;
        Ok(Some(snapshot))
    }
}
