// src/core/ranktable/loader.rs

//! Reads, validates, and writes the rank-table file, and owns the process-wide
//! `(host, mgmt_port) -> id` map. Ids are monotonically increasing and never
//! re-used, so a node keeps its identity across reloads and leader failover.

use crate::config::Config;
use crate::core::constants::CONTROLLED_FILE_MODE;
use crate::core::coordinator::Coordinator;
use crate::core::errors::ControlError;
use crate::core::ranktable::schema::{
    self, RankTableFile, ServerEntry, ServerGroup, SuperPod,
};
use crate::core::status::{DeviceInfo, Node, Role, ServerInfo};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The stable id map. Serialized into the process file so recovery and
/// leader failover observe the same identities.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct IdMap {
    map: HashMap<String, u64>,
    next_seq: u64,
}

impl IdMap {
    fn get_or_insert(&mut self, key: String) -> u64 {
        if let Some(id) = self.map.get(&key) {
            return *id;
        }
        let id = self.next_seq;
        self.next_seq += 1;
        self.map.insert(key, id);
        id
    }
}

/// One logical instance per non-coordinator group, used to match instances
/// across reloads.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceInfo {
    pub role: Role,
    pub server_ids: Vec<String>,
    pub hash_id: u64,
}

/// The result of one successful load.
#[derive(Debug, Clone, Default)]
pub struct LoadedRankTable {
    pub nodes: Vec<Node>,
    pub coordinators: Vec<Coordinator>,
}

/// Loader handle; cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct RankTableLoader {
    path: PathBuf,
    coordinator_port: u16,
    default_mgmt_port: u16,
    check_permission: bool,
    p_distribute: bool,
    d_distribute: bool,
    p_slice_devices: usize,
    d_slice_devices: usize,
    id_map: Mutex<IdMap>,
    /// Serializes file readers against the atomic writer.
    file_lock: Mutex<()>,
}

impl RankTableLoader {
    pub fn new(config: &Config) -> Self {
        Self {
            path: PathBuf::from(&config.global_rank_table_path),
            coordinator_port: config.coordinator_port,
            default_mgmt_port: config.server_control_port,
            check_permission: config.check_input_file_permission,
            p_distribute: config.multi_node.p_distribute,
            d_distribute: config.multi_node.d_distribute,
            p_slice_devices: config.slice_devices(true),
            d_slice_devices: config.slice_devices(false),
            id_map: Mutex::new(IdMap::default()),
            file_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and validates the configured file, allocating or reusing node ids.
    pub fn load(&self) -> Result<LoadedRankTable, ControlError> {
        let raw = {
            let _guard = self.file_lock.lock();
            self.read_checked()?
        };
        let table = RankTableFile::parse(&raw)?;
        self.build(&table)
    }

    fn read_checked(&self) -> Result<String, ControlError> {
        if !self.path.exists() {
            return Err(ControlError::NotFound(format!(
                "rank-table {} does not exist",
                self.path.display()
            )));
        }
        #[cfg(unix)]
        if self.check_permission {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&self.path)?.permissions().mode() & 0o777;
            if mode & !CONTROLLED_FILE_MODE != 0 {
                return Err(ControlError::Unauthenticated(format!(
                    "rank-table {} has mode {mode:o}, expected at most {CONTROLLED_FILE_MODE:o}",
                    self.path.display()
                )));
            }
        }
        Ok(std::fs::read_to_string(&self.path)?)
    }

    /// Atomically replaces the rank-table file and restricts its mode.
    pub fn write(&self, blob: &[u8]) -> Result<(), ControlError> {
        let _guard = self.file_lock.lock();
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, blob)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(CONTROLLED_FILE_MODE))?;
        }
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), bytes = blob.len(), "Rank-table written");
        Ok(())
    }

    /// A content fingerprint for cheap change detection; `None` while the
    /// file is missing or unreadable.
    pub fn fingerprint(&self) -> Option<u64> {
        let _guard = self.file_lock.lock();
        let raw = std::fs::read(&self.path).ok()?;
        let mut hasher = DefaultHasher::new();
        raw.hash(&mut hasher);
        Some(hasher.finish())
    }

    /// One logical `InstanceInfo` per non-coordinator group. The hash id is
    /// the XOR of per-server-id hashes, insensitive to listing order.
    pub fn instance_infos(&self) -> Result<Vec<InstanceInfo>, ControlError> {
        let raw = {
            let _guard = self.file_lock.lock();
            self.read_checked()?
        };
        let table = RankTableFile::parse(&raw)?;
        Ok(table
            .worker_groups()
            .map(|group| {
                let server_ids: Vec<String> =
                    group.server_list.iter().map(|s| s.server_id.clone()).collect();
                let hash_id = server_ids.iter().fold(0u64, |acc, id| {
                    let mut hasher = DefaultHasher::new();
                    id.hash(&mut hasher);
                    acc ^ hasher.finish()
                });
                InstanceInfo {
                    role: deploy_role(group),
                    server_ids,
                    hash_id,
                }
            })
            .collect())
    }

    pub fn id_map_snapshot(&self) -> IdMap {
        self.id_map.lock().clone()
    }

    pub fn restore_id_map(&self, snapshot: IdMap) {
        *self.id_map.lock() = snapshot;
    }

    /// Merges a recovered id map with the identities observed in the live
    /// table: entries only the live table knows keep their current ids, and
    /// the sequence cursor moves past every id in either map so none is
    /// ever handed out twice.
    pub fn update_id_map_from_recovery(&self, recovered: IdMap) {
        let mut current = self.id_map.lock();
        let mut merged = recovered;
        for (key, id) in current.map.iter() {
            merged.map.entry(key.clone()).or_insert(*id);
        }
        merged.next_seq = merged
            .map
            .values()
            .copied()
            .max()
            .map(|m| m + 1)
            .max(Some(merged.next_seq))
            .unwrap_or(0);
        *current = merged;
    }

    fn build(&self, table: &RankTableFile) -> Result<LoadedRankTable, ControlError> {
        let mut loaded = LoadedRankTable::default();

        if let Some(group) = table.coordinator_group() {
            for entry in &group.server_list {
                loaded
                    .coordinators
                    .push(Coordinator::new(entry.server_ip.clone(), self.coordinator_port));
            }
        }

        let mut seen_endpoints: HashSet<String> = HashSet::new();
        for group in table.worker_groups() {
            if group.group_id == schema::WORKER_GROUP_ID {
                for entry in &group.server_list {
                    let node = self.build_centralized_node(entry, group, &mut seen_endpoints)?;
                    loaded.nodes.push(node);
                }
            } else {
                self.build_instance_nodes(group, &mut seen_endpoints, &mut loaded.nodes)?;
            }
        }

        info!(
            nodes = loaded.nodes.len(),
            coordinators = loaded.coordinators.len(),
            "Rank-table loaded"
        );
        Ok(loaded)
    }

    fn allocate_id(
        &self,
        entry: &ServerEntry,
        seen: &mut HashSet<String>,
    ) -> Result<(u64, u16), ControlError> {
        let mgmt_port = entry.mgmt_port_or(self.default_mgmt_port)?;
        let key = format!("{}:{}", entry.server_ip, mgmt_port);
        if !seen.insert(key.clone()) {
            return Err(ControlError::OperationRepeat(format!(
                "duplicate server endpoint {key}"
            )));
        }
        Ok((self.id_map.lock().get_or_insert(key), mgmt_port))
    }

    fn build_centralized_node(
        &self,
        entry: &ServerEntry,
        group: &ServerGroup,
        seen: &mut HashSet<String>,
    ) -> Result<Node, ControlError> {
        let (id, mgmt_port) = self.allocate_id(entry, seen)?;
        let mut node = Node::new(id, entry.server_ip.clone(), mgmt_port);
        node.predict_port = ServerEntry::port_or_zero(&entry.predict_port)?;
        node.metric_port = ServerEntry::port_or_zero(&entry.metric_port)?;
        node.inter_comm_port = ServerEntry::port_or_zero(&entry.inter_comm_port)?;
        node.hardware_type = entry.hardware_type.clone();
        node.dp_group_peers = vec![id];
        node.servers = vec![server_info(entry, group.super_pod_list.as_deref())?];
        Ok(node)
    }

    /// Builds the nodes of one multi-instance group (`group_id >= 3`).
    ///
    /// Distributed roles yield one node per dp-group slice of `TP x CP`
    /// devices, all slices sharing the smallest slice id as `virtual_id`.
    /// Non-distributed roles yield one aggregated node whose id comes from
    /// the master sub-node (smallest rank id).
    fn build_instance_nodes(
        &self,
        group: &ServerGroup,
        seen: &mut HashSet<String>,
        out: &mut Vec<Node>,
    ) -> Result<(), ControlError> {
        let role = deploy_role(group);
        let distribute = match role {
            Role::Prefill => self.p_distribute,
            Role::Decode => self.d_distribute,
            _ => false,
        };

        let mut members: Vec<(u64, u16, &ServerEntry)> = Vec::new();
        for entry in &group.server_list {
            let (id, mgmt_port) = self.allocate_id(entry, seen)?;
            members.push((id, mgmt_port, entry));
        }
        if members.is_empty() {
            return Ok(());
        }

        if !distribute {
            let master = members
                .iter()
                .min_by_key(|(_, _, e)| min_rank(e))
                .expect("non-empty member list");
            let (id, mgmt_port, master_entry) = (master.0, master.1, master.2);
            let mut node = Node::new(id, master_entry.server_ip.clone(), mgmt_port);
            node.predict_port = ServerEntry::port_or_zero(&master_entry.predict_port)?;
            node.metric_port = ServerEntry::port_or_zero(&master_entry.metric_port)?;
            node.inter_comm_port = ServerEntry::port_or_zero(&master_entry.inter_comm_port)?;
            node.hardware_type = master_entry.hardware_type.clone();
            node.role = role;
            node.dp_group_peers = members.iter().map(|(id, _, _)| *id).collect();
            node.dp_group_peers.sort_unstable();
            for (_, _, entry) in &members {
                node.servers
                    .push(server_info(entry, group.super_pod_list.as_deref())?);
            }
            out.push(node);
            return Ok(());
        }

        let slice_devices = match role {
            Role::Prefill => self.p_slice_devices,
            _ => self.d_slice_devices,
        };
        let slices = slice_members(&members, slice_devices);
        let mut slice_ids = Vec::new();
        let mut nodes = Vec::new();
        for slice in &slices {
            let (id, mgmt_port, head) = slice[0];
            slice_ids.push(id);
            let mut node = Node::new(id, head.server_ip.clone(), mgmt_port);
            node.predict_port = ServerEntry::port_or_zero(&head.predict_port)?;
            node.metric_port = ServerEntry::port_or_zero(&head.metric_port)?;
            node.inter_comm_port = ServerEntry::port_or_zero(&head.inter_comm_port)?;
            node.hardware_type = head.hardware_type.clone();
            node.role = role;
            for (_, _, entry) in slice {
                node.servers
                    .push(server_info(entry, group.super_pod_list.as_deref())?);
            }
            nodes.push(node);
        }
        let virtual_id = slice_ids.iter().copied().min().unwrap_or(0);
        slice_ids.sort_unstable();
        for node in &mut nodes {
            node.virtual_id = virtual_id;
            node.dp_group_peers = slice_ids.clone();
        }
        out.extend(nodes);
        Ok(())
    }
}

fn deploy_role(group: &ServerGroup) -> Role {
    match group.deploy_server.as_deref() {
        Some(schema::DEPLOY_SERVER_PREFILL) => Role::Prefill,
        Some(schema::DEPLOY_SERVER_DECODE) => Role::Decode,
        _ => Role::Undefined,
    }
}

fn min_rank(entry: &ServerEntry) -> u32 {
    entry
        .device
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .filter_map(|d| d.rank_id.parse::<u32>().ok())
        .min()
        .unwrap_or(u32::MAX)
}

/// Groups members into dp-group slices. When one server already carries a
/// whole slice of devices, every server is its own slice; otherwise servers
/// are chunked until their devices cover one slice.
fn slice_members<'a>(
    members: &[(u64, u16, &'a ServerEntry)],
    slice_devices: usize,
) -> Vec<Vec<(u64, u16, &'a ServerEntry)>> {
    let per_server = members
        .first()
        .map(|(_, _, e)| e.device.as_deref().unwrap_or(&[]).len())
        .unwrap_or(0);

    if per_server >= slice_devices || slice_devices == 0 {
        return members.iter().map(|m| vec![*m]).collect();
    }

    let mut slices = Vec::new();
    let mut current = Vec::new();
    let mut devices = 0usize;
    for member in members {
        devices += member.2.device.as_deref().unwrap_or(&[]).len();
        current.push(*member);
        if devices >= slice_devices {
            slices.push(std::mem::take(&mut current));
            devices = 0;
        }
    }
    if !current.is_empty() {
        warn!(
            servers = current.len(),
            "Trailing servers do not fill a dp-group slice; grouping them anyway"
        );
        slices.push(current);
    }
    slices
}

fn server_info(
    entry: &ServerEntry,
    super_pods: Option<&[SuperPod]>,
) -> Result<ServerInfo, ControlError> {
    let devices = entry
        .device
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .map(|d| {
            Ok(DeviceInfo {
                device_id: d
                    .device_id
                    .parse()
                    .map_err(|_| ControlError::Exception("device_id".to_string()))?,
                device_ip: d.device_ip.clone(),
                device_logical_id: d
                    .device_logical_id
                    .parse()
                    .map_err(|_| ControlError::Exception("device_logical_id".to_string()))?,
                rank_id: d
                    .rank_id
                    .parse()
                    .map_err(|_| ControlError::Exception("rank_id".to_string()))?,
                super_device_id: match &d.super_device_id {
                    Some(s) => Some(
                        s.parse()
                            .map_err(|_| ControlError::Exception("super_device_id".to_string()))?,
                    ),
                    None => None,
                },
            })
        })
        .collect::<Result<Vec<_>, ControlError>>()?;

    let super_pod_id = super_pods.and_then(|pods| {
        pods.iter()
            .find(|pod| pod.server_list.iter().any(|m| m.server_id == entry.server_id))
            .map(|pod| pod.super_pod_id.clone())
    });

    Ok(ServerInfo {
        server_id: entry.server_id.clone(),
        server_ip: entry.server_ip.clone(),
        devices,
        super_pod_id,
        dp_id: 0,
    })
}
