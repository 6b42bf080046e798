// src/config.rs

//! Manages controller configuration: loading, environment overrides, and validation.

use crate::core::constants;
use crate::core::errors::ControlError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::info;

/// Deployment mode of the managed cluster.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeployMode {
    #[default]
    SingleNode,
    PdSeparate,
}

/// TLS material for one outbound client surface. Paths are PEM files.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ca_path: Option<String>,
    #[serde(default)]
    pub cert_path: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
}

/// Where and whether the persisted process file is written.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ProcessFileConfig {
    #[serde(default)]
    pub to_file: bool,
    #[serde(default)]
    pub file_path: String,
}

/// Periodic cluster-status snapshot for operators.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterStatusConfig {
    #[serde(default)]
    pub to_file: bool,
    #[serde(default)]
    pub file_path: String,
    #[serde(with = "humantime_serde", default = "default_status_period")]
    pub period: Duration,
}

impl Default for ClusterStatusConfig {
    fn default() -> Self {
        Self {
            to_file: false,
            file_path: String::new(),
            period: default_status_period(),
        }
    }
}

/// Distributed-lock store used for controller leader election.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LockConfig {
    /// Base URL of the lock store, e.g. "http://127.0.0.1:2379".
    #[serde(default = "default_lock_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_lock_key")]
    pub key: String,
    /// Lease TTL in seconds; a crashed leader hands off within one TTL.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: i64,
    #[serde(default)]
    pub tls: TlsSettings,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            endpoint: default_lock_endpoint(),
            key: default_lock_key(),
            lease_ttl: default_lease_ttl(),
            tls: TlsSettings::default(),
        }
    }
}

/// Multi-node (distributed instance) topology knobs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MultiNodeConfig {
    #[serde(default = "default_one_u32")]
    pub p_node_num: u32,
    #[serde(default = "default_one_u32")]
    pub d_node_num: u32,
    #[serde(default = "default_one_u32")]
    pub p_tp_size: u32,
    #[serde(default = "default_one_u32")]
    pub d_tp_size: u32,
    #[serde(default = "default_one_u32")]
    pub p_dp_size: u32,
    #[serde(default = "default_one_u32")]
    pub d_dp_size: u32,
    #[serde(default = "default_one_u32")]
    pub p_cp_size: u32,
    #[serde(default = "default_one_u32")]
    pub d_cp_size: u32,
    #[serde(default)]
    pub p_distribute: bool,
    #[serde(default)]
    pub d_distribute: bool,
    #[serde(default = "default_dp_server_port")]
    pub initial_dp_server_port: u64,
}

impl Default for MultiNodeConfig {
    fn default() -> Self {
        Self {
            p_node_num: 1,
            d_node_num: 1,
            p_tp_size: 1,
            d_tp_size: 1,
            p_dp_size: 1,
            d_dp_size: 1,
            p_cp_size: 1,
            d_cp_size: 1,
            p_distribute: false,
            d_distribute: false,
            initial_dp_server_port: default_dp_server_port(),
        }
    }
}

/// Role-decision engine inputs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_one_usize")]
    pub p_rate: usize,
    #[serde(default = "default_one_usize")]
    pub d_rate: usize,
    #[serde(default)]
    pub heterogeneous: bool,
    #[serde(default)]
    pub has_flex: bool,
    #[serde(default = "default_group_limit")]
    pub limit_of_nodes_per_type_in_group: usize,
    #[serde(default = "default_request_input_len")]
    pub request_input_len: usize,
    #[serde(default = "default_request_output_len")]
    pub request_output_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            p_rate: 1,
            d_rate: 1,
            heterogeneous: false,
            has_flex: false,
            limit_of_nodes_per_type_in_group: default_group_limit(),
            request_input_len: default_request_input_len(),
            request_output_len: default_request_output_len(),
        }
    }
}

/// Retry and wait policy for every reconciliation surface. All durations
/// are humantime strings in the TOML file ("5s", "2m").
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimingConfig {
    #[serde(with = "humantime_serde", default = "default_http_timeout")]
    pub http_timeout: Duration,
    #[serde(default = "default_http_retries")]
    pub http_retries: u32,
    #[serde(default = "default_online_attempts")]
    pub server_online_attempt_times: u32,
    #[serde(with = "humantime_serde", default = "default_online_wait")]
    pub server_online_wait: Duration,
    #[serde(default = "default_init_role_attempts")]
    pub init_role_attempt_times: u32,
    #[serde(default = "default_check_role_attempts")]
    pub check_role_attempt_times: u32,
    #[serde(with = "humantime_serde", default = "default_check_role_wait")]
    pub check_role_wait: Duration,
    #[serde(with = "humantime_serde", default = "default_tasks_end_wait")]
    pub tasks_end_wait: Duration,
    #[serde(with = "humantime_serde", default = "default_cluster_sync")]
    pub cluster_synchronization: Duration,
    #[serde(with = "humantime_serde", default = "default_rank_table_detecting")]
    pub rank_table_detecting: Duration,
    #[serde(with = "humantime_serde", default = "default_disappeared_wait")]
    pub disappeared_server_waiting: Duration,
    /// Grace between pushing roles to new nodes and peer updates to old
    /// ones, sized to let the previous NPU processes exit.
    #[serde(with = "humantime_serde", default = "default_npu_exit_wait")]
    pub npu_exit_wait: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            http_timeout: default_http_timeout(),
            http_retries: default_http_retries(),
            server_online_attempt_times: default_online_attempts(),
            server_online_wait: default_online_wait(),
            init_role_attempt_times: default_init_role_attempts(),
            check_role_attempt_times: default_check_role_attempts(),
            check_role_wait: default_check_role_wait(),
            tasks_end_wait: default_tasks_end_wait(),
            cluster_synchronization: default_cluster_sync(),
            rank_table_detecting: default_rank_table_detecting(),
            disappeared_server_waiting: default_disappeared_wait(),
            npu_exit_wait: default_npu_exit_wait(),
        }
    }
}

/// The controller configuration, loaded once at startup.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub deploy_mode: DeployMode,
    /// Address this controller announces as lock owner.
    #[serde(default = "default_pod_ip")]
    pub pod_ip: String,
    #[serde(default = "default_controller_port")]
    pub controller_port: u16,
    /// gRPC endpoint of the cluster daemon.
    #[serde(default = "default_cluster_endpoint")]
    pub cluster_endpoint: String,
    #[serde(default = "default_ranktable_path")]
    pub global_rank_table_path: String,
    /// When true, mounted input files must arrive with mode 0640.
    #[serde(default = "default_true")]
    pub check_input_file_permission: bool,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub task_id: String,
    /// Management port every worker listens on.
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_server_control_port")]
    pub server_control_port: u16,
    #[serde(default = "default_coordinator_port")]
    pub coordinator_port: u16,
    /// Alarm manager endpoint; empty disables alarm delivery.
    #[serde(default)]
    pub alarm_endpoint: String,
    /// Static elastic-scaling template consulted by non-redundant scale-in.
    #[serde(default)]
    pub static_elastic_template_path: String,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub multi_node: MultiNodeConfig,
    #[serde(default)]
    pub process_file: ProcessFileConfig,
    #[serde(default)]
    pub cluster_status: ClusterStatusConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub server_tls: TlsSettings,
    #[serde(default)]
    pub coordinator_tls: TlsSettings,
    #[serde(default)]
    pub alarm_tls: TlsSettings,
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize from defaults")
    }
}

fn default_status_period() -> Duration {
    Duration::from_secs(5)
}
fn default_lock_endpoint() -> String {
    "http://127.0.0.1:2379".to_string()
}
fn default_lock_key() -> String {
    "/prismctl/leader".to_string()
}
fn default_lease_ttl() -> i64 {
    15
}
fn default_one_u32() -> u32 {
    1
}
fn default_one_usize() -> usize {
    1
}
fn default_dp_server_port() -> u64 {
    10000
}
fn default_group_limit() -> usize {
    16
}
fn default_request_input_len() -> usize {
    3000
}
fn default_request_output_len() -> usize {
    200
}
fn default_http_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_http_retries() -> u32 {
    1
}
fn default_online_attempts() -> u32 {
    4
}
fn default_online_wait() -> Duration {
    Duration::from_secs(5)
}
fn default_init_role_attempts() -> u32 {
    5
}
fn default_check_role_attempts() -> u32 {
    60
}
fn default_check_role_wait() -> Duration {
    Duration::from_secs(5)
}
fn default_tasks_end_wait() -> Duration {
    Duration::from_secs(300)
}
fn default_cluster_sync() -> Duration {
    Duration::from_secs(60)
}
fn default_rank_table_detecting() -> Duration {
    Duration::from_secs(1)
}
fn default_disappeared_wait() -> Duration {
    Duration::from_secs(120)
}
fn default_npu_exit_wait() -> Duration {
    Duration::from_secs(30)
}
fn default_pod_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_controller_port() -> u16 {
    1026
}
fn default_cluster_endpoint() -> String {
    "http://127.0.0.1:8899".to_string()
}
fn default_ranktable_path() -> String {
    "ranktable.json".to_string()
}
fn default_true() -> bool {
    true
}
fn default_model_id() -> String {
    "default-model".to_string()
}
fn default_server_port() -> u16 {
    1025
}
fn default_server_control_port() -> u16 {
    1026
}
fn default_coordinator_port() -> u16 {
    1027
}

impl Config {
    /// Loads from a TOML file, then applies environment overrides and validates.
    pub fn from_file(path: &str) -> Result<Self, ControlError> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| ControlError::InvalidInput(format!("config parse: {e}")))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables win over file values for the canonical set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var(constants::ENV_GLOBAL_RANK_TABLE)
            && !v.is_empty()
        {
            self.global_rank_table_path = v;
        }
        if let Ok(v) = std::env::var(constants::ENV_POD_IP)
            && !v.is_empty()
        {
            self.pod_ip = v;
        }
        if let Ok(v) = std::env::var(constants::ENV_MODEL_ID)
            && !v.is_empty()
        {
            self.model_id = v;
        }
        if let Ok(v) = std::env::var(constants::ENV_TASK_ID)
            && !v.is_empty()
        {
            self.task_id = v;
        }
        if let Ok(v) = std::env::var(constants::ENV_CHECK_INPUT_FILES) {
            self.check_input_file_permission = v != "0" && !v.eq_ignore_ascii_case("false");
        }
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        if self.global_rank_table_path.is_empty() {
            return Err(ControlError::InvalidInput(
                "global_rank_table_path must not be empty".to_string(),
            ));
        }
        if !Self::is_valid_pd_rate(self.engine.p_rate, self.engine.d_rate) {
            return Err(ControlError::InvalidInput(format!(
                "invalid P:D ratio {}:{}",
                self.engine.p_rate, self.engine.d_rate
            )));
        }
        if self.lock.lease_ttl <= 0 {
            return Err(ControlError::InvalidInput(
                "lock.lease_ttl must be positive".to_string(),
            ));
        }
        let mn = &self.multi_node;
        for (name, v) in [
            ("p_tp_size", mn.p_tp_size),
            ("d_tp_size", mn.d_tp_size),
            ("p_dp_size", mn.p_dp_size),
            ("d_dp_size", mn.d_dp_size),
            ("p_cp_size", mn.p_cp_size),
            ("d_cp_size", mn.d_cp_size),
        ] {
            if v == 0 {
                return Err(ControlError::InvalidInput(format!(
                    "multi_node.{name} must be positive"
                )));
            }
        }
        info!(
            deploy_mode = ?self.deploy_mode,
            rank_table = %self.global_rank_table_path,
            "Configuration validated"
        );
        Ok(())
    }

    /// Ratios outside 1..=MAX_PD_RATE on either side are rejected.
    pub fn is_valid_pd_rate(p_rate: usize, d_rate: usize) -> bool {
        (1..=constants::MAX_PD_RATE).contains(&p_rate)
            && (1..=constants::MAX_PD_RATE).contains(&d_rate)
    }

    /// The multi-node path is active when either side runs more than one
    /// node per instance or declares distribution.
    pub fn is_multi_node_mode(&self) -> bool {
        let mn = &self.multi_node;
        mn.p_node_num > 1 || mn.d_node_num > 1 || mn.p_distribute || mn.d_distribute
    }

    /// Devices one dp-group slice of the given role spans.
    pub fn slice_devices(&self, prefill: bool) -> usize {
        let mn = &self.multi_node;
        if prefill {
            (mn.p_tp_size * mn.p_cp_size) as usize
        } else {
            (mn.d_tp_size * mn.d_cp_size) as usize
        }
    }
}
