// src/core/constants.rs

//! Process-wide limits and timing constants shared by the controller core.

use std::time::Duration;

/// Upper bound on worker nodes accepted from a single rank-table (6 racks x 16 hosts).
pub const MAX_SERVER_NODES: usize = 6 * 16;
/// Upper bound on NPU devices a single server entry may declare.
pub const MAX_DEVICES_PER_SERVER: usize = 128;
/// Maximum number of server groups in a multi-node layout.
pub const MAX_GROUPS_MULTI_NODE: usize = 98;
/// Maximum number of server groups in a single-node layout.
pub const MAX_GROUPS_SINGLE_NODE: usize = 3;
/// A coordinator group never lists more than two endpoints (master + standby).
pub const MAX_COORDINATORS: usize = 2;

/// Valid port range for every port field in the rank-table.
pub const MIN_PORT: u16 = 1024;
pub const MAX_PORT: u16 = 65535;

/// Reload attempts allowed while waiting for a rank-table whose nodes all answer.
pub const MAX_RELOAD_RANK_TABLE_TIMES: usize = 30;
/// Attempts to re-link an out-of-sync peer before giving up on it for the round.
pub const MAX_LINK_SERVER_TIMES: usize = 2;

/// Multiplier used when deriving a dp-group id from a node id.
pub const DP_GROUP_NUM: u64 = 10_000;

/// P:D ratios are capped at this value after heterogeneous re-derivation.
pub const MAX_PD_RATE: usize = 15;

/// Sentinel node id used to book-keep faults against nodes absent from the status store.
pub const UNKNOWN_NODE_ID: u64 = u64::MAX;

/// Group id returned when a scale-out candidate cannot be placed anywhere.
pub const GROUP_NOT_SCALED_OUT: u64 = 999_999;

/// Sleep between role-push retry rounds.
pub const ROLE_SEND_RETRY_INTERVAL: Duration = Duration::from_secs(3);
/// Cadence of the rank-table change monitor.
pub const RANK_TABLE_MONITOR_INTERVAL: Duration = Duration::from_secs(5);
/// Cadence of the scheduler alarm task.
pub const SCHEDULER_ALARM_INTERVAL: Duration = Duration::from_secs(5);
/// Cadence of the coordinator master/backup poll.
pub const COORDINATOR_BACKUP_INTERVAL: Duration = Duration::from_secs(5);
/// Base period of the non-redundant scale-in timer; the action fires every second tick.
pub const SCALE_IN_TIMER_PERIOD: Duration = Duration::from_secs(30);
/// Upper bound on the role-decision wait during bring-up.
pub const ROLE_DECISION_WAIT: Duration = Duration::from_secs(10);

/// Registration attempts against the cluster daemon before the alarm escalates.
pub const REGISTER_MAX_RETRY_TIMES: usize = 5;

/// Mode written for every controller-owned file (rank-table, process file).
pub const CONTROLLED_FILE_MODE: u32 = 0o640;

/// Registration role announced to the cluster daemon.
pub const CLUSTER_REGISTER_ROLE: &str = "mindie-ms-controller";

/// Environment variables honored by the controller.
pub const ENV_CONFIG_FILE_PATH: &str = "MINDIE_MS_CONTROLLER_CONFIG_FILE_PATH";
pub const ENV_GLOBAL_RANK_TABLE: &str = "GLOBAL_RANK_TABLE_FILE_PATH";
pub const ENV_POD_IP: &str = "POD_IP";
pub const ENV_TASK_ID: &str = "MINDX_TASK_ID";
pub const ENV_SERVER_IP: &str = "MINDX_SERVER_IP";
pub const ENV_MODEL_ID: &str = "MODEL_ID";
pub const ENV_CHECK_INPUT_FILES: &str = "MINDIE_CHECK_INPUTFILES_PERMISSION";
