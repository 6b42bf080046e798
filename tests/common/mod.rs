// tests/common/mod.rs

//! Shared fixtures: mock worker and coordinator HTTP endpoints (axum), a
//! rank-table writer, and a fully wired scheduler for scenario tests.

#![allow(dead_code)]

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use prismctl::config::Config;
use prismctl::core::alarm::AlarmReporter;
use prismctl::core::clusterd::ClusterClient;
use prismctl::core::controller::Shutdown;
use prismctl::core::coordinator::CoordinatorStore;
use prismctl::core::faults::FaultManager;
use prismctl::core::faults::npu::NpuRecoveryManager;
use prismctl::core::leader::LeaderFlag;
use prismctl::core::process::ProcessManager;
use prismctl::core::ranktable::RankTableLoader;
use prismctl::core::requests::{CoordinatorRequestHandler, ServerRequestHandler};
use prismctl::core::roles::decision::{RatioEngine, RoleManager};
use prismctl::core::roles::switcher::RoleSwitcher;
use prismctl::core::scheduler::NodeScheduler;
use prismctl::core::status::NodeStatus;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Observable state of one mock worker.
#[derive(Debug, Default)]
pub struct WorkerState {
    pub role: std::sync::Mutex<String>,
    pub role_state: std::sync::Mutex<String>,
    pub peers: std::sync::Mutex<Vec<u64>>,
    pub role_posts: AtomicU32,
    pub reject_role_posts: AtomicBool,
    pub terminated: AtomicBool,
}

impl WorkerState {
    fn new() -> Arc<Self> {
        let state = Self::default();
        *state.role.lock().unwrap() = "undefined".to_string();
        *state.role_state.lock().unwrap() = "UNKNOWN".to_string();
        Arc::new(state)
    }

    pub fn role(&self) -> String {
        self.role.lock().unwrap().clone()
    }

    pub fn peers(&self) -> Vec<u64> {
        self.peers.lock().unwrap().clone()
    }
}

async fn worker_config() -> Json<Value> {
    Json(json!({
        "max_seq_len": 4096,
        "max_output_len": 512,
        "total_blocks": 1024,
        "block_size": 16,
        "node_res": 8,
    }))
}

async fn worker_status(State(state): State<Arc<WorkerState>>) -> Json<Value> {
    Json(json!({
        "role": state.role(),
        "role_state": state.role_state.lock().unwrap().clone(),
        "avail_slots": 10,
        "avail_blocks": 100,
        "prefix_hash": "",
        "peers": state.peers(),
        "waiting": 0,
        "running": 0,
        "swapped": 0,
    }))
}

async fn worker_role(
    state: Arc<WorkerState>,
    role: &str,
    body: Value,
) -> (axum::http::StatusCode, Json<Value>) {
    if state.reject_role_posts.load(Ordering::SeqCst) {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "injected failure"})),
        );
    }
    *state.role.lock().unwrap() = role.to_string();
    *state.role_state.lock().unwrap() = "READY".to_string();
    let peers = body["peers"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e["id"].as_u64())
                .collect::<Vec<u64>>()
        })
        .unwrap_or_default();
    *state.peers.lock().unwrap() = peers;
    state.role_posts.fetch_add(1, Ordering::SeqCst);
    (axum::http::StatusCode::OK, Json(json!({})))
}

/// Binds a mock worker on the given loopback ip; returns its state and
/// bound address.
pub async fn spawn_worker(ip: &str) -> (Arc<WorkerState>, SocketAddr) {
    let state = WorkerState::new();
    let make_role = |role: &'static str| {
        let state = state.clone();
        move |Json(body): Json<Value>| {
            let state = state.clone();
            async move { worker_role(state, role, body).await }
        }
    };
    let app = Router::new()
        .route("/v1/config", get(worker_config))
        .route("/v1/status", get(worker_status))
        .route("/v2/status", get(worker_status))
        .route("/v1/role/prefill", post(make_role("prefill")))
        .route("/v1/role/decode", post(make_role("decode")))
        .route("/v1/role/flex", post(make_role("flex")))
        .route("/v2/role/prefill", post(make_role("prefill")))
        .route("/v2/role/decode", post(make_role("decode")))
        .route("/v2/role/flex", post(make_role("flex")))
        .route("/stopService", {
            let state = state.clone();
            post(move || {
                let state = state.clone();
                async move {
                    state.terminated.store(true, Ordering::SeqCst);
                    Json(json!({}))
                }
            })
        })
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(format!("{ip}:0")).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, addr)
}

/// Observable state of the mock coordinator.
#[derive(Debug, Default)]
pub struct CoordinatorState {
    pub refreshes: Mutex<Vec<Value>>,
    pub offline_ids: Mutex<Vec<u64>>,
    pub online_ids: Mutex<Vec<u64>>,
    pub backup_infos: Mutex<Vec<Value>>,
    pub tasks_value: AtomicI64,
    pub query_is_end: AtomicBool,
    pub recv_flow: AtomicI64,
    pub claims_master: AtomicBool,
}

impl CoordinatorState {
    fn new() -> Arc<Self> {
        let state = Self::default();
        state.query_is_end.store(true, Ordering::SeqCst);
        Arc::new(state)
    }

    pub async fn last_refresh(&self) -> Option<Value> {
        self.refreshes.lock().await.last().cloned()
    }
}

pub async fn spawn_coordinator() -> (Arc<CoordinatorState>, SocketAddr) {
    let state = CoordinatorState::new();

    let app = Router::new()
        .route("/v1/instances/refresh", {
            let state = state.clone();
            post(move |Json(body): Json<Value>| {
                let state = state.clone();
                async move {
                    state.refreshes.lock().await.push(body);
                    Json(json!({}))
                }
            })
        })
        .route("/v1/instances/offline", {
            let state = state.clone();
            post(move |Json(body): Json<Value>| {
                let state = state.clone();
                async move {
                    let ids = ids_from(&body);
                    state.offline_ids.lock().await.extend(ids);
                    Json(json!({}))
                }
            })
        })
        .route("/v1/instances/online", {
            let state = state.clone();
            post(move |Json(body): Json<Value>| {
                let state = state.clone();
                async move {
                    let ids = ids_from(&body);
                    state.online_ids.lock().await.extend(ids);
                    Json(json!({}))
                }
            })
        })
        .route("/v1/instances/tasks", {
            let state = state.clone();
            get(move |axum::extract::RawQuery(query): axum::extract::RawQuery| {
                let state = state.clone();
                async move {
                    let ids = query
                        .unwrap_or_default()
                        .split('&')
                        .filter(|part| part.starts_with("id="))
                        .count();
                    let value = state.tasks_value.load(Ordering::SeqCst);
                    Json(json!({ "tasks": vec![value; ids.max(1)] }))
                }
            })
        })
        .route("/v1/instances/query_tasks", {
            let state = state.clone();
            post(move |Json(_body): Json<Value>| {
                let state = state.clone();
                async move {
                    Json(json!({ "is_end": state.query_is_end.load(Ordering::SeqCst) }))
                }
            })
        })
        .route("/v1/coordinator_info", {
            get(move || async move {
                Json(json!({
                    "schedule_info": [],
                    "request_length_info": { "input_len": 3000, "output_len": 200 },
                }))
            })
        })
        .route("/recvs_info", {
            let state = state.clone();
            get(move || {
                let state = state.clone();
                async move {
                    Json(json!({
                        "is_master": state.claims_master.load(Ordering::SeqCst),
                        "recv_flow": state.recv_flow.load(Ordering::SeqCst),
                    }))
                }
            })
        })
        .route("/backup_info", {
            let state = state.clone();
            post(move |Json(body): Json<Value>| {
                let state = state.clone();
                async move {
                    state.backup_infos.lock().await.push(body);
                    Json(json!({}))
                }
            })
        });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, addr)
}

fn ids_from(body: &Value) -> Vec<u64> {
    body["ids"]
        .as_array()
        .map(|ids| ids.iter().filter_map(|v| v.as_u64()).collect())
        .unwrap_or_default()
}

/// Writes a rank-table with one coordinator and the given workers into
/// `path`.
pub fn write_ranktable(path: &std::path::Path, coordinator_ip: &str, workers: &[(String, u16)]) {
    let server_list: Vec<Value> = workers
        .iter()
        .enumerate()
        .map(|(idx, (ip, mgmt_port))| {
            json!({
                "server_id": ip,
                "server_ip": ip,
                "predict_port": (2000 + idx).to_string(),
                "mgmt_port": mgmt_port.to_string(),
                "metric_port": (3000 + idx).to_string(),
                "inter_comm_port": (4000 + idx).to_string(),
            })
        })
        .collect();
    let table = json!({
        "server_group_list": [
            {
                "group_id": "0",
                "server_list": [{ "server_id": coordinator_ip, "server_ip": coordinator_ip }],
            },
            {
                "group_id": "2",
                "server_list": server_list,
            },
        ],
    });
    std::fs::write(path, serde_json::to_vec_pretty(&table).unwrap()).unwrap();
}

/// A configuration tuned so scenario tests converge in seconds.
pub fn test_config(ranktable: &std::path::Path, coordinator_port: u16) -> Config {
    let mut config = Config::default();
    config.deploy_mode = prismctl::config::DeployMode::PdSeparate;
    config.global_rank_table_path = ranktable.to_string_lossy().to_string();
    config.check_input_file_permission = false;
    config.coordinator_port = coordinator_port;
    config.timing.http_timeout = Duration::from_secs(2);
    config.timing.server_online_attempt_times = 1;
    config.timing.init_role_attempt_times = 2;
    config.timing.check_role_attempt_times = 3;
    config.timing.check_role_wait = Duration::from_millis(200);
    config.timing.tasks_end_wait = Duration::from_secs(3);
    config.timing.cluster_synchronization = Duration::from_secs(2);
    config.timing.rank_table_detecting = Duration::from_secs(1);
    config.timing.npu_exit_wait = Duration::ZERO;
    config
}

/// Everything a scenario test needs to drive and observe the controller.
pub struct Harness {
    pub config: Config,
    pub status: Arc<NodeStatus>,
    pub coordinator_store: Arc<CoordinatorStore>,
    pub loader: Arc<RankTableLoader>,
    pub switcher: Arc<RoleSwitcher>,
    pub faults: Arc<FaultManager>,
    pub scheduler: Arc<NodeScheduler>,
    pub leader: Arc<LeaderFlag>,
    pub shutdown: Arc<Shutdown>,
}

/// Wires a controller exactly the way the binary does, minus the leader
/// agent and the gRPC subscriber (the tests drive those seams directly).
pub fn build_harness(config: Config) -> Harness {
    let shutdown = Arc::new(Shutdown::new());
    let status = Arc::new(NodeStatus::new());
    let coordinator_store = Arc::new(CoordinatorStore::new());
    let leader = Arc::new(LeaderFlag::new());
    leader.set(true);
    let npu = Arc::new(NpuRecoveryManager::new());
    let loader = Arc::new(RankTableLoader::new(&config));
    let process = ProcessManager::new(&config);
    let alarms = AlarmReporter::new("", &config.alarm_tls, &config.model_id, "test");

    let servers = ServerRequestHandler::new(&config, status.clone()).unwrap();
    let coordinators =
        CoordinatorRequestHandler::new(&config, status.clone(), coordinator_store.clone()).unwrap();
    let switcher = Arc::new(RoleSwitcher::new(
        &config,
        status.clone(),
        servers.clone(),
        coordinators.clone(),
        process.clone(),
        loader.clone(),
    ));
    let faults = FaultManager::new(
        &config,
        status.clone(),
        servers.clone(),
        coordinators.clone(),
        loader.clone(),
        npu.clone(),
        process.clone(),
        alarms.clone(),
    );
    let cluster = Arc::new(ClusterClient::new(
        &config,
        status.clone(),
        loader.clone(),
        leader.clone(),
        npu.clone(),
        alarms.clone(),
    ));
    let scheduler = NodeScheduler::new(
        config.clone(),
        status.clone(),
        coordinator_store.clone(),
        servers,
        coordinators,
        loader.clone(),
        switcher.clone(),
        faults.clone(),
        RoleManager::new(Arc::new(RatioEngine)),
        process,
        leader.clone(),
        npu,
        cluster,
        alarms,
        shutdown.clone(),
    );

    Harness {
        config,
        status,
        coordinator_store,
        loader,
        switcher,
        faults,
        scheduler,
        leader,
        shutdown,
    }
}

/// Polls `predicate` until it holds or the timeout elapses.
pub async fn wait_for<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}
