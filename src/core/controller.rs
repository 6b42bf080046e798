// src/core/controller.rs

//! Wires the controller together and supervises its long-running tasks:
//! leader agent, cluster-daemon subscriber, scheduler loop and its
//! monitors, coordinator backup poll, and the status updater.

use crate::config::Config;
use crate::core::alarm::AlarmReporter;
use crate::core::clusterd::ClusterClient;
use crate::core::coordinator::CoordinatorStore;
use crate::core::coordinator::backup::CoordinatorBackupHandler;
use crate::core::faults::FaultManager;
use crate::core::faults::npu::NpuRecoveryManager;
use crate::core::leader::{EtcdLockStore, LeaderAgent, LeaderFlag, LockStore};
use crate::core::process::ProcessManager;
use crate::core::ranktable::RankTableLoader;
use crate::core::requests::{CoordinatorRequestHandler, ServerRequestHandler};
use crate::core::roles::decision::{RatioEngine, RoleManager};
use crate::core::roles::switcher::RoleSwitcher;
use crate::core::scheduler::NodeScheduler;
use crate::core::status::NodeStatus;
use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Cooperative shutdown: tasks poll `is_running` at least once a second
/// and park on the notify for prompt wake-up.
#[derive(Debug)]
pub struct Shutdown {
    run: AtomicBool,
    notify: Notify,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            run: AtomicBool::new(true),
            notify: Notify::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.run.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn wait(&self) {
        while self.is_running() {
            let notified = self.notify.notified();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }
}

/// Builds every component from the configuration and runs until shutdown.
pub async fn run(config: Config) -> Result<()> {
    let store: Arc<dyn LockStore> =
        Arc::new(EtcdLockStore::new(&config.lock).map_err(|e| anyhow!("lock store init: {e}"))?);
    run_with_lock_store(config, store).await
}

/// Test seam: the same wiring over an injected lock store.
pub async fn run_with_lock_store(config: Config, lock_store: Arc<dyn LockStore>) -> Result<()> {
    let run_id = uuid::Uuid::new_v4();
    info!(%run_id, "Controller instance starting");

    let shutdown = Arc::new(Shutdown::new());
    let status = Arc::new(NodeStatus::new());
    let coordinator_store = Arc::new(CoordinatorStore::new());
    let leader = Arc::new(LeaderFlag::new());
    let npu = Arc::new(NpuRecoveryManager::new());
    let loader = Arc::new(RankTableLoader::new(&config));
    let process = ProcessManager::new(&config);
    let location = format!("{}:{}", config.pod_ip, config.controller_port);
    let alarms = AlarmReporter::new(
        &config.alarm_endpoint,
        &config.alarm_tls,
        &config.model_id,
        &location,
    );

    let servers = ServerRequestHandler::new(&config, status.clone())
        .map_err(|e| anyhow!("server handler init: {e}"))?;
    let coordinators =
        CoordinatorRequestHandler::new(&config, status.clone(), coordinator_store.clone())
            .map_err(|e| anyhow!("coordinator handler init: {e}"))?;

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
    let role_manager = RoleManager::new(Arc::new(RatioEngine));

    let mut leader_agent = LeaderAgent::new(
        &config.lock,
        lock_store,
        leader.clone(),
        location.clone(),
    );
    leader_agent.set_callback(Arc::new(|is_leader| {
        info!(is_leader, "Leadership changed");
    }));

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
        coordinators.clone(),
        loader.clone(),
        switcher,
        faults.clone(),
        role_manager,
        process.clone(),
        leader.clone(),
        npu,
        cluster.clone(),
        alarms,
        shutdown.clone(),
    );
    let backup = Arc::new(CoordinatorBackupHandler::new(
        coordinator_store,
        coordinators,
        leader.clone(),
        shutdown.clone(),
    ));

    let mut tasks: JoinSet<()> = JoinSet::new();
    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            leader_agent.run(move || shutdown.is_running()).await;
        });
    }
    {
        let shutdown = shutdown.clone();
        let cluster = cluster.clone();
        tasks.spawn(async move {
            cluster.run(move || shutdown.is_running()).await;
        });
    }
    tasks.spawn(scheduler.clone().run());
    tasks.spawn(scheduler.clone().monitor_rank_table());
    tasks.spawn(scheduler.clone().alarm_task());
    tasks.spawn(backup.run());
    {
        let shutdown = shutdown.clone();
        let status = status.clone();
        let config = config.clone();
        tasks.spawn(async move {
            run_status_updater(config, status, shutdown).await;
        });
    }

    // SIGINT/SIGTERM both funnel into the same cooperative stop.
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!("SIGTERM handler install failed: {e}");
                    let _ = ctrl_c.await;
                    signal_shutdown.trigger();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("Shutdown signal received");
        signal_shutdown.trigger();
    });

    shutdown.wait().await;
    faults.stop();
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    info!("Controller stopped");
    Ok(())
}

/// Periodically snapshots the cluster view to the status file for
/// operators, when enabled.
async fn run_status_updater(config: Config, status: Arc<NodeStatus>, shutdown: Arc<Shutdown>) {
    let cfg = &config.cluster_status;
    if !cfg.to_file || cfg.file_path.is_empty() {
        return;
    }
    while shutdown.is_running() {
        let snapshot = serde_json::json!({
            "ranktable_change_time": status.ranktable_change_time(),
            "nodes": status.all_nodes(),
            "groups": status.groups(),
        });
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(blob) => {
                if let Err(e) = std::fs::write(&cfg.file_path, blob) {
                    warn!(path = %cfg.file_path, "Status snapshot write failed: {e}");
                }
            }
            Err(e) => warn!("Status snapshot encode failed: {e}"),
        }
        sleep(Duration::from_secs(cfg.period.as_secs().max(1))).await;
    }
}

