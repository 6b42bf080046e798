// src/core/clusterd/mod.rs

//! gRPC subscriber against the cluster daemon. Leader-only: registers,
//! then holds two server-streaming subscriptions (rank-table and fault
//! signals), respawning either stream when it dies. Alarm categories are
//! debounced through atomic flags; the first successful message after a
//! reconnect clears the interruption alarm.

pub mod proto;
pub mod validate;

use crate::config::Config;
use crate::core::alarm::{AlarmKind, AlarmReporter};
use crate::core::constants::{CLUSTER_REGISTER_ROLE, REGISTER_MAX_RETRY_TIMES, UNKNOWN_NODE_ID};
use crate::core::errors::ControlError;
use crate::core::faults::npu::NpuRecoveryManager;
use crate::core::leader::LeaderFlag;
use crate::core::ranktable::RankTableLoader;
use crate::core::status::{FaultKind, NodeStatus};
use proto::config_client::ConfigClient;
use proto::fault_client::FaultClient;
use proto::{FaultMsgSignal, NodeFaultInfo, RegisterRequest, SubscribeRequest};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use validate::FaultLevel;

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// One atomic per alarm category; `raise` fires only on the first set,
/// `clear` only on a set flag.
#[derive(Debug, Default)]
struct AlarmFlags {
    register_failed: AtomicBool,
    ranktable_interrupted: AtomicBool,
    fault_interrupted: AtomicBool,
    save_failed: AtomicBool,
}

pub struct ClusterClient {
    endpoint: String,
    job_id: String,
    status: Arc<NodeStatus>,
    loader: Arc<RankTableLoader>,
    leader: Arc<LeaderFlag>,
    npu: Arc<NpuRecoveryManager>,
    alarms: AlarmReporter,
    flags: AlarmFlags,
    ranktable_saved: AtomicBool,
}

impl ClusterClient {
    pub fn new(
        config: &Config,
        status: Arc<NodeStatus>,
        loader: Arc<RankTableLoader>,
        leader: Arc<LeaderFlag>,
        npu: Arc<NpuRecoveryManager>,
        alarms: AlarmReporter,
    ) -> Self {
        Self {
            endpoint: config.cluster_endpoint.clone(),
            job_id: config.task_id.clone(),
            status,
            loader,
            leader,
            npu,
            alarms,
            flags: AlarmFlags::default(),
            ranktable_saved: AtomicBool::new(false),
        }
    }

    /// Whether an initial rank-table has been saved since startup. The
    /// scheduler waits on this before its first bring-up attempt.
    pub fn has_saved_ranktable(&self) -> bool {
        self.ranktable_saved.load(Ordering::SeqCst)
    }

    async fn report_once(&self, flag: &AtomicBool, kind: AlarmKind, detail: &str) {
        if !flag.swap(true, Ordering::SeqCst) {
            self.alarms.raise(kind, detail).await;
        }
    }

    async fn clear_once(&self, flag: &AtomicBool, kind: AlarmKind, detail: &str) {
        if flag.swap(false, Ordering::SeqCst) {
            self.alarms.clear(kind, detail).await;
        }
    }

    /// The subscriber main loop: blocks while not leader, registers, runs
    /// both streams, and respawns whichever one dies.
    pub async fn run<F>(self: Arc<Self>, running: F)
    where
        F: Fn() -> bool,
    {
        while running() {
            if !self.leader.is_leader() {
                self.leader.wait_until_leader().await;
                continue;
            }

            if !self.register_with_retry(&running).await {
                // Non-recoverable: the alarm has fired; surface the exit.
                warn!("Cluster daemon registration exhausted its retries");
                return;
            }

            let mut tasks = tokio::task::JoinSet::new();
            {
                let client = self.clone();
                tasks.spawn(async move { client.run_ranktable_stream().await });
            }
            {
                let client = self.clone();
                tasks.spawn(async move { client.run_fault_stream().await });
            }

            // Either stream dying invalidates the session; drop the other
            // and re-register.
            if tasks.join_next().await.is_some() {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
            if !running() {
                return;
            }
            sleep(RECONNECT_DELAY).await;
        }
    }

    fn register_request(&self) -> RegisterRequest {
        RegisterRequest {
            job_id: self.job_id.clone(),
            role: CLUSTER_REGISTER_ROLE.to_string(),
        }
    }

    /// Registers against both services. `REGISTER_FAILED` is always
    /// re-reported on exhaustion, never debounced away.
    async fn register_with_retry<F>(&self, running: &F) -> bool
    where
        F: Fn() -> bool,
    {
        for attempt in 0..=REGISTER_MAX_RETRY_TIMES {
            if !running() {
                return false;
            }
            match self.register_once().await {
                Ok(()) => {
                    info!(endpoint = %self.endpoint, "Registered with cluster daemon");
                    self.flags.register_failed.store(false, Ordering::SeqCst);
                    return true;
                }
                Err(e) => {
                    warn!(attempt, "Cluster daemon registration failed: {e}");
                    sleep(RECONNECT_DELAY).await;
                }
            }
        }
        self.flags.register_failed.store(true, Ordering::SeqCst);
        self.alarms
            .raise(AlarmKind::RegisterFailed, "cluster daemon registration exhausted")
            .await;
        false
    }

    async fn register_once(&self) -> Result<(), ControlError> {
        let mut config_client = ConfigClient::connect(self.endpoint.clone()).await?;
        let reply = config_client
            .register(self.register_request())
            .await?
            .into_inner();
        if reply.code != 0 {
            return Err(ControlError::Unavailable(format!(
                "config registration refused: {}",
                reply.message
            )));
        }
        let mut fault_client = FaultClient::connect(self.endpoint.clone()).await?;
        let reply = fault_client
            .register(self.register_request())
            .await?
            .into_inner();
        if reply.code != 0 {
            return Err(ControlError::Unavailable(format!(
                "fault registration refused: {}",
                reply.message
            )));
        }
        Ok(())
    }

    async fn run_ranktable_stream(&self) {
        let result = self.subscribe_ranktable().await;
        if let Err(e) = result {
            warn!("Rank-table stream ended: {e}");
            self.report_once(
                &self.flags.ranktable_interrupted,
                AlarmKind::RankTableStreamInterrupted,
                "rank-table subscription interrupted",
            )
            .await;
        }
    }

    async fn subscribe_ranktable(&self) -> Result<(), ControlError> {
        let mut client = ConfigClient::connect(self.endpoint.clone()).await?;
        let mut stream = client
            .subscribe_rank_table(SubscribeRequest {
                job_id: self.job_id.clone(),
            })
            .await?
            .into_inner();

        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.message().await? {
            buffer.extend_from_slice(&chunk.payload);
            if !chunk.end_of_message {
                continue;
            }
            let payload = std::mem::take(&mut buffer);
            self.save_ranktable(&payload).await;
            self.clear_once(
                &self.flags.ranktable_interrupted,
                AlarmKind::RankTableStreamInterrupted,
                "rank-table subscription restored",
            )
            .await;
        }
        Err(ControlError::Unreachable(
            "rank-table stream closed by peer".to_string(),
        ))
    }

    async fn save_ranktable(&self, payload: &[u8]) {
        match self.loader.write(payload) {
            Ok(()) => {
                self.status.mark_ranktable_change();
                self.ranktable_saved.store(true, Ordering::SeqCst);
                debug!(bytes = payload.len(), "Rank-table update saved");
                self.clear_once(
                    &self.flags.save_failed,
                    AlarmKind::RankTableSaveFailed,
                    "rank-table save restored",
                )
                .await;
            }
            Err(e) => {
                warn!("Rank-table save failed: {e}");
                self.report_once(
                    &self.flags.save_failed,
                    AlarmKind::RankTableSaveFailed,
                    "rank-table save failed",
                )
                .await;
            }
        }
    }

    async fn run_fault_stream(&self) {
        let result = self.subscribe_faults().await;
        if let Err(e) = result {
            warn!("Fault stream ended: {e}");
            self.report_once(
                &self.flags.fault_interrupted,
                AlarmKind::FaultStreamInterrupted,
                "fault subscription interrupted",
            )
            .await;
        }
    }

    async fn subscribe_faults(&self) -> Result<(), ControlError> {
        let mut client = FaultClient::connect(self.endpoint.clone()).await?;
        let mut stream = client
            .subscribe_fault_msg_signal(SubscribeRequest {
                job_id: self.job_id.clone(),
            })
            .await?
            .into_inner();

        while let Some(signal) = stream.message().await? {
            self.clear_once(
                &self.flags.fault_interrupted,
                AlarmKind::FaultStreamInterrupted,
                "fault subscription restored",
            )
            .await;
            self.handle_fault_signal(signal);
        }
        Err(ControlError::Unreachable(
            "fault stream closed by peer".to_string(),
        ))
    }

    fn handle_fault_signal(&self, signal: FaultMsgSignal) {
        for node in signal.nodes {
            self.add_fault_node_by_node_ip(&node);
        }
    }

    /// Validates one fault entry and records it against the owning node.
    /// Invalid entries are logged and skipped, never propagated.
    pub fn add_fault_node_by_node_ip(&self, info: &NodeFaultInfo) {
        if !validate::is_valid_ip(&info.node_ip) {
            warn!(ip = %info.node_ip, "Fault signal carries an invalid node ip; skipped");
            return;
        }
        if !info.node_name.is_empty() && !validate::is_valid_node_name(&info.node_name) {
            warn!(name = %info.node_name, "Fault signal carries an invalid node name; skipped");
            return;
        }
        if info.device_ids.iter().any(|d| !validate::is_valid_device_id(d)) {
            warn!(ip = %info.node_ip, "Fault signal carries an invalid device id; skipped");
            return;
        }
        let Some(level) = validate::parse_fault_level(&info.fault_level) else {
            warn!(level = %info.fault_level, "Unknown fault level; skipped");
            return;
        };

        let node_id = self.status.node_id_by_host(&info.node_ip);
        match (level, node_id) {
            (FaultLevel::UnHealthy, Some(id)) if self.npu.has_critical_fault_level(level) => {
                info!(id, ip = %info.node_ip, "Critical hardware fault recorded");
                self.status.add_faulty_node(id, FaultKind::HardwareUnhealthy);
            }
            (FaultLevel::UnHealthy, None) if self.npu.has_critical_fault_level(level) => {
                // Keep the books even though membership does not know the ip.
                warn!(ip = %info.node_ip, "Critical fault for an unknown node");
                self.status
                    .add_faulty_node(UNKNOWN_NODE_ID, FaultKind::HardwareUnhealthy);
            }
            (FaultLevel::SubHealthy, Some(id)) => {
                self.status.add_faulty_node(id, FaultKind::HardwareSubHealthy);
            }
            (FaultLevel::SubHealthy, None) => {
                debug!(ip = %info.node_ip, "Sub-healthy fault for an unknown node; dropped");
            }
            (FaultLevel::Healthy, _) => {
                debug!(ip = %info.node_ip, "Healthy signal; nothing to record");
            }
            (FaultLevel::UnHealthy, _) => {}
        }
    }
}
