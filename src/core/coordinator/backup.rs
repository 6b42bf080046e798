// src/core/coordinator/backup.rs

//! Elects a master coordinator from observed receive flow and keeps the
//! standby informed. Leader-only, periodic.

use crate::core::constants::COORDINATOR_BACKUP_INTERVAL;
use crate::core::controller::Shutdown;
use crate::core::coordinator::{Coordinator, CoordinatorStore};
use crate::core::leader::LeaderFlag;
use crate::core::requests::CoordinatorRequestHandler;
use crate::core::requests::coordinator::BackupInfo;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, warn};

pub struct CoordinatorBackupHandler {
    store: Arc<CoordinatorStore>,
    handler: CoordinatorRequestHandler,
    leader: Arc<LeaderFlag>,
    shutdown: Arc<Shutdown>,
    /// Remembers the endpoint last promoted by a tie-break so consecutive
    /// ties rotate instead of sticking.
    last_random_master: Mutex<Option<String>>,
}

impl CoordinatorBackupHandler {
    pub fn new(
        store: Arc<CoordinatorStore>,
        handler: CoordinatorRequestHandler,
        leader: Arc<LeaderFlag>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            store,
            handler,
            leader,
            shutdown,
            last_random_master: Mutex::new(None),
        }
    }

    pub async fn run(self: Arc<Self>) {
        while self.shutdown.is_running() {
            if self.leader.is_leader() {
                self.check_coordinator_status().await;
            }
            sleep(COORDINATOR_BACKUP_INTERVAL).await;
        }
    }

    async fn check_coordinator_status(&self) {
        let coordinators = self.store.coordinators();
        // The backup protocol only makes sense for a master/standby pair;
        // any other shape is mirrored out as-is.
        if coordinators.len() != 2 {
            self.store.publish_master_info();
            return;
        }

        let mut observed: Vec<(Coordinator, Option<(bool, i64)>)> = Vec::new();
        for coordinator in &coordinators {
            match self.handler.recvs_info(coordinator).await {
                Ok(info) => {
                    self.store.update_recv_flow(
                        &coordinator.ip,
                        coordinator.port,
                        info.recv_flow,
                        true,
                    );
                    observed.push((coordinator.clone(), Some((info.is_master, info.recv_flow))));
                }
                Err(e) => {
                    warn!(coordinator = %coordinator.endpoint(), "recvs_info failed: {e}");
                    self.store
                        .update_recv_flow(&coordinator.ip, coordinator.port, 0, false);
                    observed.push((coordinator.clone(), None));
                }
            }
        }

        let flows: Vec<i64> = observed
            .iter()
            .map(|(_, info)| info.map(|(_, flow)| flow).unwrap_or(0))
            .collect();
        let masters: Vec<bool> = observed
            .iter()
            .map(|(_, info)| info.map(|(is_master, _)| is_master).unwrap_or(false))
            .collect();

        let both_flowing = flows[0] > 0 && flows[1] > 0;
        let both_idle_claiming = flows[0] == 0 && flows[1] == 0 && masters[0] && masters[1];

        let (master_idx, is_random_pick) = if both_flowing || both_idle_claiming {
            // Split brain or a silent tie: rotate away from the endpoint
            // the previous tie-break promoted.
            let last = self.last_random_master.lock().clone();
            let idx = match last {
                Some(endpoint) if endpoint == observed[0].0.endpoint() => 1,
                _ => 0,
            };
            *self.last_random_master.lock() = Some(observed[idx].0.endpoint());
            (idx, true)
        } else if flows[0] > 0 {
            (0, false)
        } else if flows[1] > 0 {
            (1, false)
        } else if masters[0] {
            (0, false)
        } else if masters[1] {
            (1, false)
        } else {
            (0, false)
        };

        let master = &observed[master_idx].0;
        self.store.set_master(&master.ip, master.port);
        self.store.publish_master_info();
        debug!(master = %master.endpoint(), is_random_pick, "Coordinator master decided");

        for (idx, (coordinator, _)) in observed.iter().enumerate() {
            let info = BackupInfo {
                is_master: idx == master_idx,
                is_abnormal: both_flowing,
                is_random_pick,
            };
            if let Err(e) = self.handler.post_backup_info(coordinator, &info).await {
                warn!(coordinator = %coordinator.endpoint(), "backup_info push failed: {e}");
            }
        }
    }
}
