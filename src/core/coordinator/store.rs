// src/core/coordinator/store.rs

//! Mirror of the coordinator endpoints declared by the rank-table and the
//! master/backup state observed for them.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One coordinator endpoint. Exactly one coordinator is master at a time;
/// selection uses the observed receive flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinator {
    pub ip: String,
    pub port: u16,
    pub is_master: bool,
    pub is_healthy: bool,
    pub recv_flow: i64,
}

impl Coordinator {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            is_master: false,
            is_healthy: true,
            recv_flow: 0,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Default)]
struct CoordinatorStoreInner {
    coordinators: Vec<Coordinator>,
    /// Last published view including master flags, kept for standby handover.
    with_master_info: Vec<Coordinator>,
}

/// RW-locked mirror shared between the loader, the scheduler, and the
/// backup handler.
#[derive(Debug, Default)]
pub struct CoordinatorStore {
    inner: RwLock<CoordinatorStoreInner>,
}

impl CoordinatorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the endpoint list, keeping master flags of endpoints that survive.
    pub fn replace(&self, fresh: Vec<Coordinator>) {
        let mut inner = self.inner.write();
        let previous = std::mem::take(&mut inner.coordinators);
        inner.coordinators = fresh
            .into_iter()
            .map(|mut c| {
                if let Some(old) = previous
                    .iter()
                    .find(|p| p.ip == c.ip && p.port == c.port)
                {
                    c.is_master = old.is_master;
                    c.recv_flow = old.recv_flow;
                }
                c
            })
            .collect();
    }

    pub fn coordinators(&self) -> Vec<Coordinator> {
        self.inner.read().coordinators.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().coordinators.is_empty()
    }

    /// The coordinator currently holding the master flag, if any.
    pub fn master(&self) -> Option<Coordinator> {
        self.inner
            .read()
            .coordinators
            .iter()
            .find(|c| c.is_master)
            .cloned()
    }

    pub fn set_master(&self, ip: &str, port: u16) {
        let mut inner = self.inner.write();
        for c in inner.coordinators.iter_mut() {
            c.is_master = c.ip == ip && c.port == port;
        }
    }

    pub fn update_recv_flow(&self, ip: &str, port: u16, recv_flow: i64, healthy: bool) {
        let mut inner = self.inner.write();
        if let Some(c) = inner
            .coordinators
            .iter_mut()
            .find(|c| c.ip == ip && c.port == port)
        {
            c.recv_flow = recv_flow;
            c.is_healthy = healthy;
        }
    }

    /// Publishes the current view (with master flags) for standby handover.
    pub fn publish_master_info(&self) {
        let mut inner = self.inner.write();
        inner.with_master_info = inner.coordinators.clone();
    }

    pub fn master_info(&self) -> Vec<Coordinator> {
        self.inner.read().with_master_info.clone()
    }
}
