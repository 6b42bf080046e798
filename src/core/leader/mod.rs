// src/core/leader/mod.rs

//! Controller leader election over the distributed lock store. Exactly one
//! controller instance holds the lock at a time; everything else in the
//! process gates on the shared `LeaderFlag`.

pub mod lock;

use crate::config::LockConfig;
use crate::core::errors::ControlError;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{info, warn};

pub use lock::{EtcdLockStore, LockStore, MemoryLockStore};

/// Invoked on every leadership change with the new state.
pub type LeaderCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// The process-wide leadership gate. Components park on
/// `wait_until_leader` instead of polling.
#[derive(Debug, Default)]
pub struct LeaderFlag {
    flag: AtomicBool,
    notify: Notify,
}

impl LeaderFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn set(&self, leader: bool) {
        self.flag.store(leader, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn wait_until_leader(&self) {
        while !self.is_leader() {
            let notified = self.notify.notified();
            if self.is_leader() {
                return;
            }
            notified.await;
        }
    }
}

/// Acquires and defends the controller lock. The lock value is this
/// controller's own `ip:port`; lease TTL guarantees hand-off when the
/// process dies without releasing.
pub struct LeaderAgent {
    store: Arc<dyn LockStore>,
    key: String,
    self_value: String,
    lease_ttl: i64,
    flag: Arc<LeaderFlag>,
    callback: Option<LeaderCallback>,
}

impl LeaderAgent {
    pub fn new(
        config: &LockConfig,
        store: Arc<dyn LockStore>,
        flag: Arc<LeaderFlag>,
        self_value: String,
    ) -> Self {
        Self {
            store,
            key: config.key.clone(),
            self_value,
            lease_ttl: config.lease_ttl,
            flag,
            callback: None,
        }
    }

    pub fn set_callback(&mut self, callback: LeaderCallback) {
        self.callback = Some(callback);
    }

    fn announce(&self, leader: bool) {
        self.flag.set(leader);
        if let Some(callback) = &self.callback {
            callback(leader);
        }
    }

    /// The acquisition loop. Runs until `running` reports false; leadership
    /// is dropped on exit.
    pub async fn run<F>(&self, running: F)
    where
        F: Fn() -> bool,
    {
        let mut retry_count: u64 = 0;
        while running() {
            match self.try_lead(&running).await {
                Ok(true) => {
                    // Held and lost leadership; restart acquisition promptly.
                    retry_count = 0;
                }
                Ok(false) => {
                    retry_count += 1;
                }
                Err(e) => {
                    warn!("Lock store unreachable: {e}");
                    retry_count += 1;
                }
            }
            // Jitter keeps a fleet of standbys from hammering the store in
            // lock-step.
            let backoff = retry_count.min((self.lease_ttl / 2).max(1) as u64);
            let jitter = rand::thread_rng().gen_range(0..250u64);
            sleep(Duration::from_secs(backoff) + Duration::from_millis(jitter)).await;
        }
        if self.flag.is_leader() {
            self.announce(false);
        }
    }

    /// One acquisition attempt; on success, defends the lease until it is
    /// lost. Returns whether leadership was held at all.
    async fn try_lead<F>(&self, running: &F) -> Result<bool, ControlError>
    where
        F: Fn() -> bool,
    {
        let lease = self.store.lease_grant(self.lease_ttl).await?;
        if !self.store.acquire_once(&self.key, &self.self_value, lease).await? {
            // Someone else owns the key; release the unused lease.
            let _ = self.store.lease_revoke(lease).await;
            return Ok(false);
        }

        info!(key = %self.key, owner = %self.self_value, lease, "Leadership acquired");
        self.announce(true);

        let keepalive_period = Duration::from_secs((self.lease_ttl / 2).max(1) as u64);
        while running() {
            sleep(keepalive_period).await;
            match self.store.lease_keep_alive(lease).await {
                Ok(ttl) if ttl > 0 => {}
                Ok(_) => {
                    warn!(lease, "Lease revoked; stepping down");
                    break;
                }
                Err(e) => {
                    warn!(lease, "Keep-alive failed: {e}; stepping down");
                    break;
                }
            }
        }

        self.announce(false);
        let _ = self.store.lease_revoke(lease).await;
        info!(key = %self.key, "Leadership released");
        Ok(true)
    }
}
