// src/core/faults/timer.rs

//! The non-redundant scale-in timer. Armed on the first critical hardware
//! fault; every second firing runs the release strategy, so the effective
//! action period is twice the tick. Stopped as soon as replacement
//! capacity arrives.

use super::FaultManager;
use crate::core::constants::SCALE_IN_TIMER_PERIOD;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct ScaleInTimer {
    active: AtomicBool,
    fire_count: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScaleInTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Arms the timer; a second start while armed is a no-op.
    pub fn start(&self, manager: Arc<FaultManager>) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        self.fire_count.store(0, Ordering::SeqCst);
        info!(period = ?SCALE_IN_TIMER_PERIOD, "Non-redundant scale-in timer armed");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCALE_IN_TIMER_PERIOD);
            // The first tick of a tokio interval completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !manager.timer.is_active() {
                    return;
                }
                let fires = manager.timer.fire_count.fetch_add(1, Ordering::SeqCst) + 1;
                if fires % 2 == 0 {
                    manager.instance_level_non_redundant_scale_in().await;
                } else {
                    debug!(fires, "Scale-in timer tick (no action this round)");
                }
            }
        });
        *self.handle.lock() = Some(task);
    }

    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.handle.lock().take() {
            task.abort();
        }
        info!("Non-redundant scale-in timer stopped");
    }
}
