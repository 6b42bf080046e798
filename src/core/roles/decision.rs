// src/core/roles/decision.rs

//! The seam to the role-decision engine. The engine is a black box with a
//! fixed contract: it is started with the live instance list (re-collectable
//! on demand through a callback), a request-length summary, and the global
//! P:D ratio, and it emits `RoleDecision` batches through a sink callback.
//!
//! `RatioEngine` is the in-tree implementation of that contract, so the
//! controller runs without any vendor library.

use crate::core::errors::ControlError;
use crate::core::status::{Role, RoleDecision};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// What the engine gets to see about one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSnapshot {
    pub id: u64,
    pub group_id: u64,
    pub role: Role,
    pub hardware_type: Option<String>,
}

/// Global inputs to one decision round.
#[derive(Debug, Clone)]
pub struct EngineInputs {
    pub p_rate: usize,
    pub d_rate: usize,
    pub has_flex: bool,
    pub request_input_len: usize,
    pub request_output_len: usize,
    pub is_recovering: bool,
}

/// Re-reports the live instance list whenever the engine asks.
pub type InstanceCollector = Arc<dyn Fn() -> Vec<InstanceSnapshot> + Send + Sync>;
/// Receives each decision batch the engine produces.
pub type DecisionSink = Arc<dyn Fn(Vec<RoleDecision>) + Send + Sync>;

pub trait RoleDecisionEngine: Send + Sync {
    fn start(
        &self,
        inputs: EngineInputs,
        collector: InstanceCollector,
        sink: DecisionSink,
    ) -> Result<(), ControlError>;

    fn stop(&self);
}

/// Assigns roles so that the produced P:D split tracks the configured
/// ratio. Instances that already carry a role keep it; only `Undefined`
/// instances are assigned. Group placement is left to the group generator.
#[derive(Debug, Default)]
pub struct RatioEngine;

impl RoleDecisionEngine for RatioEngine {
    fn start(
        &self,
        inputs: EngineInputs,
        collector: InstanceCollector,
        sink: DecisionSink,
    ) -> Result<(), ControlError> {
        let instances = collector();
        if instances.is_empty() {
            return Err(ControlError::ResourceLimit(
                "no instances to decide roles for".to_string(),
            ));
        }

        let mut decisions = Vec::with_capacity(instances.len());
        let mut undecided = Vec::new();
        for instance in &instances {
            if instance.role.is_assigned() {
                decisions.push(RoleDecision {
                    id: instance.id,
                    group_id: instance.group_id,
                    flex_p_ratio: 0,
                    role: instance.role,
                });
            } else {
                undecided.push(instance.id);
            }
        }

        // Walk the unassigned ids in `p_rate` P then `d_rate` D strides so
        // the final split tracks the requested ratio at every prefix.
        // Sorted so the same membership always yields the same layout.
        undecided.sort_unstable();
        let stride = inputs.p_rate + inputs.d_rate;
        for (idx, id) in undecided.iter().enumerate() {
            let role = if inputs.has_flex && undecided.len() == 1 {
                Role::Flex
            } else if idx % stride < inputs.p_rate {
                Role::Prefill
            } else {
                Role::Decode
            };
            decisions.push(RoleDecision {
                id: *id,
                group_id: 0,
                flex_p_ratio: if role == Role::Flex { 50 } else { 0 },
                role,
            });
        }

        info!(
            total = decisions.len(),
            p_rate = inputs.p_rate,
            d_rate = inputs.d_rate,
            recovering = inputs.is_recovering,
            "Ratio engine produced role decisions"
        );
        sink(decisions);
        Ok(())
    }

    fn stop(&self) {}
}

/// Holds the engine handle and the latest decision batch for the scheduler
/// to poll during bring-up.
pub struct RoleManager {
    engine: Arc<dyn RoleDecisionEngine>,
    decisions: Arc<Mutex<Vec<RoleDecision>>>,
}

impl RoleManager {
    pub fn new(engine: Arc<dyn RoleDecisionEngine>) -> Self {
        Self {
            engine,
            decisions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Starts the engine; emitted batches replace the held decision set.
    pub fn start(
        &self,
        inputs: EngineInputs,
        collector: InstanceCollector,
    ) -> Result<(), ControlError> {
        let held = self.decisions.clone();
        let sink: DecisionSink = Arc::new(move |batch| {
            debug!(len = batch.len(), "Decision batch received");
            *held.lock() = batch;
        });
        self.engine.start(inputs, collector, sink)
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    pub fn decisions_len(&self) -> usize {
        self.decisions.lock().len()
    }

    pub fn decisions(&self) -> Vec<RoleDecision> {
        self.decisions.lock().clone()
    }

    pub fn take_decisions(&self) -> Vec<RoleDecision> {
        std::mem::take(&mut *self.decisions.lock())
    }

    /// Re-derives the global ratio from an emitted decision set:
    /// `|P|/gcd : |D|/gcd`, both sides capped.
    pub fn derive_pd_rate(decisions: &[RoleDecision], cap: usize) -> Option<(usize, usize)> {
        let p = decisions.iter().filter(|d| d.role == Role::Prefill).count();
        let d = decisions.iter().filter(|d| d.role == Role::Decode).count();
        if p == 0 || d == 0 {
            return None;
        }
        let g = gcd(p, d);
        Some(((p / g).min(cap), (d / g).min(cap)))
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}
