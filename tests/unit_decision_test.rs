// tests/unit_decision_test.rs

use prismctl::core::roles::decision::{
    EngineInputs, InstanceSnapshot, RatioEngine, RoleDecisionEngine, RoleManager,
};
use prismctl::core::status::{Role, RoleDecision};
use std::sync::Arc;

fn snapshot(id: u64, role: Role) -> InstanceSnapshot {
    InstanceSnapshot {
        id,
        group_id: 0,
        role,
        hardware_type: None,
    }
}

fn inputs(p_rate: usize, d_rate: usize) -> EngineInputs {
    EngineInputs {
        p_rate,
        d_rate,
        has_flex: false,
        request_input_len: 3000,
        request_output_len: 200,
        is_recovering: false,
    }
}

fn run_engine(instances: Vec<InstanceSnapshot>, inputs: EngineInputs) -> Vec<RoleDecision> {
    let manager = RoleManager::new(Arc::new(RatioEngine));
    let collector = Arc::new(move || instances.clone());
    manager.start(inputs, collector).unwrap();
    manager.decisions()
}

#[test]
fn test_ratio_engine_tracks_one_to_one() {
    let decisions = run_engine(
        (0..4).map(|id| snapshot(id, Role::Undefined)).collect(),
        inputs(1, 1),
    );
    let p = decisions.iter().filter(|d| d.role == Role::Prefill).count();
    let d = decisions.iter().filter(|d| d.role == Role::Decode).count();
    assert_eq!((p, d), (2, 2));
    // Deterministic: the lowest ids take the prefill side.
    assert_eq!(
        decisions.iter().find(|d| d.id == 0).unwrap().role,
        Role::Prefill
    );
}

#[test]
fn test_ratio_engine_preserves_preassigned_roles() {
    let decisions = run_engine(
        vec![
            snapshot(0, Role::Decode),
            snapshot(1, Role::Undefined),
            snapshot(2, Role::Undefined),
        ],
        inputs(1, 1),
    );
    assert_eq!(
        decisions.iter().find(|d| d.id == 0).unwrap().role,
        Role::Decode
    );
    assert_eq!(decisions.len(), 3);
}

#[test]
fn test_ratio_engine_rejects_empty_cluster() {
    let manager = RoleManager::new(Arc::new(RatioEngine));
    let collector = Arc::new(Vec::new);
    assert!(manager.start(inputs(1, 1), collector).is_err());
}

#[test]
fn test_derive_pd_rate_reduces_by_gcd_and_caps() {
    let decisions: Vec<RoleDecision> = (0..6)
        .map(|id| RoleDecision {
            id,
            group_id: 0,
            flex_p_ratio: 0,
            role: if id < 2 { Role::Prefill } else { Role::Decode },
        })
        .collect();
    // 2P:4D reduces to 1:2.
    assert_eq!(RoleManager::derive_pd_rate(&decisions, 15), Some((1, 2)));

    let lopsided: Vec<RoleDecision> = (0..33)
        .map(|id| RoleDecision {
            id,
            group_id: 0,
            flex_p_ratio: 0,
            role: if id == 0 { Role::Prefill } else { Role::Decode },
        })
        .collect();
    // 1P:32D caps the decode side at 15.
    assert_eq!(RoleManager::derive_pd_rate(&lopsided, 15), Some((1, 15)));
}

#[test]
fn test_single_spare_becomes_flex_when_enabled() {
    let mut flex_inputs = inputs(1, 1);
    flex_inputs.has_flex = true;
    let decisions = run_engine(
        vec![snapshot(0, Role::Prefill), snapshot(1, Role::Undefined)],
        flex_inputs,
    );
    assert_eq!(
        decisions.iter().find(|d| d.id == 1).unwrap().role,
        Role::Flex
    );
}
