// tests/unit_fault_manager_test.rs

mod common;

use prismctl::core::faults::HardwareFaultType;
use prismctl::core::roles::groups::apply_group_peers;
use prismctl::core::status::{FaultKind, NodeChanges, Role, RoleLabel};
use std::time::Duration;
use tempfile::tempdir;

/// A port that was just bound and released: connecting to it fails fast.
fn closed_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A harness over unreachable workers: every HTTP push fails fast against
/// closed loopback ports, which is exactly what a scale-in of dead nodes
/// looks like.
fn offline_harness() -> (common::Harness, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let ranktable = dir.path().join("ranktable.json");
    common::write_ranktable(
        &ranktable,
        "127.0.0.1",
        &[
            ("127.0.0.2".to_string(), closed_port()),
            ("127.0.0.3".to_string(), closed_port()),
            ("127.0.0.4".to_string(), closed_port()),
            ("127.0.0.5".to_string(), closed_port()),
        ],
    );
    let mut config = common::test_config(&ranktable, closed_port());
    config.timing.http_timeout = Duration::from_millis(500);
    (common::build_harness(config), dir)
}

fn seed_2p2d(harness: &common::Harness) {
    let loaded = harness.loader.load().unwrap();
    for node in &loaded.nodes {
        let mut stored = node.clone();
        stored.is_healthy = true;
        harness.status.add_node(stored);
    }
    for id in [0u64, 1] {
        harness.status.commit_role(id, 0, Role::Prefill, RoleLabel::PrefillPrefer);
    }
    for id in [2u64, 3] {
        harness.status.commit_role(id, 0, Role::Decode, RoleLabel::DecodePrefer);
    }
    apply_group_peers(&harness.status, 0);
}

#[tokio::test]
async fn test_hardware_fault_arms_the_timer_and_books_the_loss() {
    let (harness, _dir) = offline_harness();
    seed_2p2d(&harness);

    harness.faults.handle_hardware_fault(3, HardwareFaultType::Unhealthy);

    let counts = harness.faults.group_fault_counts();
    assert_eq!(counts[&0].decode, 1);
    assert!(harness.faults.is_scale_in_timer_active());
    harness.faults.stop();
    assert!(!harness.faults.is_scale_in_timer_active());
}

#[tokio::test]
async fn test_sub_healthy_fault_is_a_reserved_no_op() {
    let (harness, _dir) = offline_harness();
    seed_2p2d(&harness);

    harness.faults.handle_hardware_fault(3, HardwareFaultType::SubHealthy);
    assert!(harness.faults.group_fault_counts().is_empty());
    assert!(!harness.faults.is_scale_in_timer_active());
}

#[tokio::test]
async fn test_recorded_faults_are_dispatched_once() {
    let (harness, _dir) = offline_harness();
    seed_2p2d(&harness);

    harness.status.add_faulty_node(2, FaultKind::HardwareUnhealthy);
    harness.faults.process_recorded_faults();
    assert_eq!(harness.faults.group_fault_counts()[&0].decode, 1);

    // Nothing left to drain; a second pass changes nothing.
    harness.faults.process_recorded_faults();
    assert_eq!(harness.faults.group_fault_counts()[&0].decode, 1);
    harness.faults.stop();
}

#[tokio::test]
async fn test_scale_in_tombstones_and_shrinks_peers() {
    let (harness, _dir) = offline_harness();
    seed_2p2d(&harness);

    let loaded = harness.loader.load().unwrap();
    let survivors: Vec<_> = loaded.nodes.iter().filter(|n| n.id != 3).cloned().collect();
    let changes = NodeChanges {
        new_ids: vec![],
        removed_ids: vec![3],
        reappear_ids: vec![],
    };
    harness.faults.scaling_instance(&survivors, &changes).await;

    let node = harness.status.node(3).unwrap();
    assert!(node.is_deleted());
    let group = harness.status.group(0).unwrap();
    assert_eq!(group.decode_ids, vec![2]);

    // Scale-in monotonicity: no surviving peer list still names the id.
    for id in [0u64, 1, 2] {
        assert!(!harness.status.node(id).unwrap().dynamic_info.peers.contains(&3));
    }
    assert_eq!(harness.faults.group_fault_counts()[&0].decode, 1);
    harness.faults.stop();
}

#[tokio::test]
async fn test_scale_in_applied_twice_is_stable() {
    let (harness, _dir) = offline_harness();
    seed_2p2d(&harness);

    let loaded = harness.loader.load().unwrap();
    let survivors: Vec<_> = loaded.nodes.iter().filter(|n| n.id != 3).cloned().collect();
    let snapshot: Vec<u64> = survivors.iter().map(|n| n.id).collect();

    let changes = harness.status.detect_node_changes(&snapshot);
    harness.faults.scaling_instance(&survivors, &changes).await;

    // The tombstone absorbs the repeat: no further changes detected.
    let changes = harness.status.detect_node_changes(&snapshot);
    assert!(changes.is_empty());
    harness.faults.stop();
}
