// tests/unit_role_switcher_test.rs

mod common;

use prismctl::core::coordinator::Coordinator;
use prismctl::core::roles::groups::apply_group_peers;
use prismctl::core::status::{Role, RoleDecision, RoleLabel, RoleState};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::tempdir;

struct SwitchFixture {
    harness: common::Harness,
    workers: Vec<Arc<common::WorkerState>>,
    coordinator: Arc<common::CoordinatorState>,
    _dir: tempfile::TempDir,
}

/// A live 2P2D cluster behind mock endpoints, with roles already pushed.
async fn live_2p2d() -> SwitchFixture {
    let ips = ["127.0.0.2", "127.0.0.3", "127.0.0.4", "127.0.0.5"];
    let mut workers = Vec::new();
    let mut endpoints = Vec::new();
    for ip in ips {
        let (state, addr) = common::spawn_worker(ip).await;
        workers.push(state);
        endpoints.push((ip.to_string(), addr.port()));
    }
    let (coordinator, coordinator_addr) = common::spawn_coordinator().await;

    let dir = tempdir().unwrap();
    let ranktable = dir.path().join("ranktable.json");
    common::write_ranktable(&ranktable, "127.0.0.1", &endpoints);
    let config = common::test_config(&ranktable, coordinator_addr.port());
    let harness = common::build_harness(config);
    harness
        .coordinator_store
        .replace(vec![Coordinator::new("127.0.0.1", coordinator_addr.port())]);

    let loaded = harness.loader.load().unwrap();
    for node in &loaded.nodes {
        let mut stored = node.clone();
        stored.is_healthy = true;
        stored.role_state = RoleState::Ready;
        harness.status.add_node(stored);
    }
    for id in [0u64, 1] {
        harness.status.commit_role(id, 0, Role::Prefill, RoleLabel::PrefillPrefer);
    }
    for id in [2u64, 3] {
        harness.status.commit_role(id, 0, Role::Decode, RoleLabel::DecodePrefer);
    }
    apply_group_peers(&harness.status, 0);

    SwitchFixture {
        harness,
        workers,
        coordinator,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_p_to_d_switch_rebalances_the_group() {
    let fixture = live_2p2d().await;
    let decision = RoleDecision {
        id: 1,
        group_id: 0,
        flex_p_ratio: 0,
        role: Role::Decode,
    };
    fixture
        .harness
        .switcher
        .process_single_role_switching(decision)
        .await
        .unwrap();

    // Final layout: P={0}, D={1,2,3}.
    let group = fixture.harness.status.group(0).unwrap();
    assert_eq!(group.prefill_ids, vec![0]);
    let mut decode = group.decode_ids.clone();
    decode.sort_unstable();
    assert_eq!(decode, vec![1, 2, 3]);

    // The switched worker was drained through the coordinator and now
    // reports the decode role.
    assert!(fixture.coordinator.offline_ids.lock().await.contains(&1));
    assert!(fixture.coordinator.online_ids.lock().await.contains(&1));
    assert_eq!(fixture.workers[1].role(), "decode");

    // Peer symmetry on the wire: the surviving prefill binds to every
    // decode and vice versa.
    let p_peers = fixture.workers[0].peers();
    for d in [1u64, 2, 3] {
        assert!(p_peers.contains(&d), "prefill missing peer {d}");
    }
    for d in [1usize, 2, 3] {
        assert_eq!(fixture.workers[d].peers(), vec![0]);
    }

    // The store marks the whole group READY again.
    for id in 0..4u64 {
        assert_eq!(
            fixture.harness.status.node(id).unwrap().role_state,
            RoleState::Ready
        );
    }
}

#[tokio::test]
async fn test_switch_is_vetoed_while_peer_tasks_are_active() {
    let fixture = live_2p2d().await;
    fixture.coordinator.query_is_end.store(false, Ordering::SeqCst);

    let decision = RoleDecision {
        id: 1,
        group_id: 0,
        flex_p_ratio: 0,
        role: Role::Decode,
    };
    let result = fixture
        .harness
        .switcher
        .process_single_role_switching(decision)
        .await;
    assert!(result.is_err());

    // Nothing moved, and the drained node went back online.
    let group = fixture.harness.status.group(0).unwrap();
    assert_eq!(group.prefill_ids, vec![0, 1]);
    assert_eq!(group.decode_ids, vec![2, 3]);
    assert!(fixture.coordinator.online_ids.lock().await.contains(&1));
}

#[tokio::test]
async fn test_switch_aborts_when_tasks_never_drain() {
    let fixture = live_2p2d().await;
    fixture.coordinator.tasks_value.store(5, Ordering::SeqCst);

    let decision = RoleDecision {
        id: 1,
        group_id: 0,
        flex_p_ratio: 0,
        role: Role::Decode,
    };
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        fixture.harness.switcher.process_single_role_switching(decision),
    )
    .await
    .expect("drain wait must be bounded");
    assert!(result.is_err());
    assert_eq!(fixture.harness.status.group(0).unwrap().prefill_ids, vec![0, 1]);
}

#[tokio::test]
async fn test_switch_to_same_role_is_a_no_op() {
    let fixture = live_2p2d().await;
    let before = fixture.workers[0].role_posts.load(Ordering::SeqCst);
    fixture
        .harness
        .switcher
        .process_single_role_switching(RoleDecision {
            id: 0,
            group_id: 0,
            flex_p_ratio: 0,
            role: Role::Prefill,
        })
        .await
        .unwrap();
    assert_eq!(fixture.workers[0].role_posts.load(Ordering::SeqCst), before);
}

#[tokio::test]
async fn test_flex_switch_sets_the_ratio_and_relinks() {
    let fixture = live_2p2d().await;
    let decision = RoleDecision {
        id: 3,
        group_id: 0,
        flex_p_ratio: 30,
        role: Role::Flex,
    };
    fixture
        .harness
        .switcher
        .process_single_role_switching(decision)
        .await
        .unwrap();

    let node = fixture.harness.status.node(3).unwrap();
    assert_eq!(node.role, Role::Flex);
    assert_eq!(node.static_info.flex_p_ratio, 30);
    let group = fixture.harness.status.group(0).unwrap();
    assert_eq!(group.flex_ids, vec![3]);
    assert_eq!(fixture.workers[3].role(), "flex");
}

#[tokio::test]
async fn test_recovery_repair_touches_memory_only() {
    let fixture = live_2p2d().await;
    let posts_before: u32 = fixture
        .workers
        .iter()
        .map(|w| w.role_posts.load(Ordering::SeqCst))
        .sum();

    // The worker reports decode although persistence says prefill.
    fixture
        .harness
        .switcher
        .update_abnormal_role_when_recovering(1, Role::Decode);

    let node = fixture.harness.status.node(1).unwrap();
    assert_eq!(node.role, Role::Decode);
    assert!(fixture.harness.status.group(0).unwrap().decode_ids.contains(&1));

    // No coordinator dance and no role posts.
    let posts_after: u32 = fixture
        .workers
        .iter()
        .map(|w| w.role_posts.load(Ordering::SeqCst))
        .sum();
    assert_eq!(posts_before, posts_after);
    assert!(fixture.coordinator.offline_ids.lock().await.is_empty());
}
