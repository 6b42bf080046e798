// tests/unit_scheduler_test.rs

//! End-to-end scheduler scenarios against mock workers and a mock
//! coordinator: fresh 2P2D bring-up, scale-in, scale-out of a returning
//! node, a worker that refuses its role, and warm recovery from the
//! persisted process file.

mod common;

use prismctl::core::status::{Role, RoleState};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::tempdir;

struct Cluster {
    harness: common::Harness,
    workers: Vec<Arc<common::WorkerState>>,
    endpoints: Vec<(String, u16)>,
    coordinator: Arc<common::CoordinatorState>,
    ranktable: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

async fn spawn_cluster(process_file: Option<&std::path::Path>) -> Cluster {
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
    let mut config = common::test_config(&ranktable, coordinator_addr.port());
    if let Some(path) = process_file {
        config.process_file.to_file = true;
        config.process_file.file_path = path.to_string_lossy().to_string();
    }
    let harness = common::build_harness(config);

    Cluster {
        harness,
        workers,
        endpoints,
        coordinator,
        ranktable,
        _dir: dir,
    }
}

fn refresh_ids(refresh: &Value) -> Vec<u64> {
    refresh["ids"]
        .as_array()
        .map(|ids| ids.iter().filter_map(|v| v.as_u64()).collect())
        .unwrap_or_default()
}

/// Role consistency and peer symmetry over the whole store.
fn assert_invariants(cluster: &Cluster) {
    let status = &cluster.harness.status;
    for (group_id, group) in status.groups() {
        for id in &group.prefill_ids {
            let node = status.node(*id).unwrap();
            assert_eq!(node.role, Role::Prefill, "node {id} in group {group_id}");
        }
        for id in &group.decode_ids {
            let node = status.node(*id).unwrap();
            assert_eq!(node.role, Role::Decode, "node {id} in group {group_id}");
        }
        for p in &group.prefill_ids {
            for d in &group.decode_ids {
                let pn = status.node(*p).unwrap();
                let dn = status.node(*d).unwrap();
                if pn.role_state == RoleState::Ready
                    && dn.role_state == RoleState::Ready
                    && !pn.is_deleted()
                    && !dn.is_deleted()
                {
                    assert!(pn.dynamic_info.peers.contains(d), "{p} missing peer {d}");
                    assert!(dn.dynamic_info.peers.contains(p), "{d} missing peer {p}");
                }
            }
        }
    }
}

async fn wait_for_bringup(cluster: &Cluster) {
    let status = cluster.harness.status.clone();
    assert!(
        common::wait_for(Duration::from_secs(30), || {
            let nodes = status.all_nodes();
            nodes.len() == 4
                && nodes
                    .iter()
                    .all(|n| n.role_state == RoleState::Ready && n.role.is_assigned())
        })
        .await,
        "cluster never reached READY"
    );
}

#[tokio::test]
async fn test_fresh_2p2d_bringup_scale_in_and_scale_out() {
    let cluster = spawn_cluster(None).await;
    let scheduler = cluster.harness.scheduler.clone();
    let run = tokio::spawn(scheduler.run());

    // S1: after bring-up, two prefills and two decodes, symmetric peers,
    // and a coordinator snapshot naming all four ids.
    wait_for_bringup(&cluster).await;
    assert_invariants(&cluster);
    let nodes = cluster.harness.status.all_nodes();
    let p = nodes.iter().filter(|n| n.role == Role::Prefill).count();
    let d = nodes.iter().filter(|n| n.role == Role::Decode).count();
    assert_eq!((p, d), (2, 2));

    let coordinator = cluster.coordinator.clone();
    assert!(
        common::wait_for(Duration::from_secs(10), || {
            coordinator.refreshes.try_lock().map(|r| !r.is_empty()).unwrap_or(false)
        })
        .await
    );
    let refresh = cluster.coordinator.last_refresh().await.unwrap();
    let mut ids = refresh_ids(&refresh);
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2, 3]);

    // S2: drop 127.0.0.5 from the rank-table; the next pass scales it in.
    let survivors: Vec<(String, u16)> = cluster.endpoints[..3].to_vec();
    common::write_ranktable(&cluster.ranktable, "127.0.0.1", &survivors);
    let status = cluster.harness.status.clone();
    assert!(
        common::wait_for(Duration::from_secs(30), || {
            status.node(3).map(|n| n.is_deleted()).unwrap_or(false)
        })
        .await,
        "node 3 was never tombstoned"
    );
    assert!(
        common::wait_for(Duration::from_secs(10), || {
            status
                .node(0)
                .map(|n| !n.dynamic_info.peers.contains(&3))
                .unwrap_or(false)
        })
        .await,
        "surviving prefill still lists the removed decode"
    );
    assert!(!cluster.harness.status.group(0).unwrap().decode_ids.contains(&3));
    assert_invariants(&cluster);

    // S3: the node returns; scale-out readmits it with the same id.
    common::write_ranktable(&cluster.ranktable, "127.0.0.1", &cluster.endpoints);
    assert!(
        common::wait_for(Duration::from_secs(30), || {
            status
                .node(3)
                .map(|n| !n.is_deleted() && n.role == Role::Decode)
                .unwrap_or(false)
        })
        .await,
        "node 3 never rejoined"
    );
    assert!(
        common::wait_for(Duration::from_secs(15), || {
            status
                .node(0)
                .map(|n| n.dynamic_info.peers.contains(&3))
                .unwrap_or(false)
        })
        .await,
        "prefill peers never regained the returning decode"
    );
    assert!(cluster.harness.status.group(0).unwrap().decode_ids.contains(&3));
    assert_invariants(&cluster);

    cluster.harness.shutdown.trigger();
    let _ = tokio::time::timeout(Duration::from_secs(10), run).await;
}

#[tokio::test]
async fn test_role_post_failure_sheds_the_node_but_keeps_running() {
    let cluster = spawn_cluster(None).await;
    // 127.0.0.4 (id 2) refuses every role post.
    cluster.workers[2].reject_role_posts.store(true, Ordering::SeqCst);

    let scheduler = cluster.harness.scheduler.clone();
    let run = tokio::spawn(scheduler.run());

    let status = cluster.harness.status.clone();
    assert!(
        common::wait_for(Duration::from_secs(45), || {
            let group = status.group(0);
            let healthy_ready = status
                .all_nodes()
                .iter()
                .filter(|n| n.role_state == RoleState::Ready)
                .count();
            group.map(|g| !g.contains(2)).unwrap_or(false) && healthy_ready == 3
        })
        .await,
        "faulty node was never shed"
    );

    let node = cluster.harness.status.node(2).unwrap();
    assert!(!node.is_healthy);
    assert_invariants(&cluster);

    // The controller is still reconciling, not wedged.
    assert!(cluster.harness.shutdown.is_running());
    cluster.harness.shutdown.trigger();
    let _ = tokio::time::timeout(Duration::from_secs(10), run).await;
}

#[tokio::test]
async fn test_recovery_resumes_without_reposting_matching_workers() {
    let dir = tempdir().unwrap();
    let process_file = dir.path().join("process.json");

    // First life: normal bring-up, persisting state.
    let cluster = spawn_cluster(Some(&process_file)).await;
    let scheduler = cluster.harness.scheduler.clone();
    let run = tokio::spawn(scheduler.run());
    wait_for_bringup(&cluster).await;
    cluster.harness.shutdown.trigger();
    let _ = tokio::time::timeout(Duration::from_secs(10), run).await;

    let posts_before: Vec<u32> = cluster
        .workers
        .iter()
        .map(|w| w.role_posts.load(Ordering::SeqCst))
        .collect();

    // Second life: same mocks, fresh controller, same process file.
    let mut config = common::test_config(&cluster.ranktable, cluster.harness.config.coordinator_port);
    config.process_file.to_file = true;
    config.process_file.file_path = process_file.to_string_lossy().to_string();
    let standby = common::build_harness(config);
    let scheduler = standby.scheduler.clone();
    let run = tokio::spawn(scheduler.run());

    let status = standby.status.clone();
    assert!(
        common::wait_for(Duration::from_secs(30), || {
            let nodes = status.all_nodes();
            nodes.len() == 4 && nodes.iter().all(|n| n.role.is_assigned())
        })
        .await,
        "standby never recovered the persisted view"
    );

    // Groups came back from persistence.
    let group = standby.status.group(0).unwrap();
    assert_eq!(group.prefill_ids.len() + group.decode_ids.len(), 4);

    // Give the loop a moment; matching workers must not be re-posted.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let posts_after: Vec<u32> = cluster
        .workers
        .iter()
        .map(|w| w.role_posts.load(Ordering::SeqCst))
        .collect();
    assert_eq!(posts_before, posts_after);

    standby.shutdown.trigger();
    let _ = tokio::time::timeout(Duration::from_secs(10), run).await;
}
