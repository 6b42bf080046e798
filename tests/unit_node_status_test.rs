// tests/unit_node_status_test.rs

use prismctl::core::status::{FaultKind, Group, Node, NodeStatus, Role, RoleLabel};

fn node(id: u64) -> Node {
    Node::new(id, format!("10.0.0.{id}"), 1026)
}

#[test]
fn test_detect_node_changes_classifies_all_three_kinds() {
    let status = NodeStatus::new();
    status.add_node(node(1));
    status.add_node(node(2));
    status.add_node(node(3));
    status.update_delete_time(3, true);

    // 1 stays, 2 is gone, 3 reappears, 4 is new.
    let changes = status.detect_node_changes(&[1, 3, 4]);
    assert_eq!(changes.removed_ids, vec![2]);
    assert_eq!(changes.new_ids, vec![4]);
    assert_eq!(changes.reappear_ids, vec![3]);
}

#[test]
fn test_detect_node_changes_ignores_tombstones_on_removal() {
    let status = NodeStatus::new();
    status.add_node(node(1));
    status.update_delete_time(1, true);

    let changes = status.detect_node_changes(&[]);
    assert!(changes.removed_ids.is_empty());
}

#[test]
fn test_commit_role_keeps_membership_and_role_in_step() {
    let status = NodeStatus::new();
    status.add_node(node(1));
    status.upsert_group(0, Group::default());

    status.commit_role(1, 0, Role::Prefill, RoleLabel::PrefillPrefer);
    let group = status.group(0).unwrap();
    assert_eq!(group.prefill_ids, vec![1]);
    assert_eq!(status.node(1).unwrap().role, Role::Prefill);

    // Moving the same id to the decode side removes it from prefill.
    status.commit_role(1, 0, Role::Decode, RoleLabel::DecodeStatic);
    let group = status.group(0).unwrap();
    assert!(group.prefill_ids.is_empty());
    assert_eq!(group.decode_ids, vec![1]);
    assert_eq!(status.node(1).unwrap().role, Role::Decode);
}

#[test]
fn test_commit_role_is_idempotent() {
    let status = NodeStatus::new();
    status.add_node(node(1));
    status.commit_role(1, 0, Role::Decode, RoleLabel::DecodeStatic);
    status.commit_role(1, 0, Role::Decode, RoleLabel::DecodeStatic);
    assert_eq!(status.group(0).unwrap().decode_ids, vec![1]);
}

#[test]
fn test_faulty_nodes_are_drained_once() {
    let status = NodeStatus::new();
    status.add_faulty_node(7, FaultKind::HardwareUnhealthy);
    status.add_faulty_node(8, FaultKind::SoftwareUnreachable);

    let drained = status.take_faulty_nodes();
    assert_eq!(drained.len(), 2);
    assert!(status.take_faulty_nodes().is_empty());
}

#[test]
fn test_live_group_members_excludes_tombstones() {
    let status = NodeStatus::new();
    for id in 1..=3 {
        status.add_node(node(id));
    }
    status.upsert_group(
        0,
        Group {
            prefill_ids: vec![1],
            decode_ids: vec![2, 3],
            flex_ids: vec![],
        },
    );
    status.update_delete_time(3, true);

    let mut live = status.live_group_members(0);
    live.sort_unstable();
    assert_eq!(live, vec![1, 2]);
}

#[test]
fn test_node_lookup_by_host_covers_sub_servers() {
    let status = NodeStatus::new();
    let mut n = node(5);
    n.servers.push(prismctl::core::status::ServerInfo {
        server_id: "10.9.9.9".to_string(),
        server_ip: "10.9.9.9".to_string(),
        devices: vec![],
        super_pod_id: None,
        dp_id: 0,
    });
    status.add_node(n);

    assert_eq!(status.node_id_by_host("10.0.0.5"), Some(5));
    assert_eq!(status.node_id_by_host("10.9.9.9"), Some(5));
    assert_eq!(status.node_id_by_host("10.1.1.1"), None);
}

#[test]
fn test_instance_id_is_smallest_dp_peer() {
    let mut n = node(9);
    n.dp_group_peers = vec![9, 4, 7];
    assert_eq!(n.instance_id(), 4);
    assert_eq!(node(3).instance_id(), 3);
}
