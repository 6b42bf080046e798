// tests/unit_groups_test.rs

use prismctl::core::roles::groups::{
    apply_group_peers, decode_peers, generate_groups, prefill_peers,
};
use prismctl::core::status::{Node, NodeStatus, Role, RoleLabel};

#[test]
fn test_generate_groups_round_robin() {
    let layout = generate_groups(&[1, 2, 3, 4], &[5, 6, 7, 8], &[], 2);
    assert_eq!(layout.len(), 2);
    assert_eq!(layout[&0].prefill_ids, vec![1, 3]);
    assert_eq!(layout[&1].prefill_ids, vec![2, 4]);
    assert_eq!(layout[&0].decode_ids, vec![5, 7]);
    assert_eq!(layout[&1].decode_ids, vec![6, 8]);
}

#[test]
fn test_generate_groups_always_yields_one_group() {
    let layout = generate_groups(&[], &[], &[], 16);
    assert_eq!(layout.len(), 1);
    assert!(layout[&0].prefill_ids.is_empty());
}

#[test]
fn test_peer_sets_cross_the_split() {
    let layout = generate_groups(&[1, 2], &[3, 4], &[5], 16);
    let group = &layout[&0];
    assert_eq!(prefill_peers(group), vec![3, 4, 5]);
    assert_eq!(decode_peers(group), vec![1, 2, 5]);
}

#[test]
fn test_apply_group_peers_is_symmetric_and_skips_tombstones() {
    let status = NodeStatus::new();
    for id in 1..=4u64 {
        status.add_node(Node::new(id, format!("10.0.0.{id}"), 1026));
    }
    for id in [1u64, 2] {
        status.commit_role(id, 0, Role::Prefill, RoleLabel::PrefillPrefer);
    }
    for id in [3u64, 4] {
        status.commit_role(id, 0, Role::Decode, RoleLabel::DecodePrefer);
    }
    apply_group_peers(&status, 0);

    // Peer symmetry: every READY pair sees each other.
    for p in [1u64, 2] {
        for d in [3u64, 4] {
            assert!(status.node(p).unwrap().dynamic_info.peers.contains(&d));
            assert!(status.node(d).unwrap().dynamic_info.peers.contains(&p));
        }
    }

    // Tombstoning a decode node removes it from every prefill peer list.
    status.update_delete_time(4, true);
    apply_group_peers(&status, 0);
    for p in [1u64, 2] {
        let peers = status.node(p).unwrap().dynamic_info.peers;
        assert!(!peers.contains(&4));
        assert!(peers.contains(&3));
    }
}
