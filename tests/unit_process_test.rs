// tests/unit_process_test.rs

use prismctl::config::Config;
use prismctl::core::process::ProcessManager;
use prismctl::core::status::{Group, Node, NodeStatus, Role, RoleLabel};
use tempfile::tempdir;

fn manager_for(path: &std::path::Path) -> ProcessManager {
    let mut config = Config::default();
    config.process_file.to_file = true;
    config.process_file.file_path = path.to_string_lossy().to_string();
    ProcessManager::new(&config)
}

#[test]
fn test_disabled_manager_neither_saves_nor_loads() {
    let manager = ProcessManager::new(&Config::default());
    assert!(!manager.is_enabled());
    manager.save(&NodeStatus::new(), Default::default());
    assert!(manager.load().unwrap().is_none());
}

#[test]
fn test_save_then_load_round_trips_nodes_and_groups() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("process.json");
    let manager = manager_for(&path);

    let status = NodeStatus::new();
    let mut node = Node::new(1, "10.0.0.1", 1026);
    node.role = Role::Prefill;
    node.label = RoleLabel::PrefillStatic;
    status.add_node(node);
    status.upsert_group(
        0,
        Group {
            prefill_ids: vec![1],
            decode_ids: vec![],
            flex_ids: vec![],
        },
    );

    manager.save(&status, Default::default());
    let snapshot = manager.load().unwrap().expect("snapshot saved");
    assert_eq!(snapshot.nodes.len(), 1);
    assert_eq!(snapshot.nodes[0].role, Role::Prefill);
    assert_eq!(snapshot.groups[&0].prefill_ids, vec![1]);
    assert!(snapshot.has_assigned_roles());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }
}

#[test]
fn test_roleless_snapshot_is_not_a_recovery_source() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("process.json");
    let manager = manager_for(&path);

    let status = NodeStatus::new();
    status.add_node(Node::new(1, "10.0.0.1", 1026));
    manager.save(&status, Default::default());

    let snapshot = manager.load().unwrap().unwrap();
    assert!(!snapshot.has_assigned_roles());
}
