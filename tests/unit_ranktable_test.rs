// tests/unit_ranktable_test.rs

use prismctl::ControlError;
use prismctl::config::Config;
use prismctl::core::ranktable::{RankTableFile, RankTableLoader};
use serde_json::json;
use tempfile::tempdir;

fn loader_for(path: &std::path::Path) -> RankTableLoader {
    let mut config = Config::default();
    config.global_rank_table_path = path.to_string_lossy().to_string();
    config.check_input_file_permission = false;
    config.server_control_port = 1026;
    RankTableLoader::new(&config)
}

fn basic_table() -> serde_json::Value {
    json!({
        "server_group_list": [
            {
                "group_id": "0",
                "server_list": [{ "server_id": "127.0.0.10", "server_ip": "127.0.0.10" }],
            },
            {
                "group_id": "2",
                "server_list": [
                    {
                        "server_id": "127.0.0.2",
                        "server_ip": "127.0.0.2",
                        "predict_port": "1025",
                        "mgmt_port": "1026",
                    },
                    {
                        "server_id": "127.0.0.3",
                        "server_ip": "127.0.0.3",
                        "predict_port": "1025",
                        "mgmt_port": "1026",
                    },
                ],
            },
        ],
    })
}

#[tokio::test]
async fn test_load_basic_table() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ranktable.json");
    std::fs::write(&path, basic_table().to_string()).unwrap();

    let loader = loader_for(&path);
    let loaded = loader.load().unwrap();
    assert_eq!(loaded.coordinators.len(), 1);
    assert_eq!(loaded.nodes.len(), 2);
    assert_eq!(loaded.nodes[0].id, 0);
    assert_eq!(loaded.nodes[1].id, 1);
    assert_eq!(loaded.nodes[0].mgmt_port, 1026);
}

#[tokio::test]
async fn test_ids_are_stable_across_reloads() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ranktable.json");
    std::fs::write(&path, basic_table().to_string()).unwrap();

    let loader = loader_for(&path);
    let first = loader.load().unwrap();
    let id_of = |loaded: &prismctl::core::ranktable::LoadedRankTable, ip: &str| {
        loaded.nodes.iter().find(|n| n.host == ip).map(|n| n.id)
    };

    // Add a third worker and reload; the first two keep their ids.
    let mut table = basic_table();
    table["server_group_list"][1]["server_list"]
        .as_array_mut()
        .unwrap()
        .push(json!({
            "server_id": "127.0.0.4",
            "server_ip": "127.0.0.4",
            "mgmt_port": "1026",
        }));
    std::fs::write(&path, table.to_string()).unwrap();

    let second = loader.load().unwrap();
    assert_eq!(id_of(&first, "127.0.0.2"), id_of(&second, "127.0.0.2"));
    assert_eq!(id_of(&first, "127.0.0.3"), id_of(&second, "127.0.0.3"));
    assert_eq!(id_of(&second, "127.0.0.4"), Some(2));
}

#[tokio::test]
async fn test_duplicate_endpoint_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ranktable.json");
    let mut table = basic_table();
    table["server_group_list"][1]["server_list"][1]["server_ip"] = json!("127.0.0.2");
    table["server_group_list"][1]["server_list"][1]["server_id"] = json!("127.0.0.2");
    std::fs::write(&path, table.to_string()).unwrap();

    let loader = loader_for(&path);
    match loader.load() {
        Err(ControlError::OperationRepeat(_)) => {}
        other => panic!("expected OperationRepeat, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_file_is_not_found() {
    let dir = tempdir().unwrap();
    let loader = loader_for(&dir.path().join("absent.json"));
    match loader.load() {
        Err(ControlError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn test_port_out_of_range_fails_validation() {
    let mut table = basic_table();
    table["server_group_list"][1]["server_list"][0]["mgmt_port"] = json!("80");
    let err = RankTableFile::parse(&table.to_string()).unwrap_err();
    assert!(matches!(err, ControlError::InvalidInput(_)), "{err:?}");
}

#[test]
fn test_reserved_group_id_fails_validation() {
    let mut table = basic_table();
    table["server_group_list"][1]["group_id"] = json!("1");
    let err = RankTableFile::parse(&table.to_string()).unwrap_err();
    assert!(matches!(err, ControlError::InvalidInput(_)), "{err:?}");
}

#[test]
fn test_coordinator_group_is_capped_at_two() {
    let mut table = basic_table();
    table["server_group_list"][0]["server_list"] = json!([
        { "server_id": "127.0.0.10", "server_ip": "127.0.0.10" },
        { "server_id": "127.0.0.11", "server_ip": "127.0.0.11" },
        { "server_id": "127.0.0.12", "server_ip": "127.0.0.12" },
    ]);
    let err = RankTableFile::parse(&table.to_string()).unwrap_err();
    assert!(matches!(err, ControlError::InvalidInput(_)), "{err:?}");
}

#[tokio::test]
async fn test_write_then_load_is_identity_on_validated_fields() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ranktable.json");
    let loader = loader_for(&path);

    loader.write(basic_table().to_string().as_bytes()).unwrap();
    let loaded = loader.load().unwrap();
    assert_eq!(loaded.nodes.len(), 2);
    assert_eq!(loaded.nodes[0].host, "127.0.0.2");
    assert_eq!(loaded.nodes[0].predict_port, 1025);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }
}

#[tokio::test]
async fn test_instance_hash_is_order_insensitive() {
    let dir = tempdir().unwrap();
    let path_a = dir.path().join("a.json");
    let path_b = dir.path().join("b.json");

    let make = |ips: [&str; 2]| {
        json!({
            "server_group_list": [
                { "group_id": "0", "server_list": [{ "server_id": "127.0.0.10", "server_ip": "127.0.0.10" }] },
                { "group_id": "3", "deploy_server": "1", "server_list": [
                    { "server_id": ips[0], "server_ip": ips[0], "mgmt_port": "1026" },
                    { "server_id": ips[1], "server_ip": ips[1], "mgmt_port": "1026" },
                ]},
            ],
        })
    };
    std::fs::write(&path_a, make(["127.0.0.2", "127.0.0.3"]).to_string()).unwrap();
    std::fs::write(&path_b, make(["127.0.0.3", "127.0.0.2"]).to_string()).unwrap();

    let infos_a = loader_for(&path_a).instance_infos().unwrap();
    let infos_b = loader_for(&path_b).instance_infos().unwrap();
    assert_eq!(infos_a.len(), 1);
    assert_eq!(infos_a[0].hash_id, infos_b[0].hash_id);
}

#[tokio::test]
async fn test_distributed_slices_share_a_virtual_id() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ranktable.json");
    let device = |rank: &str, ip: &str| {
        json!({
            "device_id": "0",
            "device_ip": ip,
            "device_logical_id": "0",
            "rank_id": rank,
        })
    };
    let table = json!({
        "server_group_list": [
            { "group_id": "0", "server_list": [{ "server_id": "127.0.0.10", "server_ip": "127.0.0.10" }] },
            { "group_id": "3", "deploy_server": "1", "server_list": [
                { "server_id": "127.0.0.2", "server_ip": "127.0.0.2", "mgmt_port": "1026",
                  "device": [device("0", "10.1.0.1")] },
                { "server_id": "127.0.0.3", "server_ip": "127.0.0.3", "mgmt_port": "1026",
                  "device": [device("1", "10.1.0.2")] },
            ]},
        ],
    });
    std::fs::write(&path, table.to_string()).unwrap();

    let mut config = Config::default();
    config.global_rank_table_path = path.to_string_lossy().to_string();
    config.check_input_file_permission = false;
    config.multi_node.d_distribute = true;
    config.multi_node.d_node_num = 2;
    let loader = RankTableLoader::new(&config);

    let loaded = loader.load().unwrap();
    assert_eq!(loaded.nodes.len(), 2);
    let virtual_ids: Vec<u64> = loaded.nodes.iter().map(|n| n.virtual_id).collect();
    assert_eq!(virtual_ids[0], virtual_ids[1]);
    assert_ne!(loaded.nodes[0].id, loaded.nodes[1].id);
    assert_eq!(loaded.nodes[0].dp_group_peers, loaded.nodes[1].dp_group_peers);
}
