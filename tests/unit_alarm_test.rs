// tests/unit_alarm_test.rs

use prismctl::core::alarm::{AlarmKind, AlarmRecord};

#[test]
fn test_alarm_ids_stay_in_their_window() {
    let kinds = [
        AlarmKind::RegisterFailed,
        AlarmKind::RankTableStreamInterrupted,
        AlarmKind::FaultStreamInterrupted,
        AlarmKind::RankTableSaveFailed,
        AlarmKind::NodeFaultDetected,
        AlarmKind::MembershipChanged,
        AlarmKind::RoleSwitchFailed,
        AlarmKind::CoordinatorAbnormal,
    ];
    for kind in kinds {
        let id = kind.alarm_id();
        assert!((0xFC00_1000..=0xFC00_1007).contains(&id), "{id:#x}");
    }
    // Ids are distinct.
    let mut ids: Vec<u32> = kinds.iter().map(|k| k.alarm_id()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), kinds.len());
}

#[test]
fn test_raise_and_clear_flip_the_markers() {
    let raised = AlarmRecord::raise(AlarmKind::RegisterFailed, "model-a", "10.0.0.1:1026", "boom");
    assert_eq!(raised.cleared, 0);
    assert_eq!(raised.category, 1);
    assert_eq!(raised.origin_system, "MindIE");
    assert_eq!(raised.native_me_dn, "model-a");

    let cleared = AlarmRecord::clear(AlarmKind::RegisterFailed, "model-a", "10.0.0.1:1026", "ok");
    assert_eq!(cleared.cleared, 1);
    assert_eq!(cleared.category, 2);
    // Raise and clear of one category share a match key.
    assert_eq!(raised.match_key, cleared.match_key);
}

#[test]
fn test_record_serializes_camel_case() {
    let record = AlarmRecord::raise(AlarmKind::NodeFaultDetected, "m", "loc", "detail");
    let value = serde_json::to_value(&record).unwrap();
    assert!(value.get("alarmId").is_some());
    assert!(value.get("nativeMeDn").is_some());
    assert!(value.get("matchKey").is_some());
    assert!(value.get("alarm_id").is_none());
}
