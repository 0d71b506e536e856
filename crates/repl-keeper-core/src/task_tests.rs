//! Tests for the replication task model.

use super::*;

fn task() -> ReplicationTask {
    ReplicationTask {
        domain_id: "d-1".to_string(),
        workflow_id: "order-7731".to_string(),
        run_id: "run-a".to_string(),
        first_event_id: 10,
        next_event_id: 20,
        version: 3,
        task_type: TaskType::HistoryAppend,
        payload: Bytes::from_static(b"\x00\x01events"),
    }
}

#[test]
fn test_task_type_wire_names() {
    assert_eq!(
        serde_json::to_string(&TaskType::SyncActivity).unwrap(),
        "\"sync-activity\""
    );
    assert_eq!("sync-marker".parse::<TaskType>().unwrap(), TaskType::SyncMarker);
    assert!("replicate".parse::<TaskType>().is_err());
    assert_eq!(TaskType::HistoryAppend.to_string(), "history-append");
}

#[test]
fn test_payload_serialized_as_base64() {
    let json = serde_json::to_value(task()).unwrap();
    assert_eq!(json["payload"], "AAFldmVudHM=");
    assert_eq!(json["firstEventId"], 10);
    assert_eq!(json["taskType"], "history-append");
}

#[test]
fn test_invalid_base64_payload_rejected() {
    let mut json = serde_json::to_value(task()).unwrap();
    json["payload"] = serde_json::Value::String("@@not base64@@".to_string());

    let result: Result<ReplicationTask, _> = serde_json::from_value(json);
    assert!(result.is_err());
}

#[test]
fn test_header_matches_task_fields() {
    let header = task().header();
    assert_eq!(header.workflow_id, "order-7731");
    assert_eq!(header.next_event_id, 20);
    assert_eq!(header.to_columns(), "d-1,order-7731,run-a,10,20");
    assert_eq!(header.run_key(), task().run_key());
}

#[test]
fn test_validate_accepts_well_formed_task() {
    assert!(task().validate().is_ok());
}

#[test]
fn test_validate_rejects_empty_identifiers() {
    let mut t = task();
    t.run_id.clear();
    assert!(t.validate().unwrap_err().contains("runId"));

    let mut t = task();
    t.domain_id.clear();
    assert!(t.validate().is_err());
}

#[test]
fn test_validate_rejects_bad_event_range() {
    let mut t = task();
    t.first_event_id = -1;
    assert!(t.validate().is_err());

    let mut t = task();
    t.next_event_id = t.first_event_id;
    assert!(t.validate().unwrap_err().contains("not below"));
}
