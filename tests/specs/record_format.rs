//! On-disk format: field names, round-trip fidelity, backup ordering.

use crate::prelude::*;
use similar_asserts::assert_eq;
use std::sync::Arc;
use tally_core::OperationRecord;
use tally_ledger::NoopCallback;
use tally_storage::RecordStore;
use tempfile::tempdir;

#[tokio::test]
async fn record_uses_documented_field_names() {
    let dir = tempdir().unwrap();
    let (ledger, _) = participant(dir.path(), "p1", 100);
    let op = ledger
        .create_operation(Some("format probe"), Arc::new(NoopCallback))
        .await
        .unwrap();
    op.register_temp_resource("/tmp/format-probe").await.unwrap();

    let raw = std::fs::read_to_string(
        dir.path().join(format!("{}.json", op.operation_id())),
    )
    .unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();

    for key in [
        "operationId",
        "initiatorId",
        "startTime",
        "aborted",
        "lastHeartbeat",
        "operationState",
        "detectionTimestamp",
        "removalTimestamp",
        "callFrames",
        "tempResources",
    ] {
        assert!(json.get(key).is_some(), "record is missing {key}");
    }
    let frame = &json["callFrames"][0];
    for key in [
        "participantId",
        "callId",
        "pid",
        "startTime",
        "lastHeartbeat",
        "state",
        "resources",
        "failOnCrash",
    ] {
        assert!(frame.get(key).is_some(), "frame is missing {key}");
    }
    assert_eq!(json["operationState"], "active");
    assert_eq!(json["callFrames"][0]["state"], "active");
    assert_eq!(json["tempResources"][0]["owner"], 100);
}

#[tokio::test]
async fn every_written_record_parses_back_identically() {
    let dir = tempdir().unwrap();
    let (ledger, _) = participant(dir.path(), "p1", 100);
    let op = ledger
        .create_operation(None, Arc::new(NoopCallback))
        .await
        .unwrap();
    let call = op.start_call(Some("step"), false).await.unwrap();

    let store = RecordStore::new(dir.path(), 3);
    let record = store.read(op.operation_id()).unwrap().unwrap();
    let reparsed: OperationRecord =
        serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
    assert_eq!(record, reparsed);

    call.end().await.unwrap();
}

#[tokio::test]
async fn backups_rotate_newest_first() {
    let dir = tempdir().unwrap();
    // Slow heartbeat so only the explicit mutations below rotate backups
    let mut slow = config(dir.path());
    slow.heartbeat_interval = std::time::Duration::from_secs(30);
    let ledger: TestLedger = tally_ledger::Ledger::connect_with(
        "p1",
        slow,
        Arc::new(NoopCallback),
        tally_core::SystemClock,
        tally_core::FakeProbe::new(),
        tally_core::SequentialIdGen::new("p1"),
        Some(100),
    )
    .unwrap();
    let op = ledger
        .create_operation(None, Arc::new(NoopCallback))
        .await
        .unwrap();

    // Each explicit mutation rotates the previous version into .bak.0
    op.register_temp_resource("/tmp/one").await.unwrap();
    op.register_temp_resource("/tmp/two").await.unwrap();

    let bak0_path = dir.path().join(format!("{}.json.bak.0", op.operation_id()));
    let bak0: OperationRecord =
        serde_json::from_str(&std::fs::read_to_string(&bak0_path).unwrap()).unwrap();
    let current = RecordStore::new(dir.path(), 3)
        .read(op.operation_id())
        .unwrap()
        .unwrap();

    // bak.0 is the immediately-previous version
    assert!(bak0.temp_resources.len() < current.temp_resources.len());
}
