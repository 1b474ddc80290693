//! A single participant runs one call to completion; the record is removed
//! shortly after `complete`.

use crate::prelude::*;
use std::sync::Arc;
use tally_core::OperationState;
use tally_ledger::NoopCallback;
use tally_storage::RecordStore;
use tempfile::tempdir;

#[tokio::test]
async fn initiator_completes_and_record_disappears() {
    let dir = tempdir().unwrap();
    let (ledger, _probe) = participant(dir.path(), "initiator", 100);

    let op = ledger
        .create_operation(Some("release build"), Arc::new(NoopCallback))
        .await
        .unwrap();
    assert!(op.is_initiator());

    let call = op.start_call(Some("compile"), true).await.unwrap();
    call.end().await.unwrap();
    op.complete().await.unwrap();

    // Between complete() and removal the record must read as terminal;
    // afterwards the file and its backups are gone
    let store = RecordStore::new(dir.path(), 3);
    let op_id = op.operation_id().clone();
    let mut observed_complete = false;
    wait_until("record removal", || match store.read(&op_id) {
        Ok(None) => true,
        Ok(Some(record)) => {
            assert_eq!(record.operation_state, OperationState::Complete);
            observed_complete = true;
            false
        }
        Err(_) => false,
    })
    .await;
    assert!(observed_complete, "terminal state was never observable");
    assert!(!dir.path().join(format!("{op_id}.json.bak.0")).exists());
}

#[tokio::test]
async fn record_survives_while_work_is_outstanding() {
    let dir = tempdir().unwrap();
    let (ledger, _probe) = participant(dir.path(), "initiator", 100);
    let op = ledger
        .create_operation(None, Arc::new(NoopCallback))
        .await
        .unwrap();

    let call = op.start_call(Some("long haul"), true).await.unwrap();

    // Several heartbeat intervals later the operation is still active and
    // both frames carry fresh heartbeats
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let store = RecordStore::new(dir.path(), 3);
    let record = store.read(op.operation_id()).unwrap().unwrap();
    assert_eq!(record.operation_state, OperationState::Active);
    assert_eq!(record.call_frames.len(), 2);
    for frame in &record.call_frames {
        assert!(
            frame.heartbeat_age(chrono::Utc::now()) < std::time::Duration::from_millis(400),
            "frame {} went stale while its owner was alive",
            frame.call_id
        );
    }

    call.end().await.unwrap();
    op.complete().await.unwrap();
}
