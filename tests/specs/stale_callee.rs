//! A joined participant dies; the survivor detects the stale frame, drives
//! cleanup, and the operation fails with the crashed call recorded.

use crate::prelude::*;
use std::sync::Arc;
use tally_ledger::NoopCallback;
use tally_storage::RecordStore;
use tempfile::tempdir;

#[tokio::test]
async fn dead_peer_fails_the_operation() {
    let dir = tempdir().unwrap();
    let (ledger1, _) = participant(dir.path(), "p1", 100);
    let (ledger2, _) = participant(dir.path(), "p2", 200);

    let op1 = ledger1
        .create_operation(None, Arc::new(NoopCallback))
        .await
        .unwrap();
    let op2 = ledger2
        .join_operation(op1.operation_id(), Arc::new(NoopCallback))
        .await
        .unwrap();

    // Snapshot p2's frame id, then kill p2 without leaving
    let store = RecordStore::new(dir.path(), 3);
    let record = store.read(op1.operation_id()).unwrap().unwrap();
    let f2 = record
        .call_frames
        .iter()
        .find(|f| f.pid == 200)
        .unwrap()
        .call_id
        .clone();
    drop(op2);

    // The survivor's heartbeat classifies the stale frame, enters cleanup,
    // reaps the crashed frame, drains its own, and the operation fails
    let info = tokio::time::timeout(std::time::Duration::from_secs(5), op1.on_failure())
        .await
        .expect("survivor never observed the failure");
    assert_eq!(info.operation_id, *op1.operation_id());
    assert_eq!(info.crashed_call_ids, vec![f2]);

    // The failed record lingers for the grace period, then disappears
    let op_id = op1.operation_id().clone();
    wait_until("record removal", || {
        matches!(store.read(&op_id), Ok(None))
    })
    .await;
}

#[tokio::test]
async fn leaving_peacefully_does_not_fail_the_operation() {
    let dir = tempdir().unwrap();
    let (ledger1, _) = participant(dir.path(), "p1", 100);
    let (ledger2, _) = participant(dir.path(), "p2", 200);

    let op1 = ledger1
        .create_operation(None, Arc::new(NoopCallback))
        .await
        .unwrap();
    let op2 = ledger2
        .join_operation(op1.operation_id(), Arc::new(NoopCallback))
        .await
        .unwrap();
    op2.leave(false).await.unwrap();

    // Well past the stale threshold nothing has crashed
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    let store = RecordStore::new(dir.path(), 3);
    let record = store.read(op1.operation_id()).unwrap().unwrap();
    assert_eq!(record.operation_state, tally_core::OperationState::Active);
    assert!(!record.aborted);

    op1.complete().await.unwrap();
}
