//! Temp resources registered by a crashed participant are deleted
//! best-effort during cleanup.

use crate::prelude::*;
use std::sync::Arc;
use tally_ledger::NoopCallback;
use tally_storage::RecordStore;
use tempfile::tempdir;

#[tokio::test]
async fn crashed_owner_resources_are_reclaimed() {
    let dir = tempdir().unwrap();
    let scratch_dir = tempdir().unwrap();
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

    // p2 declares a scratch file tied to the operation
    let scratch = scratch_dir.path().join("partial-download");
    std::fs::write(&scratch, b"half a payload").unwrap();
    op2.register_temp_resource(scratch.to_str().unwrap())
        .await
        .unwrap();

    let store = RecordStore::new(dir.path(), 3);
    let record = store.read(op1.operation_id()).unwrap().unwrap();
    assert_eq!(record.temp_resources.len(), 1);

    // p2 dies; cleanup reclaims the orphaned resource
    drop(op2);
    wait_until("scratch file deletion", || !scratch.exists()).await;

    // And the operation itself winds down to removal
    let op_id = op1.operation_id().clone();
    wait_until("record removal", || {
        matches!(store.read(&op_id), Ok(None))
    })
    .await;
}

#[tokio::test]
async fn unregistered_resources_are_left_alone() {
    let dir = tempdir().unwrap();
    let scratch_dir = tempdir().unwrap();
    let (ledger, _) = participant(dir.path(), "p1", 100);

    let op = ledger
        .create_operation(None, Arc::new(NoopCallback))
        .await
        .unwrap();

    let keep = scratch_dir.path().join("keep-me");
    std::fs::write(&keep, b"precious").unwrap();
    op.register_temp_resource(keep.to_str().unwrap())
        .await
        .unwrap();
    op.unregister_temp_resource(keep.to_str().unwrap())
        .await
        .unwrap();

    op.complete().await.unwrap();
    let store = RecordStore::new(dir.path(), 3);
    let op_id = op.operation_id().clone();
    wait_until("record removal", || {
        matches!(store.read(&op_id), Ok(None))
    })
    .await;

    assert!(keep.exists(), "an unregistered path must not be deleted");
}
