//! Any participant may abort; peers observe within a heartbeat and their
//! outstanding work resolves as an operation failure.

use crate::prelude::*;
use std::sync::Arc;
use tally_ledger::{CallError, NoopCallback};
use tempfile::tempdir;

#[tokio::test]
async fn abort_reaches_every_participant() {
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

    // p2 has outstanding dispatched work that only stops when canceled
    let pending = op2
        .spawn_call(
            Some("long-running job"),
            Arc::new(NoopCallback),
            true,
            |ctx| async move {
                ctx.cancel.canceled().await;
                Err::<(), _>(CallError::Canceled)
            },
        )
        .await
        .unwrap();

    op1.set_abort_flag(true).await.unwrap();

    // Both sides observe the abort within a heartbeat interval
    tokio::time::timeout(std::time::Duration::from_secs(2), op1.on_abort())
        .await
        .expect("initiator missed its own abort");
    tokio::time::timeout(std::time::Duration::from_secs(2), op2.on_abort())
        .await
        .expect("peer missed the abort");
    assert!(op2.check_abort());

    // The peer's sync resolves with the operation marked failed and the
    // abandoned call reported as unknown
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        op2.sync(&[&pending]),
    )
    .await
    .unwrap();
    assert!(result.operation_failed);
    assert_eq!(result.unknown_calls, vec![pending.call_id().clone()]);
    assert!(result.successful_calls.is_empty());
}

#[tokio::test]
async fn abort_flag_is_monotone_on_disk() {
    let dir = tempdir().unwrap();
    let (ledger, _) = participant(dir.path(), "p1", 100);
    let op = ledger
        .create_operation(None, Arc::new(NoopCallback))
        .await
        .unwrap();

    assert!(op.set_abort_flag(true).await.unwrap());
    // Setting again changes nothing; clearing is a no-op
    assert!(!op.set_abort_flag(true).await.unwrap());
    assert!(!op.set_abort_flag(false).await.unwrap());
    assert!(op.check_abort());
}
