//! Supervisor notification: when a supervised participant crashes, the
//! supervising participant's callback fires exactly once.

use crate::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use tally_core::CallId;
use tally_ledger::{CallCallback, NoopCallback};
use tally_storage::RecordStore;
use tempfile::tempdir;

#[derive(Default)]
struct CrashCapture {
    crashed: Mutex<Vec<CallId>>,
}

impl CallCallback for CrashCapture {
    fn on_call_crashed(&self, crashed: &CallId) {
        self.crashed.lock().push(crashed.clone());
    }
}

#[tokio::test]
async fn supervisor_is_notified_exactly_once() {
    let dir = tempdir().unwrap();
    let (ledger1, _) = participant(dir.path(), "p1", 100);
    let (ledger2, _) = participant(dir.path(), "p2", 200);
    let (ledger3, _) = participant(dir.path(), "p3", 300);

    let op1 = ledger1
        .create_operation(None, Arc::new(NoopCallback))
        .await
        .unwrap();
    let op2 = ledger2
        .join_operation(op1.operation_id(), Arc::new(NoopCallback))
        .await
        .unwrap();
    let op3 = ledger3
        .join_operation(op1.operation_id(), Arc::new(NoopCallback))
        .await
        .unwrap();

    // Stack is root(p1) / f2(p2) / f3(p3): p2 supervises p3
    let capture = Arc::new(CrashCapture::default());
    op2.register_root_callback(capture.clone());

    let store = RecordStore::new(dir.path(), 3);
    let record = store.read(op1.operation_id()).unwrap().unwrap();
    let f3 = record
        .call_frames
        .iter()
        .find(|f| f.pid == 300)
        .unwrap()
        .call_id
        .clone();
    let supervisor = record.supervisor_of(&f3).unwrap();
    assert_eq!(supervisor.pid, 200);

    // Kill p3 without leaving
    drop(op3);

    wait_until("supervisor notification", || {
        !capture.crashed.lock().is_empty()
    })
    .await;

    // The crashed frame is gone and the notification fired exactly once
    let crashed = capture.crashed.lock().clone();
    assert_eq!(crashed, vec![f3.clone()]);
    match store.read(op1.operation_id()) {
        Ok(Some(record)) => assert!(record.frame(&f3).is_none()),
        // The operation may already have failed and been removed
        Ok(None) => {}
        Err(e) => panic!("unreadable record: {e}"),
    }

    // f3 had fail_on_crash set, so the whole operation fails
    let info = tokio::time::timeout(std::time::Duration::from_secs(5), op1.on_failure())
        .await
        .expect("initiator never observed failure");
    assert!(info.crashed_call_ids.contains(&f3));

    // No duplicate notification after further cycles
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(capture.crashed.lock().len(), 1);
    let _ = op2;
}
