// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::call::CallError;
use crate::callback::NoopCallback;
use crate::config::LedgerConfig;
use crate::ledger::Ledger;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tally_core::{FakeProbe, SequentialIdGen, SystemClock};
use tempfile::tempdir;

type TestLedger = Ledger<SystemClock, FakeProbe, SequentialIdGen>;
type TestOperation = Operation<SystemClock, FakeProbe, SequentialIdGen>;

fn test_config(dir: &std::path::Path) -> LedgerConfig {
    let mut config = LedgerConfig::new(dir);
    config.heartbeat_interval = Duration::from_millis(40);
    config.jitter = Duration::from_millis(5);
    config.stale_threshold = Duration::from_millis(300);
    config.lock.timeout = Duration::from_millis(800);
    config
}

fn connect(dir: &std::path::Path, name: &str, pid: u32) -> TestLedger {
    Ledger::connect_with(
        name,
        test_config(dir),
        Arc::new(NoopCallback),
        SystemClock,
        FakeProbe::new(),
        SequentialIdGen::new(name),
        Some(pid),
    )
    .unwrap()
}

async fn create(ledger: &TestLedger) -> TestOperation {
    ledger
        .create_operation(Some("test operation"), Arc::new(NoopCallback))
        .await
        .unwrap()
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Default)]
struct CountingCallback {
    aborts: AtomicUsize,
    failures: Mutex<Vec<OperationFailedInfo>>,
}

impl OperationCallback for CountingCallback {
    fn on_abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure(&self, info: &OperationFailedInfo) {
        self.failures.lock().push(info.clone());
    }
}

#[tokio::test]
async fn test_create_start_end_complete_removes_record() {
    let dir = tempdir().unwrap();
    let ledger = connect(dir.path(), "p1", 100);
    let op = create(&ledger).await;
    assert!(op.is_initiator());
    assert_eq!(op.pending_call_count(), 0);

    let call = op.start_call(Some("step one"), true).await.unwrap();
    assert_eq!(op.pending_call_count(), 1);
    call.end().await.unwrap();
    assert_eq!(op.pending_call_count(), 0);

    op.complete().await.unwrap();

    // Until the heartbeat deletes it, the record must read as complete
    let store = tally_storage::RecordStore::new(dir.path(), 3);
    let op_id = op.operation_id().clone();
    wait_until("record removal", || {
        match store.read(&op_id) {
            Ok(None) => true,
            Ok(Some(record)) => {
                assert_eq!(record.operation_state, tally_core::OperationState::Complete);
                false
            }
            Err(_) => false,
        }
    })
    .await;
}

#[tokio::test]
async fn test_complete_with_outstanding_call_is_still_busy() {
    let dir = tempdir().unwrap();
    let ledger = connect(dir.path(), "p1", 100);
    let op = create(&ledger).await;

    let call = op.start_call(Some("busy"), true).await.unwrap();
    let err = op.complete().await.unwrap_err();
    assert!(matches!(err, LedgerError::StillBusy { live_frames: 1, .. }));

    call.end().await.unwrap();
    op.complete().await.unwrap();
}

#[tokio::test]
async fn test_complete_requires_initiator() {
    let dir = tempdir().unwrap();
    let ledger1 = connect(dir.path(), "p1", 100);
    let ledger2 = connect(dir.path(), "p2", 200);

    let op1 = create(&ledger1).await;
    let op2 = ledger2
        .join_operation(op1.operation_id(), Arc::new(NoopCallback))
        .await
        .unwrap();
    assert!(!op2.is_initiator());

    let err = op2.complete().await.unwrap_err();
    assert!(matches!(err, LedgerError::NotInitiator(_)));
    op2.leave(false).await.unwrap();
}

#[tokio::test]
async fn test_leave_removes_frames_and_detaches() {
    let dir = tempdir().unwrap();
    let ledger1 = connect(dir.path(), "p1", 100);
    let ledger2 = connect(dir.path(), "p2", 200);

    let op1 = create(&ledger1).await;
    let op2 = ledger2
        .join_operation(op1.operation_id(), Arc::new(NoopCallback))
        .await
        .unwrap();

    op2.leave(false).await.unwrap();

    let store = tally_storage::RecordStore::new(dir.path(), 3);
    let record = store.read(op1.operation_id()).unwrap().unwrap();
    assert!(record.call_frames.iter().all(|f| f.pid != 200));

    let err = op2.start_call(None, true).await.unwrap_err();
    assert!(matches!(err, LedgerError::Detached(_)));

    // With p2 gone the initiator can finish
    op1.complete().await.unwrap();
}

#[tokio::test]
async fn test_spawn_call_success_returns_result_and_removes_frame() {
    let dir = tempdir().unwrap();
    let ledger = connect(dir.path(), "p1", 100);
    let op = create(&ledger).await;

    let call = op
        .spawn_call(Some("compute"), Arc::new(NoopCallback), true, |_ctx| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(42u32)
        })
        .await
        .unwrap();

    assert_eq!(call.await_result().await.unwrap(), 42);
    assert_eq!(call.status(), CallStatus::Succeeded);

    let store = tally_storage::RecordStore::new(dir.path(), 3);
    let op_id = op.operation_id().clone();
    let call_id = call.call_id().clone();
    wait_until("frame removal", || {
        store
            .read(&op_id)
            .ok()
            .flatten()
            .map(|r| r.frame(&call_id).is_none())
            .unwrap_or(true)
    })
    .await;
}

#[tokio::test]
async fn test_spawn_call_failure_fails_the_operation() {
    let dir = tempdir().unwrap();
    let ledger = connect(dir.path(), "p1", 100);
    let callback = Arc::new(CountingCallback::default());
    let op = ledger
        .create_operation(None, callback.clone())
        .await
        .unwrap();

    let call = op
        .spawn_call(Some("doomed"), Arc::new(NoopCallback), true, |_ctx| async {
            Err::<u32, _>(CallError::Failed("disk on fire".to_string()))
        })
        .await
        .unwrap();

    assert!(matches!(
        call.await_result().await,
        Err(CallError::Failed(message)) if message.contains("disk on fire")
    ));

    let info = tokio::time::timeout(Duration::from_secs(3), op.on_failure())
        .await
        .unwrap();
    assert_eq!(info.reason.as_deref(), Some("disk on fire"));
    wait_until("failure callback", || !callback.failures.lock().is_empty()).await;
}

#[tokio::test]
async fn test_spawn_call_cancellation_is_cooperative() {
    let dir = tempdir().unwrap();
    let ledger = connect(dir.path(), "p1", 100);
    let op = create(&ledger).await;

    let call = op
        .spawn_call(Some("patient"), Arc::new(NoopCallback), true, |ctx| async move {
            ctx.cancel.canceled().await;
            Err::<u32, _>(CallError::Canceled)
        })
        .await
        .unwrap();

    call.cancel();
    assert_eq!(call.await_result().await.unwrap_err(), CallError::Canceled);
    // A canceled call does not fail the operation
    let c2 = op.start_call(None, true).await.unwrap();
    c2.end().await.unwrap();
}

#[tokio::test]
async fn test_abort_propagates_to_peers_and_sync() {
    let dir = tempdir().unwrap();
    let ledger1 = connect(dir.path(), "p1", 100);
    let ledger2 = connect(dir.path(), "p2", 200);

    let cb1 = Arc::new(CountingCallback::default());
    let cb2 = Arc::new(CountingCallback::default());
    let op1 = ledger1.create_operation(None, cb1.clone()).await.unwrap();
    let op2 = ledger2
        .join_operation(op1.operation_id(), cb2.clone())
        .await
        .unwrap();

    let pending = op1
        .spawn_call(Some("outstanding"), Arc::new(NoopCallback), true, |ctx| async move {
            ctx.cancel.canceled().await;
            Err::<u32, _>(CallError::Canceled)
        })
        .await
        .unwrap();

    op1.set_abort_flag(true).await.unwrap();
    assert!(op1.check_abort());

    // Both participants observe the abort within a heartbeat
    tokio::time::timeout(Duration::from_secs(2), op2.on_abort())
        .await
        .unwrap();
    wait_until("abort callbacks", || {
        cb1.aborts.load(Ordering::SeqCst) == 1 && cb2.aborts.load(Ordering::SeqCst) == 1
    })
    .await;

    // Outstanding work resolves through sync as an operation failure
    let result = tokio::time::timeout(Duration::from_secs(3), op1.sync(&[&pending]))
        .await
        .unwrap();
    assert!(result.operation_failed);
    assert_eq!(result.unknown_calls, vec![pending.call_id().clone()]);
}

#[tokio::test]
async fn test_await_call_surfaces_operation_failure() {
    let dir = tempdir().unwrap();
    let ledger = connect(dir.path(), "p1", 100);
    let op = create(&ledger).await;

    let pending = op
        .spawn_call(None, Arc::new(NoopCallback), true, |ctx| async move {
            ctx.cancel.canceled().await;
            Err::<u32, _>(CallError::Canceled)
        })
        .await
        .unwrap();

    op.trigger_abort("operator requested abort").await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(3), op.await_call(&pending))
        .await
        .unwrap()
        .unwrap_err();
    let LedgerError::OperationFailed(info) = err else {
        panic!("expected operation failure");
    };
    assert_eq!(info.reason.as_deref(), Some("operator requested abort"));
}

#[tokio::test]
async fn test_wait_for_completion_races_failure() {
    let dir = tempdir().unwrap();
    let ledger = connect(dir.path(), "p1", 100);
    let op = create(&ledger).await;

    // Work finishing first wins
    let out = op
        .wait_for_completion(async { 5u32 })
        .await
        .unwrap();
    assert_eq!(out, 5);

    // Operation failure first abandons the work
    op.trigger_abort("stop everything").await.unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        op.wait_for_completion(std::future::pending::<u32>()),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(LedgerError::OperationFailed(_))));
}

#[tokio::test]
async fn test_sync_buckets_mixed_outcomes() {
    let dir = tempdir().unwrap();
    let ledger = connect(dir.path(), "p1", 100);
    let op = create(&ledger).await;

    let good = op
        .spawn_call(None, Arc::new(NoopCallback), false, |_ctx| async { Ok(1u32) })
        .await
        .unwrap();
    let bad = op
        .spawn_call(None, Arc::new(NoopCallback), false, |_ctx| async {
            Err::<u32, _>(CallError::Failed("nope".to_string()))
        })
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(3), op.sync(&[&good, &bad]))
        .await
        .unwrap();
    assert!(!result.operation_failed);
    assert_eq!(result.successful_calls, vec![good.call_id().clone()]);
    assert_eq!(result.failed_calls, vec![bad.call_id().clone()]);
    assert!(result.unknown_calls.is_empty());
}

#[tokio::test]
async fn test_temp_resource_registration_round_trip() {
    let dir = tempdir().unwrap();
    let ledger = connect(dir.path(), "p1", 100);
    let op = create(&ledger).await;

    op.register_temp_resource("/tmp/tally-test-scratch").await.unwrap();
    let store = tally_storage::RecordStore::new(dir.path(), 3);
    let record = store.read(op.operation_id()).unwrap().unwrap();
    assert_eq!(record.temp_resources.len(), 1);
    assert_eq!(record.temp_resources[0].owner, 100);

    op.unregister_temp_resource("/tmp/tally-test-scratch").await.unwrap();
    let record = store.read(op.operation_id()).unwrap().unwrap();
    assert!(record.temp_resources.is_empty());
}

#[tokio::test]
async fn test_call_resources_attach_to_the_frame() {
    let dir = tempdir().unwrap();
    let ledger = connect(dir.path(), "p1", 100);
    let op = create(&ledger).await;

    let call = op.start_call(Some("downloader"), true).await.unwrap();
    op.register_call_resource(call.call_id(), "/tmp/partial-blob")
        .await
        .unwrap();
    // Idempotent by path
    op.register_call_resource(call.call_id(), "/tmp/partial-blob")
        .await
        .unwrap();

    let store = tally_storage::RecordStore::new(dir.path(), 3);
    let record = store.read(op.operation_id()).unwrap().unwrap();
    let frame = record.frame(call.call_id()).unwrap();
    assert_eq!(frame.resources, vec!["/tmp/partial-blob".to_string()]);

    // A foreign or unknown call id is rejected
    let err = op
        .register_call_resource(&tally_core::CallId::new("ghost"), "/tmp/x")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NoSuchCall(_)));

    call.end().await.unwrap();
}

#[tokio::test]
async fn test_log_goes_through_ledger_callback() {
    struct CaptureLog(Mutex<Vec<String>>);
    impl LedgerCallback for CaptureLog {
        fn on_log_line(&self, _operation_id: &OperationId, line: &str) {
            self.0.lock().push(line.to_string());
        }
    }

    let dir = tempdir().unwrap();
    let capture = Arc::new(CaptureLog(Mutex::new(Vec::new())));
    let ledger: TestLedger = Ledger::connect_with(
        "p1",
        test_config(dir.path()),
        capture.clone(),
        SystemClock,
        FakeProbe::new(),
        SequentialIdGen::new("p1"),
        Some(100),
    )
    .unwrap();
    let op = create(&ledger).await;

    op.log(tracing::Level::INFO, "starting build step");

    let lines = capture.0.lock();
    assert_eq!(lines.len(), 1);
    let parsed: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(parsed["participant"], "p1");
    assert_eq!(parsed["level"], "INFO");
    assert_eq!(parsed["message"], "starting build step");
}

#[tokio::test]
async fn test_session_ids_are_monotonic_per_ledger() {
    let dir = tempdir().unwrap();
    let ledger = connect(dir.path(), "p1", 100);
    let op1 = create(&ledger).await;
    let op2 = create(&ledger).await;
    assert!(op2.session_id() > op1.session_id());
}
