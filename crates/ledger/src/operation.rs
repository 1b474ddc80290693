// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-process operation handle.
//!
//! An `Operation` is one participant's view of a shared operation record:
//! it owns the heartbeat task, the registry of local calls, and the
//! synchronization primitives (`sync`, `await_call`, `wait_for_completion`)
//! layered over the record. Every mutation goes through the
//! lock → read → mutate → write → unlock cycle, so explicit API calls and
//! heartbeat ticks linearize on the record file.

use crate::call::{
    settle, CallError, CallStatus, CancelFlag, SpawnedCall, SyncHandle, SyncResult, WorkContext,
    FRAME_REMOVAL_BACKOFF, FRAME_REMOVAL_RETRIES,
};
use crate::callback::{CallCallback, LedgerCallback, OperationCallback};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, OperationFailedInfo};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tally_core::{
    CallFrame, CallId, Clock, IdGen, OperationId, OperationRecord, OperationState, ParticipantId,
    ProcessProbe,
};
use tally_storage::{LockGuard, RecordStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

/// A call registered with this participant's operation handle
pub(crate) struct RegisteredCall {
    pub callback: Arc<dyn CallCallback>,
    pub cancel: CancelFlag,
    pub cleanup_hooks: Vec<Box<dyn FnOnce() + Send>>,
    pub status_tx: watch::Sender<CallStatus>,
}

/// Shared state behind one `Operation` handle
pub(crate) struct OperationCore<C: Clock, P: ProcessProbe, G: IdGen> {
    pub store: RecordStore,
    pub config: LedgerConfig,
    pub clock: C,
    pub probe: P,
    pub idgen: G,
    pub operation_id: OperationId,
    pub participant_id: ParticipantId,
    pub root_call: CallId,
    pub pid: u32,
    pub session_id: u64,
    pub is_initiator: bool,
    pub start_time: DateTime<Utc>,
    /// Lock-owner identity of this handle
    pub instance_id: String,
    pub ledger_callback: Arc<dyn LedgerCallback>,
    pub operation_callback: Arc<dyn OperationCallback>,
    calls: Mutex<HashMap<CallId, RegisteredCall>>,
    /// Crashed call ids observed over the operation's lifetime
    crashed_calls: Mutex<Vec<CallId>>,
    /// Locally-known failure reason (set by `fail`/`trigger_abort`)
    pub failure_reason: Mutex<Option<String>>,
    abort_tx: watch::Sender<bool>,
    cleanup_tx: watch::Sender<bool>,
    failure_tx: watch::Sender<Option<OperationFailedInfo>>,
    stop_tx: watch::Sender<bool>,
    detached: Mutex<bool>,
}

impl<C: Clock, P: ProcessProbe, G: IdGen> OperationCore<C, P, G> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: RecordStore,
        config: LedgerConfig,
        clock: C,
        probe: P,
        idgen: G,
        operation_id: OperationId,
        participant_id: ParticipantId,
        root_call: CallId,
        pid: u32,
        session_id: u64,
        is_initiator: bool,
        start_time: DateTime<Utc>,
        ledger_callback: Arc<dyn LedgerCallback>,
        operation_callback: Arc<dyn OperationCallback>,
    ) -> Self {
        let instance_id = idgen.next();
        let core = Self {
            store,
            config,
            clock,
            probe,
            idgen,
            operation_id,
            participant_id,
            root_call: root_call.clone(),
            pid,
            session_id,
            is_initiator,
            start_time,
            instance_id,
            ledger_callback,
            operation_callback,
            calls: Mutex::new(HashMap::new()),
            crashed_calls: Mutex::new(Vec::new()),
            failure_reason: Mutex::new(None),
            abort_tx: watch::channel(false).0,
            cleanup_tx: watch::channel(false).0,
            failure_tx: watch::channel(None).0,
            stop_tx: watch::channel(false).0,
            detached: Mutex::new(false),
        };
        // The root frame participates in supervision like any other call
        core.register_call(root_call, Arc::new(crate::callback::NoopCallback));
        core
    }

    // ── record access ───────────────────────────────────────────────────

    pub(crate) async fn lock(&self) -> Result<LockGuard, LedgerError> {
        Ok(LockGuard::acquire(
            &self.store.lock_path(&self.operation_id),
            &self.operation_id,
            &self.instance_id,
            self.pid,
            &self.config.lock,
            &self.probe,
            &self.clock,
        )
        .await?)
    }

    /// Lock → read → mutate → write → unlock.
    pub(crate) async fn with_record<T>(
        &self,
        f: impl FnOnce(&mut OperationRecord, DateTime<Utc>) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let guard = self.lock().await?;
        let result = (|| {
            let mut record = self
                .store
                .read(&self.operation_id)?
                .ok_or_else(|| LedgerError::NoSuchOperation(self.operation_id.clone()))?;
            let now = self.clock.now_utc();
            let out = f(&mut record, now)?;
            if let Some(backup) = self.store.write(&record)? {
                self.ledger_callback.on_backup_created(&backup);
            }
            Ok(out)
        })();
        match result {
            Ok(out) => {
                guard.release().map_err(LedgerError::from)?;
                Ok(out)
            }
            Err(e) => {
                if let Err(release_err) = guard.release() {
                    warn!(error = %release_err, "failed to release operation lock");
                }
                Err(e)
            }
        }
    }

    /// Remove a frame when its call settles, retrying on lock contention.
    /// A missing record means a peer finished the operation first.
    pub(crate) async fn finish_spawned(
        &self,
        call_id: &CallId,
        status: CallStatus,
        fail_operation: bool,
        reason: Option<String>,
    ) {
        if let Some(reason) = reason {
            let mut slot = self.failure_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }

        for attempt in 1..=FRAME_REMOVAL_RETRIES {
            let result = self
                .with_record(|record, now| {
                    record.remove_frame(call_id);
                    if fail_operation {
                        record.begin_cleanup(now);
                    }
                    Ok(())
                })
                .await;
            match result {
                Ok(()) | Err(LedgerError::NoSuchOperation(_)) => break,
                Err(e) if attempt < FRAME_REMOVAL_RETRIES => {
                    warn!(call_id = %call_id, error = %e, "retrying frame removal");
                    tokio::time::sleep(FRAME_REMOVAL_BACKOFF).await;
                }
                Err(e) => {
                    warn!(call_id = %call_id, error = %e, "giving up on frame removal");
                }
            }
        }

        self.settle_call(call_id, status);
        if fail_operation {
            self.observe_cleanup();
        }
        self.deregister_call(call_id);
    }

    // ── local call registry ─────────────────────────────────────────────

    pub(crate) fn register_call(
        &self,
        call_id: CallId,
        callback: Arc<dyn CallCallback>,
    ) -> (CancelFlag, watch::Receiver<CallStatus>) {
        let (status_tx, status_rx) = watch::channel(CallStatus::Running);
        let cancel = CancelFlag::new();
        self.calls.lock().insert(
            call_id,
            RegisteredCall {
                callback,
                cancel: cancel.clone(),
                cleanup_hooks: Vec::new(),
                status_tx,
            },
        );
        (cancel, status_rx)
    }

    pub(crate) fn deregister_call(&self, call_id: &CallId) {
        self.calls.lock().remove(call_id);
    }

    pub(crate) fn call_callback(&self, call_id: &CallId) -> Option<Arc<dyn CallCallback>> {
        self.calls.lock().get(call_id).map(|c| Arc::clone(&c.callback))
    }

    pub(crate) fn set_call_callback(&self, call_id: &CallId, callback: Arc<dyn CallCallback>) {
        if let Some(entry) = self.calls.lock().get_mut(call_id) {
            entry.callback = callback;
        }
    }

    pub(crate) fn add_cleanup_hook(&self, call_id: &CallId, hook: Box<dyn FnOnce() + Send>) {
        if let Some(entry) = self.calls.lock().get_mut(call_id) {
            entry.cleanup_hooks.push(hook);
        }
    }

    /// Cancel a call that must step aside, then run its cleanup callbacks.
    pub(crate) fn run_local_cleanup(&self, call_id: &CallId) {
        let (callback, cancel, hooks) = {
            let mut calls = self.calls.lock();
            match calls.get_mut(call_id) {
                Some(entry) => (
                    Arc::clone(&entry.callback),
                    entry.cancel.clone(),
                    std::mem::take(&mut entry.cleanup_hooks),
                ),
                None => return,
            }
        };
        cancel.cancel();
        callback.on_cleanup();
        for hook in hooks {
            hook();
        }
    }

    pub(crate) fn settle_call(&self, call_id: &CallId, status: CallStatus) {
        if let Some(entry) = self.calls.lock().get(call_id) {
            settle(&entry.status_tx, status);
        }
    }

    pub(crate) fn cancel_all_calls(&self) {
        for entry in self.calls.lock().values() {
            entry.cancel.cancel();
        }
    }

    pub(crate) fn pending_call_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(id, entry)| **id != self.root_call && !entry.status_tx.borrow().is_terminal())
            .count()
    }

    // ── observed state ──────────────────────────────────────────────────

    pub(crate) fn note_crashed(&self, ids: impl IntoIterator<Item = CallId>) {
        let mut crashed = self.crashed_calls.lock();
        for id in ids {
            if !crashed.contains(&id) {
                crashed.push(id);
            }
        }
    }

    pub(crate) fn observe_abort(&self) {
        let fired = self.abort_tx.send_if_modified(|seen| {
            if *seen {
                false
            } else {
                *seen = true;
                true
            }
        });
        if fired {
            self.operation_callback.on_abort();
        }
    }

    pub(crate) fn observe_cleanup(&self) {
        self.cleanup_tx.send_if_modified(|seen| {
            if *seen {
                false
            } else {
                *seen = true;
                true
            }
        });
    }

    pub(crate) fn cleanup_seen(&self) -> bool {
        *self.cleanup_tx.borrow()
    }

    /// Resolve failure waiters exactly once and abandon outstanding calls.
    pub(crate) fn observe_failure(&self) {
        let info = self.failure_info();
        let fired = self.failure_tx.send_if_modified(|slot| {
            if slot.is_some() {
                false
            } else {
                *slot = Some(info.clone());
                true
            }
        });
        if !fired {
            return;
        }
        self.observe_cleanup();
        self.operation_callback.on_failure(&info);

        let abandoned: Vec<(CallId, Arc<dyn CallCallback>, CancelFlag)> = self
            .calls
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.status_tx.borrow().is_terminal())
            .map(|(id, entry)| {
                (
                    id.clone(),
                    Arc::clone(&entry.callback),
                    entry.cancel.clone(),
                )
            })
            .collect();
        for (call_id, callback, cancel) in abandoned {
            cancel.cancel();
            self.settle_call(&call_id, CallStatus::Unknown);
            if call_id != self.root_call {
                callback.on_operation_failed(&info);
            }
        }
    }

    pub(crate) fn failure_info(&self) -> OperationFailedInfo {
        OperationFailedInfo {
            operation_id: self.operation_id.clone(),
            failed_at: self.clock.now_utc(),
            reason: self.failure_reason.lock().clone(),
            crashed_call_ids: self.crashed_calls.lock().clone(),
        }
    }

    /// The failure info waiters have seen, or a synthesized one for an
    /// operation caught mid-cleanup.
    pub(crate) fn current_failure_info(&self) -> OperationFailedInfo {
        self.failure_tx
            .borrow()
            .clone()
            .unwrap_or_else(|| self.failure_info())
    }

    // ── heartbeat control ───────────────────────────────────────────────

    pub(crate) fn stop_heartbeat(&self) {
        // send_replace: must take effect even with no live receiver
        self.stop_tx.send_replace(true);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub(crate) async fn stopped(&self) {
        let mut rx = self.stop_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    fn detach(&self) {
        *self.detached.lock() = true;
    }

    fn ensure_attached(&self) -> Result<(), LedgerError> {
        if *self.detached.lock() {
            Err(LedgerError::Detached(self.operation_id.clone()))
        } else {
            Ok(())
        }
    }

    /// Map the record's state to an API error for calls that need `active`.
    fn ensure_active(&self, record: &OperationRecord) -> Result<(), LedgerError> {
        match record.operation_state {
            OperationState::Active => Ok(()),
            OperationState::Cleanup | OperationState::Failed => {
                Err(LedgerError::OperationFailed(self.current_failure_info()))
            }
            OperationState::Complete => {
                Err(LedgerError::TerminalOperation(self.operation_id.clone()))
            }
        }
    }
}

/// A local, in-process call opened with [`Operation::start_call`].
pub struct Call<C: Clock, P: ProcessProbe, G: IdGen> {
    core: Arc<OperationCore<C, P, G>>,
    call_id: CallId,
    status_rx: watch::Receiver<CallStatus>,
}

impl<C: Clock, P: ProcessProbe, G: IdGen> std::fmt::Debug for Call<C, P, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call").field("call_id", &self.call_id).finish()
    }
}

impl<C: Clock, P: ProcessProbe, G: IdGen> Call<C, P, G> {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Register a hook invoked when the operation enters cleanup while this
    /// call is still active.
    pub fn on_cleanup(&self, hook: impl FnOnce() + Send + 'static) {
        self.core.add_cleanup_hook(&self.call_id, Box::new(hook));
    }

    /// Finish the call successfully; removes the frame.
    pub async fn end(self) -> Result<(), LedgerError> {
        let result = self
            .core
            .with_record(|record, _| {
                record.remove_frame(&self.call_id);
                Ok(())
            })
            .await;
        self.core.settle_call(&self.call_id, CallStatus::Succeeded);
        self.core.deregister_call(&self.call_id);
        result
    }

    /// Fail the call; the whole operation goes into cleanup.
    pub async fn fail(self, reason: impl Into<String>) -> Result<(), LedgerError> {
        let reason = reason.into();
        {
            let mut slot = self.core.failure_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.clone());
            }
        }
        let result = self
            .core
            .with_record(|record, now| {
                record.remove_frame(&self.call_id);
                record.begin_cleanup(now);
                Ok(())
            })
            .await;
        self.core
            .settle_call(&self.call_id, CallStatus::Failed(reason));
        self.core.deregister_call(&self.call_id);
        self.core.observe_cleanup();
        result
    }
}

impl<C: Clock, P: ProcessProbe, G: IdGen> SyncHandle for Call<C, P, G> {
    fn call_id(&self) -> &CallId {
        &self.call_id
    }

    fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.status_rx.clone()
    }
}

/// One participant's handle on an operation. Owns the heartbeat task.
pub struct Operation<C: Clock, P: ProcessProbe, G: IdGen> {
    core: Arc<OperationCore<C, P, G>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Clock, P: ProcessProbe, G: IdGen> std::fmt::Debug for Operation<C, P, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("operation_id", &self.core.operation_id)
            .finish_non_exhaustive()
    }
}

impl<C: Clock, P: ProcessProbe, G: IdGen> Operation<C, P, G> {
    /// Start the heartbeat task and hand out the facade.
    pub(crate) fn launch(core: Arc<OperationCore<C, P, G>>) -> Self {
        let task = tokio::spawn(crate::heartbeat::run_loop(Arc::clone(&core)));
        Self {
            core,
            heartbeat: Mutex::new(Some(task)),
        }
    }

    pub fn operation_id(&self) -> &OperationId {
        &self.core.operation_id
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.core.participant_id
    }

    /// Monotonic per local ledger
    pub fn session_id(&self) -> u64 {
        self.core.session_id
    }

    pub fn is_initiator(&self) -> bool {
        self.core.is_initiator
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.core.start_time
    }

    /// Outstanding local calls (the root frame does not count)
    pub fn pending_call_count(&self) -> usize {
        self.core.pending_call_count()
    }

    /// Crash notifications for children supervised by this participant's
    /// root frame are delivered to `callback`.
    pub fn register_root_callback(&self, callback: Arc<dyn CallCallback>) {
        self.core.set_call_callback(&self.core.root_call, callback);
    }

    // ── calls ───────────────────────────────────────────────────────────

    /// Open a local call. The frame is removed by `end`/`fail`.
    pub async fn start_call(
        &self,
        description: Option<&str>,
        fail_on_crash: bool,
    ) -> Result<Call<C, P, G>, LedgerError> {
        self.core.ensure_attached()?;
        let call_id = CallId::new(self.core.idgen.next());
        let description = description.map(str::to_string);
        self.core
            .with_record(|record, now| {
                self.core.ensure_active(record)?;
                record.push_frame(CallFrame::new(
                    self.core.participant_id.clone(),
                    call_id.clone(),
                    self.core.pid,
                    now,
                    description,
                    fail_on_crash,
                ));
                Ok(())
            })
            .await?;
        let (_, status_rx) = self
            .core
            .register_call(call_id.clone(), Arc::new(crate::callback::NoopCallback));
        Ok(Call {
            core: Arc::clone(&self.core),
            call_id,
            status_rx,
        })
    }

    /// Dispatch `work` under a new frame. The returned handle observes the
    /// work; the spawned task removes the frame when the work settles.
    pub async fn spawn_call<T, F, Fut>(
        &self,
        description: Option<&str>,
        callback: Arc<dyn CallCallback>,
        fail_on_crash: bool,
        work: F,
    ) -> Result<SpawnedCall<T>, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(WorkContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        self.core.ensure_attached()?;
        let call_id = CallId::new(self.core.idgen.next());
        let description = description.map(str::to_string);
        self.core
            .with_record(|record, now| {
                self.core.ensure_active(record)?;
                record.push_frame(CallFrame::new(
                    self.core.participant_id.clone(),
                    call_id.clone(),
                    self.core.pid,
                    now,
                    description,
                    fail_on_crash,
                ));
                Ok(())
            })
            .await?;

        let (cancel, status_rx) = self.core.register_call(call_id.clone(), callback);
        let result_slot = Arc::new(Mutex::new(None));
        let child_pid = Arc::new(Mutex::new(None));
        let ctx = WorkContext::new(cancel.clone(), Arc::clone(&child_pid));

        let core = Arc::clone(&self.core);
        let task_call = call_id.clone();
        let slot = Arc::clone(&result_slot);
        tokio::spawn(async move {
            let out = work(ctx).await;
            let (status, fail_operation, reason) = match &out {
                Ok(_) => (CallStatus::Succeeded, false, None),
                // A cancellation caused by operation cleanup leaves the
                // outcome unknown; a user-requested one is a plain failure
                Err(CallError::Canceled) if core.cleanup_seen() => {
                    (CallStatus::Unknown, false, None)
                }
                Err(CallError::Canceled) => {
                    (CallStatus::Failed("call canceled".to_string()), false, None)
                }
                Err(CallError::Failed(message)) => (
                    CallStatus::Failed(message.clone()),
                    fail_on_crash,
                    Some(message.clone()),
                ),
            };
            *slot.lock() = Some(out);
            core.finish_spawned(&task_call, status, fail_operation, reason)
                .await;
        });

        Ok(SpawnedCall::new(
            call_id, status_rx, result_slot, cancel, child_pid,
        ))
    }

    // ── synchronization primitives ──────────────────────────────────────

    /// Wait until every call settles or the operation enters cleanup.
    pub async fn sync(&self, calls: &[&dyn SyncHandle]) -> SyncResult {
        let (tx, mut rx) = mpsc::channel::<(CallId, CallStatus)>(calls.len().max(1));
        for call in calls {
            let mut status_rx = call.subscribe();
            let call_id = call.call_id().clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let status = match status_rx.wait_for(|s| s.is_terminal()).await {
                    Ok(status) => status.clone(),
                    Err(_) => CallStatus::Unknown,
                };
                let _ = tx.send((call_id, status)).await;
            });
        }
        drop(tx);

        let mut cleanup_rx = self.core.subscribe_cleanup();
        let mut settled: HashMap<CallId, CallStatus> = HashMap::new();
        let mut operation_failed = self.core.cleanup_seen();

        while settled.len() < calls.len() && !operation_failed {
            tokio::select! {
                received = rx.recv() => match received {
                    Some((call_id, status)) => {
                        settled.insert(call_id, status);
                    }
                    None => break,
                },
                _ = cleanup_rx.wait_for(|seen| *seen) => {
                    operation_failed = true;
                }
            }
        }
        // Calls that settled concurrently with the failure still count
        while let Ok((call_id, status)) = rx.try_recv() {
            settled.insert(call_id, status);
        }

        let mut result = SyncResult {
            operation_failed,
            ..SyncResult::default()
        };
        for call in calls {
            let call_id = call.call_id().clone();
            match settled.get(&call_id) {
                Some(CallStatus::Succeeded) => result.successful_calls.push(call_id),
                Some(CallStatus::Failed(_)) => result.failed_calls.push(call_id),
                Some(CallStatus::Unknown) | Some(CallStatus::Running) | None => {
                    result.unknown_calls.push(call_id)
                }
            }
        }
        result
    }

    /// Single-call form of [`sync`](Self::sync).
    pub async fn await_call(&self, call: &dyn SyncHandle) -> Result<CallStatus, LedgerError> {
        let call_id = call.call_id().clone();
        let status_rx = call.subscribe();
        let result = self.sync(&[call]).await;
        if result.operation_failed && !result.successful_calls.contains(&call_id) {
            return Err(LedgerError::OperationFailed(
                self.core.current_failure_info(),
            ));
        }
        let status = status_rx.borrow().clone();
        Ok(status)
    }

    /// Run `work` racing operation failure. If the operation fails first,
    /// the result of `work` is abandoned.
    pub async fn wait_for_completion<T>(
        &self,
        work: impl Future<Output = T> + Send,
    ) -> Result<T, LedgerError> {
        let mut cleanup_rx = self.core.subscribe_cleanup();
        tokio::select! {
            out = work => Ok(out),
            _ = cleanup_rx.wait_for(|seen| *seen) => {
                Err(LedgerError::OperationFailed(self.core.current_failure_info()))
            }
        }
    }

    // ── abort and failure observation ───────────────────────────────────

    /// Set the abort flag on the record. The flag is monotone: setting
    /// `false` is a no-op. Returns whether the record changed.
    pub async fn set_abort_flag(&self, value: bool) -> Result<bool, LedgerError> {
        if !value {
            return Ok(false);
        }
        let changed = self
            .core
            .with_record(|record, _| Ok(record.set_aborted()))
            .await?;
        self.core.observe_abort();
        Ok(changed)
    }

    /// The last observed abort state.
    pub fn check_abort(&self) -> bool {
        self.core.abort_seen()
    }

    /// Abort the operation, recording a local failure reason.
    pub async fn trigger_abort(&self, reason: impl Into<String>) -> Result<(), LedgerError> {
        {
            let mut slot = self.core.failure_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.set_abort_flag(true).await.map(drop)
    }

    /// Resolves when the abort flag is first observed.
    pub async fn on_abort(&self) {
        let mut rx = self.core.subscribe_abort();
        let _ = rx.wait_for(|seen| *seen).await;
    }

    /// Resolves when the operation is observed `failed`.
    pub async fn on_failure(&self) -> OperationFailedInfo {
        let mut rx = self.core.subscribe_failure();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(info) => info.clone().unwrap_or_else(|| self.core.failure_info()),
            Err(_) => self.core.current_failure_info(),
        };
        result
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    /// Initiator-only: finish the operation. Fails with `StillBusy` while
    /// any frame besides the initiator's root remains on the stack.
    pub async fn complete(&self) -> Result<(), LedgerError> {
        self.core.ensure_attached()?;
        if !self.core.is_initiator {
            return Err(LedgerError::NotInitiator(self.core.operation_id.clone()));
        }
        self.core
            .with_record(|record, now| {
                self.core.ensure_active(record)?;
                let live_frames = record
                    .call_frames
                    .iter()
                    .filter(|f| f.call_id != self.core.root_call)
                    .count();
                if live_frames > 0 {
                    return Err(LedgerError::StillBusy {
                        operation_id: self.core.operation_id.clone(),
                        live_frames,
                    });
                }
                record.remove_frame(&self.core.root_call);
                record.mark_complete(now);
                Ok(())
            })
            .await?;
        // The heartbeat keeps running: its next cycle deletes the record
        self.core.detach();
        Ok(())
    }

    /// Voluntarily detach from the operation: optionally cancel outstanding
    /// local calls, remove every frame of this participant, stop the
    /// heartbeat.
    pub async fn leave(&self, cancel_pending_calls: bool) -> Result<(), LedgerError> {
        self.core.ensure_attached()?;
        if cancel_pending_calls {
            self.core.cancel_all_calls();
        }
        let result = self
            .core
            .with_record(|record, _| {
                let mine: Vec<CallId> = record
                    .call_frames
                    .iter()
                    .filter(|f| f.pid == self.core.pid)
                    .map(|f| f.call_id.clone())
                    .collect();
                for call_id in mine {
                    record.remove_frame(&call_id);
                }
                Ok(())
            })
            .await;
        match result {
            Ok(()) | Err(LedgerError::NoSuchOperation(_)) => {}
            Err(e) => return Err(e),
        }
        self.core.detach();
        self.core.stop_heartbeat();
        Ok(())
    }

    // ── temp resources and logging ──────────────────────────────────────

    /// Attach a path to one of this participant's frames. The path is
    /// deleted when the frame is removed during cleanup.
    pub async fn register_call_resource(
        &self,
        call_id: &CallId,
        path: &str,
    ) -> Result<(), LedgerError> {
        self.core
            .with_record(|record, _| {
                let frame = record
                    .frame_mut(call_id)
                    .filter(|f| f.pid == self.core.pid)
                    .ok_or_else(|| LedgerError::NoSuchCall(call_id.clone()))?;
                if !frame.resources.iter().any(|r| r == path) {
                    frame.resources.push(path.to_string());
                }
                Ok(())
            })
            .await
    }

    /// Declare a filesystem path whose deletion must follow cleanup.
    pub async fn register_temp_resource(&self, path: &str) -> Result<(), LedgerError> {
        self.core
            .with_record(|record, now| {
                record.register_resource(path, self.core.pid, now);
                Ok(())
            })
            .await
    }

    pub async fn unregister_temp_resource(&self, path: &str) -> Result<(), LedgerError> {
        self.core
            .with_record(|record, _| {
                record.unregister_resource(path);
                Ok(())
            })
            .await
    }

    /// Append a structured line to the operation's sidecar log.
    pub fn log(&self, level: tracing::Level, message: &str) {
        let line = serde_json::json!({
            "ts": self.core.clock.now_utc().to_rfc3339(),
            "level": level.to_string(),
            "participant": self.core.participant_id.as_str(),
            "message": message,
        })
        .to_string();
        self.core
            .ledger_callback
            .on_log_line(&self.core.operation_id, &line);
    }
}

impl<C: Clock, P: ProcessProbe, G: IdGen> Drop for Operation<C, P, G> {
    fn drop(&mut self) {
        self.core.stop_heartbeat();
        if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
        }
    }
}

// Subscription accessors used by the facade and heartbeat dispatch
impl<C: Clock, P: ProcessProbe, G: IdGen> OperationCore<C, P, G> {
    pub(crate) fn subscribe_abort(&self) -> watch::Receiver<bool> {
        self.abort_tx.subscribe()
    }

    pub(crate) fn abort_seen(&self) -> bool {
        *self.abort_tx.borrow()
    }

    pub(crate) fn subscribe_cleanup(&self) -> watch::Receiver<bool> {
        self.cleanup_tx.subscribe()
    }

    pub(crate) fn subscribe_failure(&self) -> watch::Receiver<Option<OperationFailedInfo>> {
        self.failure_tx.subscribe()
    }
}

#[cfg(test)]
#[path = "operation_tests.rs"]
mod tests;
