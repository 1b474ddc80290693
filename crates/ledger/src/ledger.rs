// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ledger factory: opens or attaches to operations on a base directory.

use crate::callback::{LedgerCallback, OperationCallback, SidecarLogCallback};
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::operation::{Operation, OperationCore};
use crate::shutdown::{self, DisposeHook};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tally_core::{
    CallFrame, CallId, Clock, IdGen, OperationId, OperationRecord, ParticipantId, ProcessProbe,
    SystemClock, UuidIdGen,
};
use tally_storage::{LockGuard, RecordStore, SystemProbe};
use tracing::info;

/// A local file-backed ledger bound to one participant identity.
///
/// Cheap to clone; all clones share the same session counter and dispose
/// state.
pub struct Ledger<C: Clock = SystemClock, P: ProcessProbe = SystemProbe, G: IdGen = UuidIdGen> {
    inner: Arc<LedgerInner<C, P, G>>,
}

impl<C: Clock, P: ProcessProbe, G: IdGen> Clone for Ledger<C, P, G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Clock, P: ProcessProbe, G: IdGen> std::fmt::Debug for Ledger<C, P, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

struct LedgerInner<C: Clock, P: ProcessProbe, G: IdGen> {
    config: LedgerConfig,
    store: RecordStore,
    participant_id: ParticipantId,
    pid: u32,
    clock: C,
    probe: P,
    idgen: G,
    callback: Arc<dyn LedgerCallback>,
    session_counter: AtomicU64,
    operations: Mutex<Vec<Weak<OperationCore<C, P, G>>>>,
    disposed: AtomicBool,
}

impl<C: Clock, P: ProcessProbe, G: IdGen> DisposeHook for LedgerInner<C, P, G> {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let operations = std::mem::take(&mut *self.operations.lock());
        for weak in operations {
            if let Some(core) = weak.upgrade() {
                core.stop_heartbeat();
            }
        }
        info!(participant_id = %self.participant_id, "ledger disposed");
    }
}

impl Ledger {
    /// Connect with the production clock, probe, and id generator. The
    /// default callback appends log lines to each operation's sidecar file.
    pub fn connect(
        participant_id: impl Into<ParticipantId>,
        config: LedgerConfig,
    ) -> Result<Self, LedgerError> {
        let callback = Arc::new(SidecarLogCallback::new(&config.base_path));
        Ledger::connect_with(
            participant_id,
            config,
            callback,
            SystemClock,
            SystemProbe,
            UuidIdGen,
            None,
        )
    }
}

impl<C: Clock, P: ProcessProbe, G: IdGen> Ledger<C, P, G> {
    /// Connect with explicit dependencies. `pid` defaults to this process.
    pub fn connect_with(
        participant_id: impl Into<ParticipantId>,
        config: LedgerConfig,
        callback: Arc<dyn LedgerCallback>,
        clock: C,
        probe: P,
        idgen: G,
        pid: Option<u32>,
    ) -> Result<Ledger<C, P, G>, LedgerError> {
        validate_base_path(&config)?;
        let store = RecordStore::new(&config.base_path, config.max_backups);
        let inner = Arc::new(LedgerInner {
            config,
            store,
            participant_id: participant_id.into(),
            pid: pid.unwrap_or_else(std::process::id),
            clock,
            probe,
            idgen,
            callback,
            session_counter: AtomicU64::new(1),
            operations: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });
        shutdown::register(Arc::downgrade(&inner) as Weak<dyn DisposeHook>);
        Ok(Ledger { inner })
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.inner.participant_id
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Create a fresh operation and become its initiator.
    pub async fn create_operation(
        &self,
        description: Option<&str>,
        callback: Arc<dyn OperationCallback>,
    ) -> Result<Operation<C, P, G>, LedgerError> {
        self.ensure_open()?;
        let inner = &self.inner;
        let operation_id = OperationId::new(inner.idgen.next());
        let root_call = CallId::new(inner.idgen.next());
        let now = inner.clock.now_utc();
        let record = OperationRecord::new(
            operation_id.clone(),
            inner.participant_id.clone(),
            root_call.clone(),
            inner.pid,
            description.map(str::to_string),
            now,
        );
        inner.store.write(&record)?;
        info!(
            operation_id = %operation_id,
            participant_id = %inner.participant_id,
            "created operation"
        );
        Ok(self.launch(operation_id, root_call, true, now, callback))
    }

    /// Join an existing operation by id, pushing a root frame for this
    /// participant.
    pub async fn join_operation(
        &self,
        operation_id: &OperationId,
        callback: Arc<dyn OperationCallback>,
    ) -> Result<Operation<C, P, G>, LedgerError> {
        self.ensure_open()?;
        let inner = &self.inner;
        let root_call = CallId::new(inner.idgen.next());
        let now = inner.clock.now_utc();

        let guard = LockGuard::acquire(
            &inner.store.lock_path(operation_id),
            operation_id,
            &inner.idgen.next(),
            inner.pid,
            &inner.config.lock,
            &inner.probe,
            &inner.clock,
        )
        .await?;
        let result = (|| {
            let mut record = inner
                .store
                .recover(operation_id)?
                .ok_or_else(|| LedgerError::NoSuchOperation(operation_id.clone()))?;
            if record.is_terminal() {
                return Err(LedgerError::TerminalOperation(operation_id.clone()));
            }
            record.push_frame(CallFrame::new(
                inner.participant_id.clone(),
                root_call.clone(),
                inner.pid,
                now,
                None,
                true,
            ));
            inner.store.write(&record)?;
            Ok(record.initiator_id == inner.participant_id)
        })();
        let release = guard.release();
        let is_initiator = result?;
        release.map_err(LedgerError::from)?;

        info!(
            operation_id = %operation_id,
            participant_id = %inner.participant_id,
            "joined operation"
        );
        Ok(self.launch(operation_id.clone(), root_call, is_initiator, now, callback))
    }

    fn launch(
        &self,
        operation_id: OperationId,
        root_call: CallId,
        is_initiator: bool,
        start_time: chrono::DateTime<chrono::Utc>,
        callback: Arc<dyn OperationCallback>,
    ) -> Operation<C, P, G> {
        let inner = &self.inner;
        let session_id = inner.session_counter.fetch_add(1, Ordering::SeqCst);
        let core = Arc::new(OperationCore::new(
            inner.store.clone(),
            inner.config.clone(),
            inner.clock.clone(),
            inner.probe.clone(),
            inner.idgen.clone(),
            operation_id,
            inner.participant_id.clone(),
            root_call,
            inner.pid,
            session_id,
            is_initiator,
            start_time,
            Arc::clone(&inner.callback),
            callback,
        ));
        inner.operations.lock().push(Arc::downgrade(&core));
        Operation::launch(core)
    }

    /// Stop every operation's heartbeat task. Required before process exit;
    /// the process-wide cleanup handler calls this on fatal signals.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    fn ensure_open(&self) -> Result<(), LedgerError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            Err(LedgerError::Disposed)
        } else {
            Ok(())
        }
    }
}

/// The base path must exist and be writable at connect time.
fn validate_base_path(config: &LedgerConfig) -> Result<(), LedgerError> {
    std::fs::create_dir_all(&config.base_path)
        .map_err(|_| LedgerError::BasePathUnwritable(config.base_path.clone()))?;
    let probe_path = config
        .base_path
        .join(format!(".tally-probe-{}", std::process::id()));
    std::fs::write(&probe_path, b"probe")
        .map_err(|_| LedgerError::BasePathUnwritable(config.base_path.clone()))?;
    let _ = std::fs::remove_file(&probe_path);
    Ok(())
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
