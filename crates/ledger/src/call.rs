// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Call handles: local calls and spawned (dispatched) calls.
//!
//! Every handle is paired 1:1 with a call frame on the operation record.
//! The handle's terminal method removes the frame; a forgotten handle is
//! eventually reaped by the heartbeat engine's staleness detection once its
//! owning process stops renewing heartbeats.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tally_core::CallId;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::warn;

/// Failure of a call's work
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    #[error("call failed: {0}")]
    Failed(String),
    #[error("call canceled")]
    Canceled,
}

/// Observable status of a call
#[derive(Debug, Clone, PartialEq)]
pub enum CallStatus {
    Running,
    Succeeded,
    Failed(String),
    /// Abandoned because the operation failed before the call settled
    Unknown,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallStatus::Running)
    }
}

/// Cooperative cancellation flag shared with a call's work closure
#[derive(Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is set
    pub async fn canceled(&self) {
        loop {
            if self.is_canceled() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

/// Context handed to a spawned call's work closure
#[derive(Clone)]
pub struct WorkContext {
    pub cancel: CancelFlag,
    child_pid: Arc<Mutex<Option<u32>>>,
}

impl WorkContext {
    pub(crate) fn new(cancel: CancelFlag, child_pid: Arc<Mutex<Option<u32>>>) -> Self {
        Self { cancel, child_pid }
    }

    /// Subprocess-backed work reports its child pid so `kill(signal)` can
    /// reach it.
    pub fn report_child_pid(&self, pid: u32) {
        *self.child_pid.lock() = Some(pid);
    }

    pub(crate) fn clear_child_pid(&self) {
        *self.child_pid.lock() = None;
    }
}

/// Anything `sync`/`await_call` can wait on
pub trait SyncHandle {
    fn call_id(&self) -> &CallId;
    fn subscribe(&self) -> watch::Receiver<CallStatus>;
}

/// Handle for work dispatched by `spawn_call`.
///
/// The frame is removed by the spawned task when the work settles; the
/// handle only observes.
pub struct SpawnedCall<T> {
    call_id: CallId,
    status_rx: watch::Receiver<CallStatus>,
    result: Arc<Mutex<Option<Result<T, CallError>>>>,
    cancel: CancelFlag,
    child_pid: Arc<Mutex<Option<u32>>>,
}

impl<T> SpawnedCall<T> {
    pub(crate) fn new(
        call_id: CallId,
        status_rx: watch::Receiver<CallStatus>,
        result: Arc<Mutex<Option<Result<T, CallError>>>>,
        cancel: CancelFlag,
        child_pid: Arc<Mutex<Option<u32>>>,
    ) -> Self {
        Self {
            call_id,
            status_rx,
            result,
            cancel,
            child_pid,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn status(&self) -> CallStatus {
        self.status_rx.borrow().clone()
    }

    /// Request cooperative cancellation. The work closure is expected to
    /// poll [`WorkContext::cancel`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The call's error, if it settled unsuccessfully.
    pub fn error(&self) -> Option<CallError> {
        match &*self.status_rx.borrow() {
            CallStatus::Failed(message) => Some(CallError::Failed(message.clone())),
            CallStatus::Unknown => Some(CallError::Canceled),
            _ => None,
        }
    }

    /// Take the result if the call already settled. Each result can be
    /// taken once.
    pub fn take_result(&self) -> Option<Result<T, CallError>> {
        self.result.lock().take()
    }

    /// Wait until the call settles, then take the result.
    pub async fn await_result(&self) -> Result<T, CallError> {
        let status = self.join().await;
        match self.take_result() {
            Some(result) => result,
            None => match status {
                CallStatus::Unknown => Err(CallError::Canceled),
                CallStatus::Failed(message) => Err(CallError::Failed(message)),
                _ => Err(CallError::Failed("result already taken".to_string())),
            },
        }
    }

    /// Wait until the call settles.
    pub async fn join(&self) -> CallStatus {
        let mut rx = self.status_rx.clone();
        let result = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => status.clone(),
            // Sender dropped without a terminal status: the owning task died
            Err(_) => CallStatus::Unknown,
        };
        result
    }

    /// Send `signal` to the call's subprocess and wait for the work to
    /// settle. Only meaningful for subprocess-backed work that reported its
    /// child pid.
    pub async fn kill(&self, signal: nix::sys::signal::Signal) -> CallStatus {
        self.cancel.cancel();
        let pid = *self.child_pid.lock();
        if let Some(pid) = pid {
            if let Err(e) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal)
            {
                warn!(pid, signal = %signal, error = %e, "failed to signal worker process");
            }
        }
        self.join().await
    }
}

impl<T> SyncHandle for SpawnedCall<T> {
    fn call_id(&self) -> &CallId {
        &self.call_id
    }

    fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.status_rx.clone()
    }
}

/// Set a terminal status exactly once; later writers lose.
pub(crate) fn settle(status_tx: &watch::Sender<CallStatus>, status: CallStatus) -> bool {
    status_tx.send_if_modified(|current| {
        if current.is_terminal() {
            false
        } else {
            *current = status;
            true
        }
    })
}

/// Outcome buckets of [`sync`](crate::Operation::sync)
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncResult {
    pub successful_calls: Vec<CallId>,
    pub failed_calls: Vec<CallId>,
    /// Calls abandoned because the operation failed first
    pub unknown_calls: Vec<CallId>,
    pub operation_failed: bool,
}

/// How long terminal frame removal keeps retrying on lock contention
pub(crate) const FRAME_REMOVAL_RETRIES: u32 = 3;
pub(crate) const FRAME_REMOVAL_BACKOFF: Duration = Duration::from_millis(50);

#[cfg(test)]
#[path = "call_tests.rs"]
mod tests;
