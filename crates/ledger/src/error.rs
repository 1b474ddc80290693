// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types surfaced by the ledger APIs.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tally_core::{CallId, OperationId};
use tally_storage::{LockError, StoreError};
use thiserror::Error;

/// Why and when an operation failed, with the calls that crashed on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationFailedInfo {
    pub operation_id: OperationId,
    pub failed_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub crashed_call_ids: Vec<CallId>,
}

/// Errors returned from explicit ledger and operation APIs
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("could not acquire operation lock within {timeout:?}")]
    LockTimeout { timeout: Duration },

    #[error("corrupt operation record: {message}")]
    Corrupt { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no such operation: {0}")]
    NoSuchOperation(OperationId),

    #[error("no frame for call {0} owned by this participant")]
    NoSuchCall(CallId),

    #[error("operation {0} already reached a terminal state")]
    TerminalOperation(OperationId),

    #[error("only the initiator may complete operation {0}")]
    NotInitiator(OperationId),

    #[error("operation {operation_id} still has {live_frames} outstanding frame(s)")]
    StillBusy {
        operation_id: OperationId,
        live_frames: usize,
    },

    #[error("base path {0} is not writable")]
    BasePathUnwritable(PathBuf),

    #[error("operation {} failed", .0.operation_id)]
    OperationFailed(OperationFailedInfo),

    #[error("participant has left operation {0}")]
    Detached(OperationId),

    #[error("ledger already disposed")]
    Disposed,
}

impl From<LockError> for LedgerError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout { timeout, .. } => LedgerError::LockTimeout { timeout },
            LockError::Io(e) => LedgerError::Io(e),
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(e) => LedgerError::Io(e),
            StoreError::Corrupt { message, .. } => LedgerError::Corrupt { message },
        }
    }
}

/// Classification of a failed heartbeat cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatErrorKind {
    LockTimeout,
    IoError,
    Corrupt,
    Canceled,
}

/// A failed heartbeat cycle. Delivered via callbacks only; the ticker
/// retries on the next tick.
#[derive(Debug, Error)]
#[error("heartbeat {kind:?}: {message}")]
pub struct HeartbeatError {
    pub kind: HeartbeatErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HeartbeatError {
    pub fn new(kind: HeartbeatErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: HeartbeatErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<LockError> for HeartbeatError {
    fn from(e: LockError) -> Self {
        let kind = match &e {
            LockError::Timeout { .. } => HeartbeatErrorKind::LockTimeout,
            LockError::Io(_) => HeartbeatErrorKind::IoError,
        };
        Self::with_source(kind, e.to_string(), e)
    }
}

impl From<StoreError> for HeartbeatError {
    fn from(e: StoreError) -> Self {
        let kind = match &e {
            StoreError::Io(_) => HeartbeatErrorKind::IoError,
            StoreError::Corrupt { .. } => HeartbeatErrorKind::Corrupt,
        };
        Self::with_source(kind, e.to_string(), e)
    }
}
