// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Callback seams consumed by external collaborators.
//!
//! Every method has a default no-op body, so implementors override only the
//! slots they care about. Callbacks are invoked on the caller's task runner,
//! after the record lock has been released.

use crate::error::{HeartbeatError, OperationFailedInfo};
use crate::heartbeat::HeartbeatResult;
use std::io::Write;
use std::path::{Path, PathBuf};
use tally_core::{CallId, OperationId};
use tracing::warn;

/// Ledger-wide observer
pub trait LedgerCallback: Send + Sync {
    /// A record backup was rotated into place
    fn on_backup_created(&self, _path: &Path) {}

    /// A structured log line was emitted by a participant
    fn on_log_line(&self, _operation_id: &OperationId, _line: &str) {}

    /// A heartbeat cycle failed, on any operation of this ledger
    fn on_global_heartbeat_error(&self, _operation_id: &OperationId, _error: &HeartbeatError) {}
}

/// Per-operation observer
pub trait OperationCallback: Send + Sync {
    fn on_heartbeat_success(&self, _result: &HeartbeatResult) {}

    fn on_heartbeat_error(&self, _error: &HeartbeatError) {}

    /// The abort flag was first observed set
    fn on_abort(&self) {}

    /// The operation reached `failed`
    fn on_failure(&self, _info: &OperationFailedInfo) {}
}

/// Per-call observer
pub trait CallCallback: Send + Sync {
    /// The operation entered cleanup while this call was still active;
    /// invoked before the frame steps aside
    fn on_cleanup(&self) {}

    /// A crashed child supervised by this call was reaped
    fn on_call_crashed(&self, _crashed: &CallId) {}

    /// The operation failed while this call was outstanding
    fn on_operation_failed(&self, _info: &OperationFailedInfo) {}
}

/// Callback that ignores everything
#[derive(Default)]
pub struct NoopCallback;

impl LedgerCallback for NoopCallback {}
impl OperationCallback for NoopCallback {}
impl CallCallback for NoopCallback {}

/// Default ledger callback: appends log lines to the operation's sidecar
/// `{operationId}.log` file.
pub struct SidecarLogCallback {
    base_path: PathBuf,
}

impl SidecarLogCallback {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

impl LedgerCallback for SidecarLogCallback {
    fn on_log_line(&self, operation_id: &OperationId, line: &str) {
        let path = self.base_path.join(format!("{operation_id}.log"));
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to append sidecar log line");
        }
    }

    fn on_global_heartbeat_error(&self, operation_id: &OperationId, error: &HeartbeatError) {
        warn!(operation_id = %operation_id, error = %error, "heartbeat cycle failed");
    }
}
