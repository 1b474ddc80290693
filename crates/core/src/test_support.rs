// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test helpers for use across crates.
//!
//! Gated behind `#[cfg(any(test, feature = "test-support"))]`.

use crate::{CallFrame, CallId, OperationId, OperationRecord, ParticipantId};
use chrono::{DateTime, TimeZone, Utc};

/// A fixed reference instant for deterministic tests.
#[allow(clippy::unwrap_used)]
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

/// A record with one root frame owned by `initiator` at pid 100.
pub fn record(op: &str, initiator: &str) -> OperationRecord {
    OperationRecord::new(
        OperationId::new(op),
        ParticipantId::new(initiator),
        CallId::new(format!("{op}-root")),
        100,
        None,
        fixed_now(),
    )
}

/// An active frame builder with sensible defaults.
pub fn frame(call: &str, participant: &str, pid: u32) -> CallFrame {
    CallFrame::new(
        ParticipantId::new(participant),
        CallId::new(call),
        pid,
        fixed_now(),
        None,
        true,
    )
}

/// Same as [`frame`] but with `fail_on_crash = false`.
pub fn soft_frame(call: &str, participant: &str, pid: u32) -> CallFrame {
    CallFrame::new(
        ParticipantId::new(participant),
        CallId::new(call),
        pid,
        fixed_now(),
        None,
        false,
    )
}
