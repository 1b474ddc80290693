// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tally-ledger: the per-process face of the tally process ledger.
//!
//! A participant connects a [`Ledger`] to a base directory, then creates or
//! joins an operation. The returned [`Operation`] handle runs a heartbeat
//! task that renews this participant's frames, detects stale peers, applies
//! the cleanup rules, and drives the operation state machine - all through
//! the shared record file, with no coordinator.

mod call;
mod callback;
mod cleanup;
mod config;
mod cycle;
mod error;
mod heartbeat;
mod ledger;
mod operation;
pub mod poll;
mod shutdown;
mod worker;

pub use call::{
    CallError, CallStatus, CancelFlag, SpawnedCall, SyncHandle, SyncResult, WorkContext,
};
pub use callback::{
    CallCallback, LedgerCallback, NoopCallback, OperationCallback, SidecarLogCallback,
};
pub use config::LedgerConfig;
pub use error::{HeartbeatError, HeartbeatErrorKind, LedgerError, OperationFailedInfo};
pub use heartbeat::{CycleReport, HeartbeatResult};
pub use ledger::Ledger;
pub use operation::{Call, Operation};
pub use shutdown::{dispose_all, install_signal_handler};
pub use worker::StdioWorkerOutput;

/// Production operation handle type
pub type LocalOperation =
    Operation<tally_core::SystemClock, tally_storage::SystemProbe, tally_core::UuidIdGen>;
/// Production ledger type
pub type LocalLedger =
    Ledger<tally_core::SystemClock, tally_storage::SystemProbe, tally_core::UuidIdGen>;
