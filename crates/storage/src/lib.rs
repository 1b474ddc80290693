// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tally-storage: on-disk persistence for the process ledger.
//!
//! Two concerns live here: the advisory lock file that serializes every
//! record mutation across processes, and the record store that reads and
//! atomically replaces the operation JSON with rolling backups.

mod lock;
mod probe;
mod store;

pub use lock::{LockError, LockGuard, LockOptions, LockOwner};
pub use probe::SystemProbe;
pub use store::{RecordStore, StoreError};
