// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process liveness probing.
//!
//! Stale-lock reclamation and crash classification need to ask "is this pid
//! still running?". The trait keeps that question mockable; the real
//! signal-0 probe lives in tally-storage so core stays platform-neutral.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Answers whether an OS process is alive
pub trait ProcessProbe: Clone + Send + Sync + 'static {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Fake probe for testing: every pid is alive until marked dead
#[derive(Clone, Default)]
pub struct FakeProbe {
    dead: Arc<Mutex<HashSet<u32>>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a pid as dead for subsequent `is_alive` checks
    pub fn mark_dead(&self, pid: u32) {
        self.dead.lock().insert(pid);
    }

    /// Resurrect a pid (pid reuse in the wild looks like this)
    pub fn mark_alive(&self, pid: u32) {
        self.dead.lock().remove(&pid);
    }
}

impl ProcessProbe for FakeProbe {
    fn is_alive(&self, pid: u32) -> bool {
        !self.dead.lock().contains(&pid)
    }
}

#[cfg(test)]
#[path = "probe_tests.rs"]
mod tests;
