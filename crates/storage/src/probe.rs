// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Real process liveness probe (signal 0).

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tally_core::ProcessProbe;

/// Probes pid liveness with `kill(pid, 0)`.
///
/// EPERM means the process exists but belongs to another user, which still
/// counts as alive for lock-reclamation purposes.
#[derive(Clone, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
#[path = "probe_tests.rs"]
mod tests;
