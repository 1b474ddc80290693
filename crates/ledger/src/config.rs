// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ledger configuration with centralized environment overrides.

use std::path::PathBuf;
use std::time::Duration;
use tally_storage::LockOptions;

/// Tunables for a local ledger instance
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Directory holding the record, lock, backup, and log files
    pub base_path: PathBuf,
    /// Period of the per-operation heartbeat task
    pub heartbeat_interval: Duration,
    /// Upper bound of the uniform jitter added to each tick
    pub jitter: Duration,
    /// Heartbeat age past which a frame counts as crashed
    pub stale_threshold: Duration,
    /// Lock acquisition tunables
    pub lock: LockOptions,
    /// Rolling record backups retained per operation
    pub max_backups: u32,
}

impl LedgerConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            heartbeat_interval: Duration::from_millis(4_500),
            jitter: Duration::from_millis(500),
            stale_threshold: Duration::from_secs(15),
            lock: LockOptions::default(),
            max_backups: 3,
        }
    }

    /// Config rooted at the default state directory, with `TALLY_*`
    /// environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::new(state_dir());
        if let Some(ms) = env_ms("TALLY_HEARTBEAT_MS") {
            config.heartbeat_interval = ms;
        }
        if let Some(ms) = env_ms("TALLY_JITTER_MS") {
            config.jitter = ms;
        }
        if let Some(ms) = env_ms("TALLY_STALE_MS") {
            config.stale_threshold = ms;
        }
        if let Some(ms) = env_ms("TALLY_LOCK_TIMEOUT_MS") {
            config.lock.timeout = ms;
        }
        if let Some(n) = env_u32("TALLY_MAX_BACKUPS") {
            config.max_backups = n;
        }
        config
    }

    /// Grace period a terminal record stays on disk so lagging peers can
    /// observe it: two heartbeat cycles.
    pub fn removal_grace(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

/// Resolve state directory: TALLY_BASE_DIR > XDG_STATE_HOME/tally > ~/.local/state/tally
fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TALLY_BASE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("tally");
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".local/state/tally"),
        Err(_) => PathBuf::from(".tally"),
    }
}

fn env_ms(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|s| s.parse::<u32>().ok())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
