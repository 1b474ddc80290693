// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Advisory lock protocol around the operation record.
//!
//! A sibling `{operationId}.lock` file carries the owner's identity. There
//! is no flock: peers on a shared filesystem may not share a kernel, so the
//! protocol is create-exclusive plus owner metadata. A lock whose owner pid
//! is dead, or whose `acquired_at` is older than the acquisition timeout, is
//! reclaimed by the next acquirer. Reclamation is a log event, not an error.
//!
//! After writing its owner entry the acquirer re-reads the file and compares
//! identity, which catches the delete/re-create races that reclamation
//! opens up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tally_core::{Clock, OperationId, ProcessProbe};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from lock acquisition and release
#[derive(Debug, Error)]
pub enum LockError {
    #[error("could not acquire {path} within {timeout:?}")]
    Timeout { path: PathBuf, timeout: Duration },
    #[error("IO error on lock file: {0}")]
    Io(#[from] io::Error),
}

/// Tunables for the acquisition loop
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Give up (and treat a surviving owner entry as stale) past this age
    pub timeout: Duration,
    /// Initial sleep between attempts; doubles up to `max_retry_interval`
    pub retry_interval: Duration,
    pub max_retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            retry_interval: Duration::from_millis(20),
            max_retry_interval: Duration::from_millis(250),
        }
    }
}

/// Identity written into the lock file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOwner {
    pub instance_id: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub operation: OperationId,
}

/// A held lock. Dropping releases best-effort; call [`LockGuard::release`]
/// to observe delete errors.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Acquire the lock at `path` for `operation`.
    ///
    /// Loops create-exclusive / inspect / reclaim / backoff until the
    /// identity round-trip succeeds or the deadline passes.
    pub async fn acquire<P: ProcessProbe, C: Clock>(
        path: &Path,
        operation: &OperationId,
        instance_id: &str,
        pid: u32,
        opts: &LockOptions,
        probe: &P,
        clock: &C,
    ) -> Result<LockGuard, LockError> {
        let deadline = Instant::now() + opts.timeout;
        let mut backoff = opts.retry_interval;

        loop {
            // Deadline first: a lock that turned stale while we were
            // already waiting is surfaced as a timeout, not stolen
            if Instant::now() >= deadline {
                return Err(LockError::Timeout {
                    path: path.to_owned(),
                    timeout: opts.timeout,
                });
            }

            match try_create(path, operation, instance_id, pid, clock)? {
                Attempt::Acquired => {
                    return Ok(LockGuard {
                        path: path.to_owned(),
                        released: false,
                    });
                }
                Attempt::LostRace => {
                    debug!(path = %path.display(), "lost lock race after write");
                }
                Attempt::Held(owner) => {
                    if reclaimable(&owner, opts, probe, clock) {
                        info!(
                            path = %path.display(),
                            owner_pid = owner.pid,
                            owner_instance = %owner.instance_id,
                            "reclaiming stale lock"
                        );
                        remove_quiet(path);
                        // Skip the backoff: the lock is free now
                        continue;
                    }
                }
                Attempt::Unreadable => {
                    // Mid-write by a peer, or debris. Reclaim only once the
                    // file itself has sat unreadable longer than the timeout.
                    if file_older_than(path, opts.timeout) {
                        warn!(path = %path.display(), "reclaiming unreadable lock file");
                        remove_quiet(path);
                        continue;
                    }
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(opts.max_retry_interval);
        }
    }

    /// Delete the lock file. Idempotent.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            remove_quiet(&self.path);
        }
    }
}

enum Attempt {
    Acquired,
    LostRace,
    Held(LockOwner),
    Unreadable,
}

fn try_create<C: Clock>(
    path: &Path,
    operation: &OperationId,
    instance_id: &str,
    pid: u32,
    clock: &C,
) -> Result<Attempt, LockError> {
    use std::io::Write;

    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut file) => {
            let owner = LockOwner {
                instance_id: instance_id.to_string(),
                pid,
                acquired_at: clock.now_utc(),
                operation: operation.clone(),
            };
            let bytes = serde_json::to_vec(&owner).map_err(io_from_json)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            drop(file);

            // Identity round-trip: a peer may have reclaimed and re-created
            // the file between our create and now
            match read_owner(path) {
                Some(on_disk)
                    if on_disk.instance_id == owner.instance_id && on_disk.pid == owner.pid =>
                {
                    Ok(Attempt::Acquired)
                }
                _ => Ok(Attempt::LostRace),
            }
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match read_owner(path) {
            Some(owner) => Ok(Attempt::Held(owner)),
            None => Ok(Attempt::Unreadable),
        },
        Err(e) => Err(e.into()),
    }
}

fn reclaimable<P: ProcessProbe, C: Clock>(
    owner: &LockOwner,
    opts: &LockOptions,
    probe: &P,
    clock: &C,
) -> bool {
    if !probe.is_alive(owner.pid) {
        return true;
    }
    let age = (clock.now_utc() - owner.acquired_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    age > opts.timeout
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn file_older_than(path: &Path, age: Duration) -> bool {
    path.metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|elapsed| elapsed > age)
        .unwrap_or(false)
}

fn remove_quiet(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove lock file");
        }
    }
}

fn io_from_json(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
