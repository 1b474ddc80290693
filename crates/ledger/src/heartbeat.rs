// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-operation heartbeat task.
//!
//! Every tick acquires the record lock, runs one [`cycle`](crate::cycle),
//! performs the planned side effects, releases the lock, and only then
//! dispatches callbacks. A failed cycle is reported through callbacks and
//! retried on the next tick; the ticker itself never dies from a cycle
//! error.

use crate::call::CallStatus;
use crate::cycle::{self, CycleContext};
use crate::error::{HeartbeatError, HeartbeatErrorKind};
use crate::operation::OperationCore;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tally_core::{
    CallId, Clock, FrameState, IdGen, OperationId, OperationState, ParticipantId, ProcessProbe,
};
use tally_storage::LockGuard;
use tracing::warn;

/// What one heartbeat tick observed
#[derive(Debug, Clone)]
pub enum HeartbeatResult {
    /// The record file no longer exists
    NoLedger,
    Cycle(CycleReport),
}

/// Before/after snapshot of a completed cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub operation_id: OperationId,
    pub before_state: OperationState,
    pub after_state: OperationState,
    /// Participants whose frames went stale this cycle
    pub stale_participants: Vec<ParticipantId>,
    /// Frames this cycle transitioned to `crashed`
    pub newly_crashed: Vec<CallId>,
    /// Frames removed from the stack this cycle
    pub removed_calls: Vec<CallId>,
    pub record_deleted: bool,
    pub backup_created: Option<PathBuf>,
}

/// Ticker loop. Runs until stopped or until the record is deleted by this
/// participant's own cycle.
pub(crate) async fn run_loop<C, P, G>(core: Arc<OperationCore<C, P, G>>)
where
    C: Clock,
    P: ProcessProbe,
    G: IdGen,
{
    loop {
        let delay = jittered(core.config.heartbeat_interval, core.config.jitter);
        tokio::select! {
            _ = core.stopped() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        if core.is_stopped() {
            break;
        }

        match run_cycle(&core).await {
            Ok(result) => {
                let stop = matches!(
                    &result,
                    HeartbeatResult::Cycle(report) if report.record_deleted
                );
                core.operation_callback.on_heartbeat_success(&result);
                if stop {
                    core.stop_heartbeat();
                    break;
                }
            }
            Err(error) => {
                core.operation_callback.on_heartbeat_error(&error);
                core.ledger_callback
                    .on_global_heartbeat_error(&core.operation_id, &error);
            }
        }
    }
}

fn jittered(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    let extra = rand::rng().random_range(0..=jitter.as_millis() as u64);
    interval + Duration::from_millis(extra)
}

/// One locked heartbeat cycle plus callback dispatch.
pub(crate) async fn run_cycle<C, P, G>(
    core: &Arc<OperationCore<C, P, G>>,
) -> Result<HeartbeatResult, HeartbeatError>
where
    C: Clock,
    P: ProcessProbe,
    G: IdGen,
{
    let guard = LockGuard::acquire(
        &core.store.lock_path(&core.operation_id),
        &core.operation_id,
        &core.instance_id,
        core.pid,
        &core.config.lock,
        &core.probe,
        &core.clock,
    )
    .await
    .map_err(HeartbeatError::from)?;

    // The handle may have been stopped while we waited on the lock
    if core.is_stopped() {
        release_quiet(guard);
        return Err(HeartbeatError::new(
            HeartbeatErrorKind::Canceled,
            "heartbeat stopped during cycle",
        ));
    }

    let record = match core.store.read(&core.operation_id) {
        Ok(record) => record,
        Err(e) => {
            release_quiet(guard);
            return Err(e.into());
        }
    };
    let Some(mut record) = record else {
        release_guard(guard)?;
        dispatch_no_ledger(core);
        return Ok(HeartbeatResult::NoLedger);
    };

    let now = core.clock.now_utc();
    let outcome = cycle::run(
        &mut record,
        &CycleContext {
            now,
            pid: core.pid,
            stale_threshold: core.config.stale_threshold,
            removal_grace: core.config.removal_grace(),
        },
    );

    // Best-effort resource reclamation; failures are logged, never fatal
    for path in &outcome.resources_to_delete {
        remove_path(Path::new(path));
    }

    let backup_created = if outcome.delete_record {
        if let Err(e) = core.store.remove(&core.operation_id) {
            release_quiet(guard);
            return Err(e.into());
        }
        None
    } else {
        match core.store.write(&record) {
            Ok(backup) => backup,
            Err(e) => {
                release_quiet(guard);
                return Err(e.into());
            }
        }
    };
    release_guard(guard)?;

    // Record crashes observed anywhere (by us or by peers) for failure info
    core.note_crashed(outcome.newly_crashed.iter().cloned());
    core.note_crashed(outcome.crashed_on_stack.iter().cloned());
    core.note_crashed(
        outcome
            .removed_frames
            .iter()
            .filter(|f| f.state == FrameState::Crashed)
            .map(|f| f.call_id.clone()),
    );

    let report = CycleReport {
        operation_id: core.operation_id.clone(),
        before_state: outcome.before_state,
        after_state: outcome.after_state,
        stale_participants: outcome.stale_participants.clone(),
        newly_crashed: outcome.newly_crashed.clone(),
        removed_calls: outcome
            .removed_frames
            .iter()
            .map(|f| f.call_id.clone())
            .collect(),
        record_deleted: outcome.delete_record,
        backup_created: backup_created.clone(),
    };

    dispatch(core, &outcome, backup_created);

    Ok(HeartbeatResult::Cycle(report))
}

/// Callback dispatch for a completed cycle. Runs after the lock release so
/// callbacks can themselves use ledger APIs.
fn dispatch<C, P, G>(
    core: &Arc<OperationCore<C, P, G>>,
    outcome: &cycle::CycleOutcome,
    backup_created: Option<PathBuf>,
) where
    C: Clock,
    P: ProcessProbe,
    G: IdGen,
{
    if let Some(backup) = backup_created {
        core.ledger_callback.on_backup_created(&backup);
    }

    // Crashed children supervised by one of our frames
    for notice in &outcome.crash_notices {
        let callback = core.call_callback(&notice.supervisor_call);
        if let Some(callback) = callback {
            callback.on_call_crashed(&notice.crashed_call);
        }
    }

    // Our frames that must step aside: run local cleanup hooks now, the
    // next cycle removes the frames
    for call_id in &outcome.self_cleanup_requested {
        core.run_local_cleanup(call_id);
    }

    // Frames of ours that were removed by a peer (or by our own cycle) while
    // the call handle is still registered settle as unknown
    for frame in &outcome.removed_frames {
        if frame.pid == core.pid {
            core.settle_call(&frame.call_id, CallStatus::Unknown);
        }
    }

    if outcome.aborted {
        core.observe_abort();
    }
    if matches!(
        outcome.after_state,
        OperationState::Cleanup | OperationState::Failed
    ) {
        core.observe_cleanup();
    }
    if outcome.after_state == OperationState::Failed {
        core.observe_failure();
    }
}

/// The record vanished. If we had already seen cleanup, a peer finished the
/// failure protocol and deleted the file; resolve local waiters.
fn dispatch_no_ledger<C, P, G>(core: &Arc<OperationCore<C, P, G>>)
where
    C: Clock,
    P: ProcessProbe,
    G: IdGen,
{
    if core.cleanup_seen() {
        core.observe_failure();
    }
}

fn release_guard(guard: LockGuard) -> Result<(), HeartbeatError> {
    guard.release().map_err(|e| {
        HeartbeatError::with_source(HeartbeatErrorKind::IoError, "lock release failed", e)
    })
}

fn release_quiet(guard: LockGuard) {
    if let Err(e) = guard.release() {
        warn!(error = %e, "failed to release operation lock");
    }
}

/// Delete a reclaimed path, directory or file. Missing paths are fine.
fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete temp resource"),
    }
}

#[cfg(test)]
#[path = "heartbeat_tests.rs"]
mod tests;
