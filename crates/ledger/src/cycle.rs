// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One heartbeat cycle over the operation record, as a pure function.
//!
//! The engine acquires the lock, reads the record, runs this planner, then
//! performs the planned side effects (resource deletion, write or delete)
//! and dispatches callbacks. Keeping the planning pure makes every state
//! transition unit-testable without disk or timers.
//!
//! Ordering inside a cycle matters: stale classification runs before the
//! cleanup rules, so a frame is never cleaned before being classified; own
//! heartbeats are renewed after cleanup, so a frame this participant just
//! stepped out of is not revived.

use crate::cleanup::{self, CleanupContext, CrashNotice};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tally_core::{CallFrame, CallId, FrameState, OperationRecord, OperationState};
use tracing::info;

pub(crate) struct CycleContext {
    pub now: DateTime<Utc>,
    pub pid: u32,
    pub stale_threshold: Duration,
    /// How long a failed record stays on disk for lagging peers
    pub removal_grace: Duration,
}

/// Everything one cycle decided, for side effects and callbacks
#[derive(Debug)]
pub(crate) struct CycleOutcome {
    pub before_state: OperationState,
    pub after_state: OperationState,
    /// Frames this cycle transitioned `active → crashed`
    pub newly_crashed: Vec<CallId>,
    /// Owners of the newly crashed frames
    pub stale_participants: Vec<tally_core::ParticipantId>,
    /// Crashed children reaped for supervisors owned by this participant
    pub crash_notices: Vec<CrashNotice>,
    /// Frames removed from the stack this cycle
    pub removed_frames: Vec<CallFrame>,
    /// Own frames marked `cleanup-requested` this cycle (local cleanup
    /// callbacks fire before the next cycle removes them)
    pub self_cleanup_requested: Vec<CallId>,
    /// Paths to delete best-effort after the record is written
    pub resources_to_delete: Vec<String>,
    pub entered_cleanup: bool,
    pub entered_failed: bool,
    /// Record (and backups) should be deleted instead of written
    pub delete_record: bool,
    pub aborted: bool,
    /// Crashed call ids still on the stack after this cycle
    pub crashed_on_stack: Vec<CallId>,
}

pub(crate) fn run(record: &mut OperationRecord, ctx: &CycleContext) -> CycleOutcome {
    let before_state = record.operation_state;
    let mut newly_crashed = Vec::new();
    let mut stale_participants = Vec::new();

    // Classify stale frames before any cleanup action
    for call_id in record.stale_active_frames(ctx.now, ctx.stale_threshold) {
        if let Some(frame) = record.frame_mut(&call_id) {
            if frame.mark_crashed() {
                info!(
                    call_id = %frame.call_id,
                    participant = %frame.participant_id,
                    age_ms = frame.heartbeat_age(ctx.now).as_millis() as u64,
                    "frame heartbeat stale, marking crashed"
                );
                if !stale_participants.contains(&frame.participant_id) {
                    stale_participants.push(frame.participant_id.clone());
                }
                newly_crashed.push(call_id);
            }
        }
    }

    // Operation-level transition decisions
    let mut entered_cleanup = false;
    if record.operation_state == OperationState::Active {
        let fatal_crash = record.crashed_frames().iter().any(|f| f.fail_on_crash);
        if fatal_crash || record.aborted {
            entered_cleanup = record.begin_cleanup(ctx.now);
            if entered_cleanup {
                info!(
                    operation_id = %record.operation_id,
                    aborted = record.aborted,
                    fatal_crash,
                    "operation entering cleanup"
                );
            }
        }
    }

    // Cleanup rules due this tick
    let cleanup_out = cleanup::apply(
        record,
        &CleanupContext {
            pid: ctx.pid,
            now: ctx.now,
            stale_threshold: ctx.stale_threshold,
        },
    );
    let mut resources_to_delete: Vec<String> = cleanup_out
        .removed
        .iter()
        .flat_map(|f| f.resources.iter().cloned())
        .collect();

    // Temp resources whose owner has no live frame are reclaimed during
    // cleanup
    if record.operation_state == OperationState::Cleanup {
        for resource in record.orphaned_resources() {
            record.unregister_resource(&resource.path);
            resources_to_delete.push(resource.path);
        }
    }

    // Renew own heartbeats, then lift the record-level heartbeat
    let mine: Vec<CallId> = record
        .call_frames
        .iter()
        .filter(|f| f.pid == ctx.pid && f.state == FrameState::Active)
        .map(|f| f.call_id.clone())
        .collect();
    for call_id in mine {
        if let Some(frame) = record.frame_mut(&call_id) {
            frame.beat(ctx.now);
        }
    }
    record.refresh_last_heartbeat();

    // A drained stack in cleanup means the operation failed
    let mut entered_failed = false;
    if record.operation_state == OperationState::Cleanup && record.call_frames.is_empty() {
        entered_failed = record.mark_failed(ctx.now);
        if entered_failed {
            info!(operation_id = %record.operation_id, "operation failed, stack drained");
        }
    }

    // Terminal records are deleted: completed ones on the first cycle that
    // observes them, failed ones after the removal grace so lagging peers
    // can still read the terminal state
    let delete_record = match record.operation_state {
        OperationState::Complete => true,
        OperationState::Failed => record
            .removal_timestamp
            .map(|removal| {
                let past = (ctx.now - removal).to_std().unwrap_or(Duration::ZERO);
                past >= ctx.removal_grace
            })
            .unwrap_or(false),
        _ => false,
    };
    if delete_record {
        // Terminal state reclaims every remaining registered resource
        resources_to_delete.extend(record.temp_resources.iter().map(|r| r.path.clone()));
    }

    CycleOutcome {
        before_state,
        after_state: record.operation_state,
        newly_crashed,
        stale_participants,
        crash_notices: cleanup_out.crash_notices,
        removed_frames: cleanup_out.removed,
        self_cleanup_requested: cleanup_out.self_cleanup_requested,
        resources_to_delete,
        entered_cleanup,
        entered_failed,
        delete_record,
        aborted: record.aborted,
        crashed_on_stack: record
            .crashed_frames()
            .into_iter()
            .map(|f| f.call_id.clone())
            .collect(),
    }
}

#[cfg(test)]
#[path = "cycle_tests.rs"]
mod tests;
