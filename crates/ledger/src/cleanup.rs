// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cleanup rules applied during heartbeat cycles.
//!
//! Four independent rules drain crashed and stepping-aside frames from the
//! stack. Each is idempotent and commutative: any participant's cycle may
//! apply any rule, and double application is a no-op because the frame is
//! already gone.
//!
//! 1. **Self-cleanup** - while the operation is in cleanup, a participant
//!    marks its own active frames `cleanup-requested` (local cleanup
//!    callbacks fire between cycles) and removes frames it marked on an
//!    earlier cycle.
//! 2. **Unsupervised crash** - a crashed frame with no supervisor is
//!    removed by whoever sees it first.
//! 3. **Supervised crash** - a crashed frame whose supervisor is owned by
//!    this participant is removed here, producing a crash notice for the
//!    supervisor's callback. Only the supervising participant applies this
//!    rule, which is what makes the notification exactly-once.
//! 4. **Dead supervisor** - a crashed frame whose supervisor also crashed
//!    is removed by anyone, cascading until a live supervisor (or none)
//!    remains.
//!
//! Rules 2–4 run in every state so a crashed `fail_on_crash = false` frame
//! is reaped without failing the operation. Rule 1 runs only in cleanup.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tally_core::{CallFrame, CallId, FrameState, OperationRecord, OperationState};
use tracing::{debug, info};

/// Who is running the cycle
pub(crate) struct CleanupContext {
    pub pid: u32,
    pub now: DateTime<Utc>,
    pub stale_threshold: Duration,
}

/// A crashed child reaped on behalf of a supervisor owned by this process
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CrashNotice {
    pub supervisor_call: CallId,
    pub crashed_call: CallId,
}

/// What one application of the rules did to the record
#[derive(Debug, Default)]
pub(crate) struct CleanupOutcome {
    pub removed: Vec<CallFrame>,
    pub crash_notices: Vec<CrashNotice>,
    /// Frames of this participant newly marked `cleanup-requested`
    pub self_cleanup_requested: Vec<CallId>,
}

/// Apply every rule that is due, to fixpoint.
pub(crate) fn apply(record: &mut OperationRecord, ctx: &CleanupContext) -> CleanupOutcome {
    let mut out = CleanupOutcome::default();

    if record.operation_state == OperationState::Cleanup {
        rule_self_cleanup(record, ctx, &mut out);
    }
    reap_stale_leavers(record, ctx, &mut out);
    reap_crashed(record, ctx, &mut out);

    out
}

/// Rule 1. Remove own frames marked on an earlier cycle, then mark own
/// active frames so local cleanup callbacks get one cycle to run.
fn rule_self_cleanup(record: &mut OperationRecord, ctx: &CleanupContext, out: &mut CleanupOutcome) {
    let previously_marked: Vec<CallId> = record
        .call_frames
        .iter()
        .filter(|f| f.pid == ctx.pid && f.state == FrameState::CleanupRequested)
        .map(|f| f.call_id.clone())
        .collect();
    for call_id in previously_marked {
        if let Some(frame) = record.remove_frame(&call_id) {
            debug!(call_id = %frame.call_id, "removed own frame after cleanup");
            out.removed.push(frame);
        }
    }

    let mine: Vec<CallId> = record
        .call_frames
        .iter()
        .filter(|f| f.pid == ctx.pid && f.state == FrameState::Active)
        .map(|f| f.call_id.clone())
        .collect();
    for call_id in mine {
        if let Some(frame) = record.frame_mut(&call_id) {
            if frame.request_cleanup() {
                out.self_cleanup_requested.push(call_id);
            }
        }
    }
}

/// A `cleanup-requested` frame whose owner stopped heartbeating would pin
/// the stack forever (staleness only crashes *active* frames), so anyone
/// may reap it once it goes stale.
fn reap_stale_leavers(record: &mut OperationRecord, ctx: &CleanupContext, out: &mut CleanupOutcome) {
    let stale: Vec<CallId> = record
        .call_frames
        .iter()
        .filter(|f| {
            f.state == FrameState::CleanupRequested && f.is_stale(ctx.now, ctx.stale_threshold)
        })
        .map(|f| f.call_id.clone())
        .collect();
    for call_id in stale {
        if let Some(frame) = record.remove_frame(&call_id) {
            info!(
                call_id = %frame.call_id,
                participant = %frame.participant_id,
                "reaped stale cleanup-requested frame"
            );
            out.removed.push(frame);
        }
    }
}

/// Rules 2–4 over the crashed frames, looping so cascades resolve within
/// one cycle.
///
/// Each pass decides every crashed frame against the same stack snapshot,
/// then applies the removals. A child of a dead supervisor must not be
/// re-attributed to a live ancestor just because the supervisor was removed
/// earlier in the same pass.
fn reap_crashed(record: &mut OperationRecord, ctx: &CleanupContext, out: &mut CleanupOutcome) {
    loop {
        let mut removals: Vec<CallId> = Vec::new();
        let mut notices: Vec<CrashNotice> = Vec::new();

        for frame in record.crashed_frames() {
            match record.supervisor_of(&frame.call_id) {
                // Rule 2: nobody to notify, first cycle to see it reaps it
                None => removals.push(frame.call_id.clone()),
                // Rule 4: supervisor crashed too; remove the child, the
                // supervisor resolves by its own supervisor on this or a
                // later pass
                Some(sup) if sup.state == FrameState::Crashed => {
                    removals.push(frame.call_id.clone());
                }
                // Rule 3: our frame supervises it; reap and notify
                Some(sup) if sup.pid == ctx.pid => {
                    notices.push(CrashNotice {
                        supervisor_call: sup.call_id.clone(),
                        crashed_call: frame.call_id.clone(),
                    });
                    removals.push(frame.call_id.clone());
                }
                // A live supervisor owned by another participant reaps this
                // frame on its own cycle
                Some(_) => {}
            }
        }

        if removals.is_empty() {
            break;
        }
        for call_id in removals {
            if let Some(frame) = record.remove_frame(&call_id) {
                info!(
                    call_id = %frame.call_id,
                    participant = %frame.participant_id,
                    "removed crashed frame"
                );
                out.removed.push(frame);
            }
        }
        out.crash_notices.extend(notices);
    }
}

#[cfg(test)]
#[path = "cleanup_tests.rs"]
mod tests;
