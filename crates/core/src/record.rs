// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The operation record: one JSON object per operation on shared disk.
//!
//! All coordination state lives here. Mutations happen under the sibling
//! advisory lock and are written back atomically, so the record is the
//! linearization point for every participant.
//!
//! State machine:
//!
//! ```text
//! active ──▶ cleanup ──▶ failed
//!    └─────────────────▶ complete
//! ```
//!
//! `failed` and `complete` are terminal. The transition into `cleanup`
//! stamps `detection_timestamp`; the transition into a terminal state stamps
//! `removal_timestamp`, after which heartbeat cycles schedule the file's
//! deletion.

use crate::frame::{CallFrame, CallId, FrameState, ParticipantId};
use crate::resource::TempResource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

crate::define_id! {
    /// Unique identifier of an operation (one record file).
    pub struct OperationId;
}

/// Operation lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Active,
    Cleanup,
    Failed,
    Complete,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Failed | OperationState::Complete)
    }

    /// Legal forward transitions; terminal states absorb everything.
    pub fn can_transition_to(self, next: OperationState) -> bool {
        matches!(
            (self, next),
            (OperationState::Active, OperationState::Cleanup)
                | (OperationState::Active, OperationState::Complete)
                | (OperationState::Cleanup, OperationState::Failed)
        )
    }
}

/// The shared on-disk state of one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub operation_id: OperationId,
    pub initiator_id: ParticipantId,
    pub start_time: DateTime<Utc>,
    pub aborted: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub operation_state: OperationState,
    pub detection_timestamp: Option<DateTime<Utc>>,
    pub removal_timestamp: Option<DateTime<Utc>>,
    /// LIFO stack; the bottom frame is the initiator's root frame
    pub call_frames: Vec<CallFrame>,
    #[serde(default)]
    pub temp_resources: Vec<TempResource>,
}

impl OperationRecord {
    /// Create a fresh record with the initiator's root frame.
    pub fn new(
        operation_id: OperationId,
        initiator_id: ParticipantId,
        root_call: CallId,
        pid: u32,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let root = CallFrame::new(
            initiator_id.clone(),
            root_call,
            pid,
            now,
            description,
            true,
        );
        Self {
            operation_id,
            initiator_id,
            start_time: now,
            aborted: false,
            last_heartbeat: now,
            operation_state: OperationState::Active,
            detection_timestamp: None,
            removal_timestamp: None,
            call_frames: vec![root],
            temp_resources: Vec::new(),
        }
    }

    pub fn frame(&self, call_id: &CallId) -> Option<&CallFrame> {
        self.call_frames.iter().find(|f| &f.call_id == call_id)
    }

    pub fn frame_mut(&mut self, call_id: &CallId) -> Option<&mut CallFrame> {
        self.call_frames.iter_mut().find(|f| &f.call_id == call_id)
    }

    /// Push a new frame on top of the stack.
    pub fn push_frame(&mut self, frame: CallFrame) {
        self.call_frames.push(frame);
    }

    /// Remove a frame wherever it sits on the stack.
    pub fn remove_frame(&mut self, call_id: &CallId) -> Option<CallFrame> {
        let idx = self.call_frames.iter().position(|f| &f.call_id == call_id)?;
        Some(self.call_frames.remove(idx))
    }

    /// All frames owned by one participant.
    pub fn frames_of(&self, participant: &ParticipantId) -> Vec<&CallFrame> {
        self.call_frames
            .iter()
            .filter(|f| &f.participant_id == participant)
            .collect()
    }

    /// The supervisor of a frame: the nearest frame beneath it on the stack
    /// that belongs to a different pid. `None` for unsupervised frames.
    pub fn supervisor_of(&self, call_id: &CallId) -> Option<&CallFrame> {
        let idx = self.call_frames.iter().position(|f| &f.call_id == call_id)?;
        let pid = self.call_frames[idx].pid;
        self.call_frames[..idx].iter().rev().find(|f| f.pid != pid)
    }

    /// Set the abort flag. Monotone: once true, stays true.
    pub fn set_aborted(&mut self) -> bool {
        let changed = !self.aborted;
        self.aborted = true;
        changed
    }

    /// `active → cleanup`, stamping `detection_timestamp`.
    pub fn begin_cleanup(&mut self, now: DateTime<Utc>) -> bool {
        if !self.operation_state.can_transition_to(OperationState::Cleanup) {
            return false;
        }
        self.operation_state = OperationState::Cleanup;
        self.detection_timestamp = Some(now);
        true
    }

    /// `cleanup → failed`, stamping `removal_timestamp`.
    pub fn mark_failed(&mut self, now: DateTime<Utc>) -> bool {
        if !self.operation_state.can_transition_to(OperationState::Failed) {
            return false;
        }
        self.operation_state = OperationState::Failed;
        self.removal_timestamp = Some(now);
        true
    }

    /// `active → complete`, stamping `removal_timestamp`.
    pub fn mark_complete(&mut self, now: DateTime<Utc>) -> bool {
        if !self
            .operation_state
            .can_transition_to(OperationState::Complete)
        {
            return false;
        }
        self.operation_state = OperationState::Complete;
        self.removal_timestamp = Some(now);
        true
    }

    /// Raise the record-level heartbeat to the newest frame heartbeat.
    /// Never moves backwards.
    pub fn refresh_last_heartbeat(&mut self) {
        if let Some(max) = self.call_frames.iter().map(|f| f.last_heartbeat).max() {
            if max > self.last_heartbeat {
                self.last_heartbeat = max;
            }
        }
    }

    /// Register a temp path for an owning pid. Set semantics by path.
    pub fn register_resource(&mut self, path: &str, owner: u32, now: DateTime<Utc>) {
        if self.temp_resources.iter().any(|r| r.path == path) {
            return;
        }
        self.temp_resources.push(TempResource::new(path, owner, now));
    }

    /// Drop a registered temp path. Idempotent.
    pub fn unregister_resource(&mut self, path: &str) -> Option<TempResource> {
        let idx = self.temp_resources.iter().position(|r| r.path == path)?;
        Some(self.temp_resources.remove(idx))
    }

    /// Temp resources whose owning pid has no live frame left.
    pub fn orphaned_resources(&self) -> Vec<TempResource> {
        self.temp_resources
            .iter()
            .filter(|r| {
                !self
                    .call_frames
                    .iter()
                    .any(|f| f.pid == r.owner && f.state.is_live())
            })
            .cloned()
            .collect()
    }

    /// Frames whose heartbeat is older than `threshold` and still `active`.
    pub fn stale_active_frames(
        &self,
        now: DateTime<Utc>,
        threshold: std::time::Duration,
    ) -> Vec<CallId> {
        self.call_frames
            .iter()
            .filter(|f| f.state == FrameState::Active && f.is_stale(now, threshold))
            .map(|f| f.call_id.clone())
            .collect()
    }

    /// Crashed frames currently on the stack.
    pub fn crashed_frames(&self) -> Vec<&CallFrame> {
        self.call_frames
            .iter()
            .filter(|f| f.state == FrameState::Crashed)
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.operation_state.is_terminal()
    }
}

#[cfg(test)]
#[path = "record_tests.rs"]
mod tests;
