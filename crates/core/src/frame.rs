// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Call frames: one outstanding unit of work on the operation stack.
//!
//! A frame is exclusively owned by the participant whose pid matches; only
//! that participant renews `last_heartbeat` or voluntarily requests cleanup.
//! The single permitted cross-owner mutation is marking a stale frame
//! `crashed`, which any peer's heartbeat cycle may do.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

crate::define_id! {
    /// Unique identifier of a call frame within an operation.
    pub struct CallId;
}

crate::define_id! {
    /// Identity of a process participating in an operation.
    pub struct ParticipantId;
}

/// Lifecycle state of a call frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameState {
    /// Owner is alive and renewing the heartbeat
    Active,
    /// Heartbeat went stale; owner presumed dead
    Crashed,
    /// Owner observed cleanup and voluntarily stepped aside
    CleanupRequested,
}

impl FrameState {
    /// True for frames whose owner still participates (not crashed).
    pub fn is_live(self) -> bool {
        !matches!(self, FrameState::Crashed)
    }
}

/// One outstanding unit of work, stacked LIFO on the operation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub participant_id: ParticipantId,
    pub call_id: CallId,
    /// OS process id of the owner at frame creation
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub state: FrameState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Temp paths owned specifically by this frame, released on removal
    #[serde(default)]
    pub resources: Vec<String>,
    /// When true, a crash of this frame fails the whole operation;
    /// when false, only the frame itself is cleaned up.
    pub fail_on_crash: bool,
}

impl CallFrame {
    pub fn new(
        participant_id: ParticipantId,
        call_id: CallId,
        pid: u32,
        now: DateTime<Utc>,
        description: Option<String>,
        fail_on_crash: bool,
    ) -> Self {
        Self {
            participant_id,
            call_id,
            pid,
            start_time: now,
            last_heartbeat: now,
            state: FrameState::Active,
            description,
            resources: Vec::new(),
            fail_on_crash,
        }
    }

    /// Age of the heartbeat at `now`; clamps to zero for clock skew.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }

    /// True once the heartbeat is older than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.heartbeat_age(now) > threshold
    }

    /// Renew the heartbeat. Never moves backwards.
    pub fn beat(&mut self, now: DateTime<Utc>) {
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
    }

    /// Mark a stale frame crashed. Only `active` frames transition.
    pub fn mark_crashed(&mut self) -> bool {
        if self.state == FrameState::Active {
            self.state = FrameState::Crashed;
            true
        } else {
            false
        }
    }

    /// Owner voluntarily steps aside during cleanup.
    pub fn request_cleanup(&mut self) -> bool {
        if self.state == FrameState::Active {
            self.state = FrameState::CleanupRequested;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
