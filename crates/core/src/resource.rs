// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Temp resources: filesystem paths whose deletion must follow cleanup.
//!
//! Ownership is by pid, not by frame; a resource outlives any one frame of
//! its owner and is reclaimed once the owner has no live frame left.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered filesystem path tied to the operation's lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TempResource {
    pub path: String,
    /// Owning OS process id
    pub owner: u32,
    pub registered_at: DateTime<Utc>,
}

impl TempResource {
    pub fn new(path: impl Into<String>, owner: u32, now: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            owner,
            registered_at: now,
        }
    }
}
