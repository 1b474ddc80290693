// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Record store: read and atomically replace the operation JSON.
//!
//! Writes go to `{path}.tmp`, fsync, then rename over the record. The
//! previous record is rotated into a `.bak.N` chain (`.bak.0` newest) so a
//! corrupt record can be recovered from the most recent good backup.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tally_core::{OperationId, OperationRecord};
use thiserror::Error;
use tracing::warn;

/// Errors that can occur in record store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt operation record at {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
}

/// Reads and writes operation records under one base directory.
#[derive(Debug, Clone)]
pub struct RecordStore {
    base_path: PathBuf,
    max_backups: u32,
}

impl RecordStore {
    pub fn new(base_path: impl Into<PathBuf>, max_backups: u32) -> Self {
        Self {
            base_path: base_path.into(),
            max_backups,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// `{basePath}/{operationId}.json`
    pub fn record_path(&self, id: &OperationId) -> PathBuf {
        self.base_path.join(format!("{id}.json"))
    }

    /// `{basePath}/{operationId}.lock`
    pub fn lock_path(&self, id: &OperationId) -> PathBuf {
        self.base_path.join(format!("{id}.lock"))
    }

    /// `{basePath}/{operationId}.log`
    pub fn log_path(&self, id: &OperationId) -> PathBuf {
        self.base_path.join(format!("{id}.log"))
    }

    fn backup_path(&self, id: &OperationId, n: u32) -> PathBuf {
        self.base_path.join(format!("{id}.json.bak.{n}"))
    }

    /// Read the record. Missing file is `None`; unparseable is `Corrupt`.
    pub fn read(&self, id: &OperationId) -> Result<Option<OperationRecord>, StoreError> {
        let path = self.record_path(id);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents).map(Some).map_err(|e| {
            StoreError::Corrupt {
                path,
                message: e.to_string(),
            }
        })
    }

    /// Read the record, falling back to the newest parseable backup when the
    /// record itself is corrupt.
    pub fn recover(&self, id: &OperationId) -> Result<Option<OperationRecord>, StoreError> {
        let corrupt = match self.read(id) {
            Ok(found) => return Ok(found),
            Err(StoreError::Corrupt { path, message }) => {
                warn!(
                    path = %path.display(),
                    message,
                    "corrupt operation record, trying backups"
                );
                StoreError::Corrupt { path, message }
            }
            Err(e) => return Err(e),
        };

        for n in 0..self.max_backups {
            let bak = self.backup_path(id, n);
            let Ok(contents) = fs::read_to_string(&bak) else {
                continue;
            };
            match serde_json::from_str(&contents) {
                Ok(record) => {
                    warn!(backup = %bak.display(), "recovered record from backup");
                    return Ok(Some(record));
                }
                Err(e) => {
                    warn!(backup = %bak.display(), error = %e, "backup unparseable");
                }
            }
        }
        Err(corrupt)
    }

    /// Write the record atomically, rotating the previous version into the
    /// backup chain. Returns the path of the backup created, if any.
    pub fn write(&self, record: &OperationRecord) -> Result<Option<PathBuf>, StoreError> {
        fs::create_dir_all(&self.base_path)?;

        let path = self.record_path(&record.operation_id);
        let tmp_path = self.base_path.join(format!("{}.json.tmp", record.operation_id));

        // Write to temp file and sync
        {
            let mut file = File::create(&tmp_path)?;
            let bytes = serde_json::to_vec(record)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }

        let backup = if path.exists() && self.max_backups > 0 {
            Some(self.rotate_backups(&record.operation_id, &path)?)
        } else {
            None
        };

        // Atomic replace
        fs::rename(&tmp_path, &path)?;
        Ok(backup)
    }

    /// Shift `.bak.{n} → .bak.{n+1}` and move the current record into
    /// `.bak.0`. The oldest backup past `max_backups` is dropped.
    fn rotate_backups(&self, id: &OperationId, current: &Path) -> Result<PathBuf, StoreError> {
        let oldest = self.backup_path(id, self.max_backups - 1);
        if oldest.exists() {
            let _ = fs::remove_file(&oldest);
        }
        for n in (0..self.max_backups - 1).rev() {
            let src = self.backup_path(id, n);
            if src.exists() {
                let _ = fs::rename(&src, self.backup_path(id, n + 1));
            }
        }

        let newest = self.backup_path(id, 0);
        fs::rename(current, &newest)?;
        Ok(newest)
    }

    /// Delete the record and every backup. Idempotent; the sidecar log is
    /// left for post-mortems.
    pub fn remove(&self, id: &OperationId) -> Result<(), StoreError> {
        remove_quiet(&self.record_path(id))?;
        for n in 0..self.max_backups.max(1) {
            remove_quiet(&self.backup_path(id, n))?;
        }
        Ok(())
    }
}

fn remove_quiet(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
