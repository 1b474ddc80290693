// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Polling helpers producing work closures for `spawn_call`.
//!
//! Each helper returns a closure suitable as the `work` argument of
//! [`Operation::spawn_call`](crate::Operation::spawn_call). All of them
//! respect the enclosing call's cancel flag and fail once `timeout` passes.

use crate::call::{CallError, WorkContext};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, Instant};

/// Boxed work future, as returned by the helpers here
pub type WorkFuture<T> = Pin<Box<dyn Future<Output = Result<T, CallError>> + Send>>;

/// Resolves when `path` exists and parses as JSON `T`. With `delete`, the
/// file is consumed after a successful read.
pub fn poll_file<T>(
    path: PathBuf,
    delete: bool,
    poll_interval: Duration,
    timeout: Duration,
) -> impl FnOnce(WorkContext) -> WorkFuture<T>
where
    T: DeserializeOwned + Send + 'static,
{
    move |ctx| {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            loop {
                if ctx.cancel.is_canceled() {
                    return Err(CallError::Canceled);
                }
                if path.exists() {
                    let contents = tokio::fs::read_to_string(&path)
                        .await
                        .map_err(|e| CallError::Failed(format!("read {path:?}: {e}")))?;
                    let value: T = serde_json::from_str(&contents)
                        .map_err(|e| CallError::Failed(format!("parse {path:?}: {e}")))?;
                    if delete {
                        let _ = tokio::fs::remove_file(&path).await;
                    }
                    return Ok(value);
                }
                wait_tick(&ctx, poll_interval, deadline, &path).await?;
            }
        })
    }
}

/// Resolves with each file's raw contents once every path exists.
pub fn poll_files(
    paths: Vec<PathBuf>,
    poll_interval: Duration,
    timeout: Duration,
) -> impl FnOnce(WorkContext) -> WorkFuture<Vec<String>> {
    move |ctx| {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            loop {
                if ctx.cancel.is_canceled() {
                    return Err(CallError::Canceled);
                }
                if paths.iter().all(|p| p.exists()) {
                    let mut contents = Vec::with_capacity(paths.len());
                    for path in &paths {
                        contents.push(
                            tokio::fs::read_to_string(path)
                                .await
                                .map_err(|e| CallError::Failed(format!("read {path:?}: {e}")))?,
                        );
                    }
                    return Ok(contents);
                }
                let missing = paths.iter().find(|p| !p.exists());
                if Instant::now() + poll_interval > deadline {
                    return Err(CallError::Failed(format!(
                        "timed out waiting for {missing:?}"
                    )));
                }
                sleep_or_cancel(&ctx, poll_interval).await?;
            }
        })
    }
}

/// Resolves when `check` returns `Some`.
pub fn poll_until<T, F>(
    mut check: F,
    poll_interval: Duration,
    timeout: Duration,
) -> impl FnOnce(WorkContext) -> WorkFuture<T>
where
    T: Send + 'static,
    F: FnMut() -> Option<T> + Send + 'static,
{
    move |ctx| {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            loop {
                if ctx.cancel.is_canceled() {
                    return Err(CallError::Canceled);
                }
                if let Some(value) = check() {
                    return Ok(value);
                }
                if Instant::now() + poll_interval > deadline {
                    return Err(CallError::Failed("poll condition timed out".to_string()));
                }
                sleep_or_cancel(&ctx, poll_interval).await?;
            }
        })
    }
}

async fn wait_tick(
    ctx: &WorkContext,
    poll_interval: Duration,
    deadline: Instant,
    path: &std::path::Path,
) -> Result<(), CallError> {
    if Instant::now() + poll_interval > deadline {
        return Err(CallError::Failed(format!(
            "timed out waiting for {}",
            path.display()
        )));
    }
    sleep_or_cancel(ctx, poll_interval).await
}

async fn sleep_or_cancel(ctx: &WorkContext, duration: Duration) -> Result<(), CallError> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = ctx.cancel.canceled() => Err(CallError::Canceled),
    }
}

#[cfg(test)]
#[path = "poll_tests.rs"]
mod tests;
