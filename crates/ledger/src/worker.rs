// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! External worker processes as spawned calls.
//!
//! These compose the call layer: push a frame, fork the child, stream its
//! output, and settle the call from the exit status. Cancellation sends
//! SIGTERM and escalates to SIGKILL if the child lingers.

use crate::call::{CallError, SpawnedCall, WorkContext};
use crate::callback::NoopCallback;
use crate::error::LedgerError;
use crate::operation::Operation;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tally_core::{Clock, IdGen, ProcessProbe};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::warn;

/// How long a canceled child gets to exit after SIGTERM
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Captured output of a stdio worker
#[derive(Debug, Clone)]
pub struct StdioWorkerOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl<C: Clock, P: ProcessProbe, G: IdGen> Operation<C, P, G> {
    /// Run `command` as a worker, capturing stdout/stderr. The call
    /// completes with the captured output on exit 0 and fails otherwise.
    pub async fn exec_stdio_worker(
        &self,
        description: &str,
        mut command: Command,
        fail_on_crash: bool,
    ) -> Result<SpawnedCall<StdioWorkerOutput>, LedgerError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.spawn_call(
            Some(description),
            Arc::new(NoopCallback),
            fail_on_crash,
            move |ctx| async move { run_stdio(command, ctx).await },
        )
        .await
    }

    /// Run `command` as a worker that writes its JSON result to
    /// `result_path`. The call completes with the parsed result; a child
    /// that exits without producing the file fails the call.
    pub async fn exec_file_result_worker<T>(
        &self,
        description: &str,
        mut command: Command,
        result_path: PathBuf,
        poll_interval: Duration,
        timeout: Duration,
        fail_on_crash: bool,
    ) -> Result<SpawnedCall<T>, LedgerError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.spawn_call(
            Some(description),
            Arc::new(NoopCallback),
            fail_on_crash,
            move |ctx| async move {
                run_file_result(command, result_path, poll_interval, timeout, ctx).await
            },
        )
        .await
    }
}

async fn run_stdio(mut command: Command, ctx: WorkContext) -> Result<StdioWorkerOutput, CallError> {
    let mut child = command
        .spawn()
        .map_err(|e| CallError::Failed(format!("spawn failed: {e}")))?;
    if let Some(pid) = child.id() {
        ctx.report_child_pid(pid);
    }

    let stdout_task = slurp(child.stdout.take());
    let stderr_task = slurp(child.stderr.take());

    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|e| CallError::Failed(format!("wait failed: {e}")))?
        }
        _ = ctx.cancel.canceled() => {
            terminate(&mut child).await;
            ctx.clear_child_pid();
            return Err(CallError::Canceled);
        }
    };
    ctx.clear_child_pid();

    let stdout = stdout_task.await;
    let stderr = stderr_task.await;
    let exit_code = status.code();

    if status.success() {
        Ok(StdioWorkerOutput {
            exit_code,
            stdout,
            stderr,
        })
    } else {
        Err(CallError::Failed(format!(
            "worker exited with {status}: {}",
            tail(&stderr)
        )))
    }
}

async fn run_file_result<T>(
    mut command: Command,
    result_path: PathBuf,
    poll_interval: Duration,
    timeout: Duration,
    ctx: WorkContext,
) -> Result<T, CallError>
where
    T: DeserializeOwned + Send + 'static,
{
    let mut child = command
        .spawn()
        .map_err(|e| CallError::Failed(format!("spawn failed: {e}")))?;
    if let Some(pid) = child.id() {
        ctx.report_child_pid(pid);
    }
    let stderr_task = slurp(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let mut exited_ok = false;
    loop {
        if result_path.exists() {
            terminate_if_running(&mut child).await;
            ctx.clear_child_pid();
            let contents = tokio::fs::read_to_string(&result_path)
                .await
                .map_err(|e| CallError::Failed(format!("read {result_path:?}: {e}")))?;
            let _ = tokio::fs::remove_file(&result_path).await;
            return serde_json::from_str(&contents)
                .map_err(|e| CallError::Failed(format!("parse {result_path:?}: {e}")));
        }
        if exited_ok {
            // Child finished cleanly but never produced the file
            return Err(CallError::Failed(format!(
                "worker exited without writing {result_path:?}"
            )));
        }
        if Instant::now() >= deadline {
            terminate(&mut child).await;
            ctx.clear_child_pid();
            return Err(CallError::Failed(format!(
                "timed out waiting for {result_path:?}"
            )));
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = ctx.cancel.canceled() => {
                terminate(&mut child).await;
                ctx.clear_child_pid();
                return Err(CallError::Canceled);
            }
            status = child.wait() => {
                let status = status.map_err(|e| CallError::Failed(format!("wait failed: {e}")))?;
                ctx.clear_child_pid();
                if !status.success() {
                    let stderr = stderr_task.await;
                    return Err(CallError::Failed(format!(
                        "worker exited with {status}: {}",
                        tail(&stderr)
                    )));
                }
                // One more pass so a file written right before exit is seen
                exited_ok = true;
            }
        }
    }
}

/// SIGTERM, grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "worker ignored SIGTERM, killing");
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

async fn terminate_if_running(child: &mut Child) {
    if child.try_wait().ok().flatten().is_none() {
        terminate(child).await;
    }
}

/// Drain a pipe to a string on a background task.
fn slurp<R>(pipe: Option<R>) -> impl Future<Output = String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let task = tokio::spawn(async move {
        let mut out = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut out).await;
        }
        out
    });
    async move { task.await.unwrap_or_default() }
}

fn tail(s: &str) -> &str {
    let s = s.trim_end();
    match s.char_indices().rev().nth(400) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
