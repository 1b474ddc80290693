// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide cleanup handler.
//!
//! Every connected ledger registers here. On SIGINT/SIGTERM the handler
//! disposes all of them (stopping heartbeat tasks so locks are released and
//! no half-written records are left behind) and then exits with the
//! conventional signal status.

use parking_lot::Mutex;
use std::sync::{OnceLock, Weak};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Something that can be torn down at process exit
pub(crate) trait DisposeHook: Send + Sync {
    fn dispose(&self);
}

/// Registry of live dispose hooks
#[derive(Default)]
pub(crate) struct Registry {
    hooks: Mutex<Vec<Weak<dyn DisposeHook>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, hook: Weak<dyn DisposeHook>) {
        let mut hooks = self.hooks.lock();
        hooks.retain(|h| h.strong_count() > 0);
        hooks.push(hook);
    }

    /// Dispose every live hook. Drains the registry, so a second sweep is
    /// a no-op.
    pub(crate) fn dispose_all(&self) {
        let hooks: Vec<_> = self.hooks.lock().drain(..).collect();
        for hook in hooks {
            if let Some(hook) = hook.upgrade() {
                hook.dispose();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.hooks.lock().len()
    }
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();
static HANDLER_INSTALLED: OnceLock<()> = OnceLock::new();

fn global() -> &'static Registry {
    GLOBAL.get_or_init(Registry::new)
}

pub(crate) fn register(hook: Weak<dyn DisposeHook>) {
    global().register(hook);
}

/// Dispose every connected ledger in this process. Idempotent.
pub fn dispose_all() {
    global().dispose_all();
}

/// Install a task that disposes all ledgers on SIGINT/SIGTERM, then exits.
/// Safe to call more than once; only the first call installs. Must be
/// called from within a tokio runtime.
pub fn install_signal_handler() {
    HANDLER_INSTALLED.get_or_init(|| {
        tokio::spawn(async {
            let mut interrupt = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "could not install SIGINT handler");
                    return;
                }
            };
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "could not install SIGTERM handler");
                    return;
                }
            };
            let signo = tokio::select! {
                _ = interrupt.recv() => nix::sys::signal::Signal::SIGINT as i32,
                _ = terminate.recv() => nix::sys::signal::Signal::SIGTERM as i32,
            };
            info!(signo, "fatal signal, disposing ledgers");
            dispose_all();
            std::process::exit(128 + signo);
        });
    });
}

#[cfg(test)]
#[path = "shutdown_tests.rs"]
mod tests;
