//! Shared fixtures for the ledger specs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{FakeProbe, SequentialIdGen, SystemClock};
use tally_ledger::{Ledger, LedgerConfig, NoopCallback};

pub type TestLedger = Ledger<SystemClock, FakeProbe, SequentialIdGen>;

/// Tight intervals so scenarios settle in tens of milliseconds.
pub fn config(dir: &Path) -> LedgerConfig {
    let mut config = LedgerConfig::new(dir);
    config.heartbeat_interval = Duration::from_millis(40);
    config.jitter = Duration::from_millis(5);
    config.stale_threshold = Duration::from_millis(400);
    config.lock.timeout = Duration::from_millis(800);
    config
}

/// A participant with its own fake pid and probe.
pub fn participant(dir: &Path, name: &str, pid: u32) -> (TestLedger, FakeProbe) {
    let probe = FakeProbe::new();
    let ledger = Ledger::connect_with(
        name,
        config(dir),
        Arc::new(NoopCallback),
        SystemClock,
        probe.clone(),
        SequentialIdGen::new(name),
        Some(pid),
    )
    .unwrap();
    (ledger, probe)
}

/// Poll `check` until it holds or the deadline passes.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
