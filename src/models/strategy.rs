//! Shared per-strategy state consumed by the selection controller

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Capability flag advertised by a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StrategyFlag {
    /// Upstream is a public proxy shared with other users
    Public,
}

impl StrategyFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyFlag::Public => "PUBLIC",
        }
    }
}

impl std::fmt::Display for StrategyFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Set of capability flags
pub type StrategyFlags = BTreeSet<StrategyFlag>;

/// Latency and failure counters of one strategy
///
/// Shared by every connection that selects the strategy. Counters are
/// atomics, so a reset racing with an increment may lose one of the two
/// updates but never produces a torn value.
#[derive(Debug, Default)]
pub struct StrategyStats {
    failed_times: AtomicU32,
    latency_micros: AtomicU64,
}

impl StrategyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of failures since the last successful forward
    pub fn failed_times(&self) -> u32 {
        self.failed_times.load(Ordering::Relaxed)
    }

    pub fn increase_failed_time(&self) {
        self.failed_times.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_failed_times(&self) {
        self.failed_times.store(0, Ordering::Relaxed);
    }

    /// Last recorded successful round trip
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_micros.load(Ordering::Relaxed))
    }

    pub fn record_latency(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.store(micros, Ordering::Relaxed);
    }
}
