//! Monotonic millisecond clock used for all timeout arithmetic.
//!
//! Every component that measures elapsed time (message expiry, batch receive
//! deadlines, management timeouts, CBS negotiation timeouts, token expiry) reads
//! the same `TickCounter` handed down from its `Connection`. A manual counter can
//! be substituted so time-dependent behavior is deterministic under test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
enum Source {
    Monotonic(Instant),
    Manual(Arc<AtomicU64>),
}

/// Monotonic millisecond clock.
#[derive(Debug, Clone)]
pub struct TickCounter {
    source: Source,
}

impl TickCounter {
    /// Creates a counter backed by `Instant`, starting at zero.
    pub fn new() -> Self {
        Self {
            source: Source::Monotonic(Instant::now()),
        }
    }

    /// Creates a counter that only moves when `advance` is called.
    ///
    /// Clones share the same underlying value.
    pub fn manual() -> Self {
        Self {
            source: Source::Manual(Arc::new(AtomicU64::new(0))),
        }
    }

    /// Milliseconds since the counter was created.
    pub fn current_ms(&self) -> u64 {
        match &self.source {
            Source::Monotonic(start) => start.elapsed().as_millis() as u64,
            Source::Manual(value) => value.load(Ordering::Acquire),
        }
    }

    /// Advances a manual counter. No-op on a monotonic counter.
    pub fn advance(&self, by: Duration) {
        if let Source::Manual(value) = &self.source {
            value.fetch_add(by.as_millis() as u64, Ordering::AcqRel);
        }
    }

    /// Returns true if this counter is driven by `advance`.
    pub fn is_manual(&self) -> bool {
        matches!(self.source, Source::Manual(_))
    }

    /// Milliseconds elapsed since `since_ms` (a previous `current_ms` reading).
    pub fn elapsed_since(&self, since_ms: u64) -> u64 {
        self.current_ms().saturating_sub(since_ms)
    }

    /// Converts an absolute wall-clock expiry (seconds since epoch) into a
    /// tick value on this counter.
    pub fn tick_for_epoch_secs(&self, epoch_secs: u64) -> u64 {
        let now_secs = epoch_now_secs();
        let remaining_ms = epoch_secs.saturating_sub(now_secs).saturating_mul(1000);
        self.current_ms().saturating_add(remaining_ms)
    }
}

impl Default for TickCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Seconds since the UNIX epoch.
pub fn epoch_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
