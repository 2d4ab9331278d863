//! Retry policy for CBS PUT-token requests.
//!
//! The authenticator consults the policy each time it observes a failed token
//! request: it either retries after the backoff or gives up once the retry
//! budget is spent.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for sending authentication tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenRetryPolicy {
    /// Number of retry attempts for a failed PUT-token request, exclusive of
    /// the initial attempt (default: 3).
    pub retries: u32,
    /// Delay between retry attempts in milliseconds (default: 0).
    pub backoff_ms: u64,
    /// Multiplier applied to the backoff on each successive retry (default: 1.0).
    pub backoff_multiplier: f64,
    /// Upper bound for the computed backoff in milliseconds (default: 30s).
    pub max_backoff_ms: u64,
    /// Add up to 50% random jitter to the backoff (default: false).
    pub jitter: bool,
}

impl Default for TokenRetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_ms: 0,
            backoff_multiplier: 1.0,
            max_backoff_ms: 30_000,
            jitter: false,
        }
    }
}

impl TokenRetryPolicy {
    /// Fixed-delay policy.
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self {
            retries,
            backoff_ms: backoff.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Returns true while `attempts_so_far` retries leave budget for another.
    pub fn allows(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.retries
    }

    /// Backoff before retry number `attempt` (zero-based).
    ///
    /// Computes `backoff * multiplier^attempt`, capped at `max_backoff_ms`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if self.backoff_ms == 0 {
            return Duration::ZERO;
        }
        let computed = self.backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = computed.min(self.max_backoff_ms as f64).max(0.0) as u64;

        if self.jitter && capped > 1 {
            let jitter_ms = rand::thread_rng().gen_range(0..=capped / 2);
            Duration::from_millis(capped.saturating_add(jitter_ms))
        } else {
            Duration::from_millis(capped)
        }
    }
}
