//! Deadlines for the bounded spin-loops (batch receive, management execute).
//!
//! A deadline is computed once at call start against the connection's
//! `TickCounter`; a zero timeout means the loop has no deadline.

use std::time::Duration;

use crate::error::AmqpError;
use crate::tick::TickCounter;

/// Absolute deadline as a tick value.
#[derive(Debug, Clone)]
pub struct Deadline {
    counter: TickCounter,
    started_ms: u64,
    expiry_ms: u64,
}

impl Deadline {
    /// Creates a deadline at now + timeout.
    pub fn after(counter: &TickCounter, timeout: Duration) -> Self {
        let started_ms = counter.current_ms();
        Self {
            counter: counter.clone(),
            started_ms,
            expiry_ms: started_ms.saturating_add(timeout.as_millis() as u64),
        }
    }

    /// Returns the remaining time until the deadline expires.
    ///
    /// Returns `None` if the deadline has already expired.
    pub fn remaining(&self) -> Option<Duration> {
        let now_ms = self.counter.current_ms();
        if self.expiry_ms > now_ms {
            Some(Duration::from_millis(self.expiry_ms - now_ms))
        } else {
            None
        }
    }

    /// Returns `true` once now has passed the expiry.
    pub fn is_expired(&self) -> bool {
        self.counter.current_ms() >= self.expiry_ms
    }

    /// The configured timeout in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.expiry_ms - self.started_ms
    }
}

/// Optional deadline for a blocking loop.
#[derive(Debug, Clone, Default)]
pub struct DeadlineContext {
    deadline: Option<Deadline>,
}

impl DeadlineContext {
    /// Creates a context with no deadline.
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// Creates a context from a timeout; `Duration::ZERO` means no deadline.
    pub fn from_timeout(counter: &TickCounter, timeout: Duration) -> Self {
        if timeout.is_zero() {
            Self::new()
        } else {
            Self {
                deadline: Some(Deadline::after(counter, timeout)),
            }
        }
    }

    /// Returns the deadline, if one is set.
    pub fn deadline(&self) -> Option<&Deadline> {
        self.deadline.as_ref()
    }

    /// Returns `true` if a deadline is set and has expired.
    pub fn is_expired(&self) -> bool {
        self.deadline
            .as_ref()
            .map(|d| d.is_expired())
            .unwrap_or(false)
    }

    /// Returns `Err(Timeout)` naming `operation` once the deadline has passed.
    pub fn check(&self, operation: &str) -> Result<(), AmqpError> {
        match &self.deadline {
            Some(deadline) if deadline.is_expired() => {
                Err(AmqpError::timeout(operation, deadline.timeout_ms()))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_expires_with_manual_counter() {
        let counter = TickCounter::manual();
        let deadline = Deadline::after(&counter, Duration::from_millis(100));
        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), Some(Duration::from_millis(100)));

        counter.advance(Duration::from_millis(60));
        assert_eq!(deadline.remaining(), Some(Duration::from_millis(40)));

        counter.advance(Duration::from_millis(40));
        assert!(deadline.is_expired());
        assert!(deadline.remaining().is_none());
    }

    #[test]
    fn test_zero_timeout_means_no_deadline() {
        let counter = TickCounter::manual();
        let ctx = DeadlineContext::from_timeout(&counter, Duration::ZERO);
        assert!(ctx.deadline().is_none());
        counter.advance(Duration::from_secs(3600));
        assert!(!ctx.is_expired());
        assert!(ctx.check("batch").is_ok());
    }

    #[test]
    fn test_check_reports_timeout() {
        let counter = TickCounter::manual();
        let ctx = DeadlineContext::from_timeout(&counter, Duration::from_millis(100));
        assert!(ctx.check("mgmt request").is_ok());

        counter.advance(Duration::from_millis(101));
        match ctx.check("mgmt request") {
            Err(AmqpError::Timeout {
                operation,
                timeout_ms,
            }) => {
                assert_eq!(operation, "mgmt request");
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
