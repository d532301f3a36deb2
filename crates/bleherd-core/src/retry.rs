//! Retry policies for connect attempts.
//!
//! [`RetryPolicy`] describes how many attempts are allowed and how long to
//! wait between them. [`Backoff`] tracks one run of attempts against a policy
//! and is the only place that decides what the current delay is. Neither
//! type sleeps, so both are testable without time.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use bleherd_core::{Backoff, RetryPolicy};
//!
//! let mut backoff = Backoff::new(RetryPolicy::actuation());
//! assert_eq!(backoff.record_failure(), Some(Duration::from_secs(2)));
//! assert_eq!(backoff.record_failure(), Some(Duration::from_secs(2)));
//! assert_eq!(backoff.record_failure(), None);
//! assert_eq!(backoff.attempts(), 3);
//! ```

use std::time::Duration;

use crate::error::{Error, Result};

/// Delay between passive reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connect attempts allowed for one actuation.
pub const DEFAULT_ACTUATION_ATTEMPTS: u32 = 3;

/// Delay between actuation connect attempts.
pub const DEFAULT_ACTUATION_BACKOFF: Duration = Duration::from_secs(2);

/// How often and how patiently to retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (None = unlimited).
    pub max_attempts: Option<u32>,
    /// Delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Unlimited attempts, fixed delay. Used for passive reconnection.
    pub fn passive(delay: Duration) -> Self {
        Self::fixed_delay(delay)
    }

    /// Bounded attempts with a fixed delay. Used for actuation.
    pub fn actuation() -> Self {
        Self::fixed_delay(DEFAULT_ACTUATION_BACKOFF).max_attempts(DEFAULT_ACTUATION_ATTEMPTS)
    }

    /// Unlimited attempts spaced by `delay`.
    pub fn fixed_delay(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            delay,
        }
    }

    /// Set maximum number of attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Validate the policy and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == Some(0) {
            return Err(Error::invalid_config("max_attempts must be > 0"));
        }
        Ok(())
    }
}

/// One run of attempts against a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl Backoff {
    /// Start a fresh run.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Record a failed attempt.
    ///
    /// Returns the delay to wait before the next attempt, or `None` once the
    /// policy's attempt limit has been reached.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.is_exhausted() {
            return None;
        }
        Some(self.policy.delay)
    }

    /// Failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether no further attempt is allowed.
    pub fn is_exhausted(&self) -> bool {
        self.policy
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
    }

    /// Forget past failures.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passive_policy_never_exhausts() {
        let mut backoff = Backoff::new(RetryPolicy::passive(DEFAULT_RECONNECT_DELAY));
        for _ in 0..1000 {
            assert_eq!(backoff.record_failure(), Some(Duration::from_secs(5)));
        }
        assert_eq!(backoff.attempts(), 1000);
        assert!(!backoff.is_exhausted());
    }

    #[test]
    fn test_actuation_policy_exhausts_after_max_attempts() {
        let mut backoff = Backoff::new(RetryPolicy::actuation());
        assert!(backoff.record_failure().is_some());
        assert!(backoff.record_failure().is_some());
        assert!(!backoff.is_exhausted());
        assert_eq!(backoff.record_failure(), None);
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(RetryPolicy::fixed_delay(Duration::from_secs(1)).max_attempts(1));
        assert_eq!(backoff.record_failure(), None);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(!backoff.is_exhausted());
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::actuation().validate().is_ok());
        assert!(RetryPolicy::passive(Duration::from_secs(5)).validate().is_ok());
        assert!(
            RetryPolicy::fixed_delay(Duration::from_secs(1))
                .max_attempts(0)
                .validate()
                .is_err()
        );
    }
}
