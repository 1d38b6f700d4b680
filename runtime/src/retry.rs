//! Retry policy for optimistic transactions.
//!
//! A lost compare-and-swap race is retried after a jittered exponential
//! backoff. The number of attempts is bounded unless the policy is explicitly
//! built as unbounded.
//!
//! # Example
//!
//! ```rust
//! use prepaid_usage_runtime::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new()
//!     .with_max_attempts(10)
//!     .with_initial_delay(Duration::from_millis(2))
//!     .with_max_delay(Duration::from_millis(100));
//!
//! assert!(policy.should_retry(9));
//! assert!(!policy.should_retry(10));
//! assert!(policy.delay_for_attempt(20) <= Duration::from_millis(100));
//! ```

use rand::Rng;
use std::time::Duration;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 50 (including the first attempt)
/// - `initial_delay`: 5ms
/// - `max_delay`: 500ms
/// - `backoff_multiplier`: 2.0 (delay doubles each retry)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, `None` for no bound
    max_attempts: Option<u32>,

    /// Delay before the first retry
    initial_delay: Duration,

    /// Maximum delay between retries (caps exponential backoff)
    max_delay: Duration,

    /// Multiplier for exponential backoff
    backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Create a retry policy with default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_attempts: Some(50),
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        }
    }

    /// A policy that retries until the transaction applies or fails
    /// with a non-retryable error.
    ///
    /// Under sustained contention on one channel a caller can wait
    /// indefinitely.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self::new().with_unbounded_attempts()
    }

    /// A policy that never waits between attempts.
    #[must_use]
    pub const fn immediate() -> Self {
        Self::new()
            .with_initial_delay(Duration::ZERO)
            .with_max_delay(Duration::ZERO)
    }

    /// Set the maximum number of attempts (including the first one).
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Remove the bound on attempts.
    #[must_use]
    pub const fn with_unbounded_attempts(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay between retries.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub const fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Maximum number of attempts, `None` when unbounded.
    #[must_use]
    pub const fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Whether another attempt may follow `attempts_made` failed ones.
    #[must_use]
    pub const fn should_retry(&self, attempts_made: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts_made < max,
            None => true,
        }
    }

    /// Calculate the delay after failed attempt number `attempt` (0-indexed).
    ///
    /// Uses exponential backoff with jitter:
    /// `delay = min(initial_delay * multiplier^attempt, max_delay) * random(0.5..=1.0)`
    ///
    /// Jitter keeps contending callers from retrying in lockstep.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped_secs = base_secs.min(self.max_delay.as_secs_f64());
        if capped_secs <= 0.0 || !capped_secs.is_finite() {
            return Duration::ZERO;
        }

        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_secs_f64(capped_secs * jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}
