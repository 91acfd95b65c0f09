//! Backoff: capped retry delays for transient failures
//!
//! Every retrying unit owns a [`Backoff`] counter built from a shared
//! [`BackoffPolicy`]. Chunk retries use a linear scale-up (a stalled
//! connection usually recovers within seconds), URL acquisition uses an
//! exponential one (the backend is asking us to go away).
//!
//! # Example
//!
//! ```
//! use cumulus_core_resilience::backoff::{Backoff, BackoffPolicy};
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::exponential(
//!     Duration::from_millis(100),
//!     Duration::from_secs(1),
//!     2.0,
//! );
//! let mut backoff = Backoff::new(policy);
//!
//! assert_eq!(backoff.next_delay(), Duration::from_millis(100));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(200));
//! assert_eq!(backoff.attempts(), 2);
//!
//! backoff.reset();
//! assert_eq!(backoff.attempts(), 0);
//! ```

use std::time::Duration;

/// Shape of the delay curve
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    /// `initial * attempt`
    Linear,
    /// `initial * factor^(attempt - 1)`
    Exponential { factor: f64 },
}

/// Delay policy shared by all units of one kind
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// How the delay grows between attempts
    pub strategy: BackoffStrategy,
}

impl BackoffPolicy {
    /// Linear scale-up capped at `max_delay`
    pub fn linear(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    /// Exponential growth capped at `max_delay`
    pub fn exponential(initial_delay: Duration, max_delay: Duration, factor: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential { factor },
        }
    }

    /// Delay for the given 1-based attempt number. Attempt 0 means "no
    /// failure yet" and maps to zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Linear => self.initial_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential { factor } => {
                let exponent = attempt.saturating_sub(1).min(1024) as i32;
                let scale = factor.max(1.0).powi(exponent);
                let millis = self.initial_delay.as_millis() as f64 * scale;
                if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
                    self.max_delay
                } else {
                    Duration::from_millis(millis as u64)
                }
            }
        };

        delay.min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::linear(Duration::from_secs(1), Duration::from_secs(15))
    }
}

/// Attempt counter for one retrying unit
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
}

impl Backoff {
    /// Create a counter with zero recorded failures
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Record a failure and return how long to wait before the next try
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.policy.delay_for(self.attempts)
    }

    /// Delay the next failure would produce, without recording it
    pub fn peek_delay(&self) -> Duration {
        self.policy.delay_for(self.attempts.saturating_add(1))
    }

    /// Number of failures recorded since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget all failures (called after a success)
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// The policy this counter follows
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_scale_up_is_capped() {
        let policy = BackoffPolicy::linear(Duration::from_millis(500), Duration::from_secs(2));

        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1500));
        assert_eq!(policy.delay_for(4), Duration::from_secs(2));
        assert_eq!(policy.delay_for(40), Duration::from_secs(2));
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy =
            BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(300), 2.0);

        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(5), Duration::from_secs(16));
        assert_eq!(policy.delay_for(10), Duration::from_secs(300));
        // Huge attempt counts must not overflow
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_factor_below_one_does_not_shrink() {
        let policy =
            BackoffPolicy::exponential(Duration::from_secs(2), Duration::from_secs(10), 0.5);
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
    }

    #[test]
    fn test_counter_and_reset() {
        let mut backoff = Backoff::new(BackoffPolicy::default());

        assert_eq!(backoff.peek_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
