//! Retry backoff policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff applied before a failed entry becomes claimable again
///
/// The number of attempts is a property of each entry (`max_attempts`); this
/// policy only decides how long a re-queued entry waits. Immediate re-queue
/// under a persistently failing handler would let one owner's retries crowd
/// out everyone else, so the default is exponential with jitter.
///
/// # Example
///
/// ```
/// use docket_scheduler::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
///
/// // Second attempt waits ~1 second, third ~2 seconds, fourth ~4 seconds
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    #[serde(with = "crate::serde_millis")]
    pub initial_interval: Duration,

    /// Upper bound for any delay
    #[serde(with = "crate::serde_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with sensible defaults
    ///
    /// - 1 second initial interval
    /// - 60 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Re-queue without any delay
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Fixed delay between attempts (no backoff)
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay before a given attempt number (1-based)
    ///
    /// The first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self
                .backoff_coefficient
                .powi(retry_num.saturating_sub(1).min(i32::MAX as u32) as i32);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Delay before an entry that just failed its `attempts`-th attempt may
    /// be claimed again
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        self.delay_for_attempt(attempts.saturating_add(1))
    }
}
