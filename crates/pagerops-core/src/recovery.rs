//! Backoff and jitter for the refresh scheduler.
//!
//! ## Features
//!
//! - **Exponential backoff**: the wait doubles with each consecutive failure
//! - **Ceiling**: the wait never exceeds the configured maximum
//! - **Jitter**: poll intervals are randomized to avoid a thundering herd
//!
//! ## Example
//!
//! ```
//! use pagerops_core::recovery::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy {
//!     initial_delay: Duration::from_secs(1),
//!     max_delay: Duration::from_secs(60),
//!     multiplier: 2.0,
//! };
//!
//! assert_eq!(policy.delay_for_failure(1), Duration::from_secs(1));
//! assert_eq!(policy.delay_for_failure(3), Duration::from_secs(4));
//! assert_eq!(policy.delay_for_failure(20), Duration::from_secs(60));
//! ```

use std::time::Duration;

use rand::Rng;

/// Exponential backoff applied after consecutive failures.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay (caps exponential growth).
    pub max_delay: Duration,
    /// Multiplier per additional failure (2.0 doubles each time).
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after `failures` consecutive failures (1-based).
    ///
    /// Zero failures means no backoff.
    pub fn delay_for_failure(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(63) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Like [`delay_for_failure`](Self::delay_for_failure) but never shorter
    /// than a provider-requested `retry-after`.
    pub fn delay_with_retry_after(&self, failures: u32, retry_after_secs: Option<u64>) -> Duration {
        let delay = self.delay_for_failure(failures);
        match retry_after_secs {
            Some(secs) => delay.max(Duration::from_secs(secs)),
            None => delay,
        }
    }
}

/// Randomize `base` by up to `ratio` in either direction.
///
/// A ratio of zero (or a zero base) returns `base` unchanged.
pub fn jittered(base: Duration, ratio: f64) -> Duration {
    let base_secs = base.as_secs_f64();
    let range = base_secs * ratio.clamp(0.0, 1.0);
    if range <= 0.0 {
        return base;
    }
    let mut rng = rand::rng();
    let offset = rng.random_range(-range..range);
    Duration::from_secs_f64((base_secs + offset).max(0.0))
}
