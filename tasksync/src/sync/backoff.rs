//! Retry delays for replaying pending changes.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter: `base * 2^n`, capped at `max`, plus up
/// to half of that again at random (still capped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// Creates a policy. `max` is raised to `base` if smaller.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay to wait after the `retry`-th failure (0-based).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = self.exponential(retry);
        let spread = u64::try_from(exp.as_millis()).unwrap_or(u64::MAX) / 2;
        let jitter = if spread == 0 {
            0
        } else {
            rand::rng().random_range(0..=spread)
        };
        exp.saturating_add(Duration::from_millis(jitter))
            .min(self.max)
    }

    /// The un-jittered delay for the `retry`-th failure.
    #[must_use]
    pub fn exponential(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(5))
    }
}
