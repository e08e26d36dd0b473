//! Retry policy with exponential backoff and jitter
//!
//! Applied per candidate inside the dispatch loop. After the policy's
//! attempts are exhausted the router advances to the next candidate in the
//! fallback chain.

use rand::Rng;
use std::time::Duration;

use crate::error::RouterError;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fractional jitter applied symmetrically, e.g. 0.2 for ±20%
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.2,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given retry attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        let spread = raw * self.jitter;
        let jittered = if spread > 0.0 {
            rand::thread_rng().gen_range(raw - spread..=raw + spread)
        } else {
            raw
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Whether another attempt is permitted for this error
    pub fn should_retry(&self, err: &RouterError, attempt: u32) -> bool {
        attempt < self.max_attempts && err.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_growth_and_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        // Far enough out the cap binds
        assert_eq!(policy.delay_for(12), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.delay_for(1).as_millis() as f64;
            assert!((400.0..=600.0).contains(&d), "delay {} outside ±20%", d);
        }
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::default();
        let transient = RouterError::UpstreamTransient("reset".into());
        assert!(policy.should_retry(&transient, 1));
        assert!(policy.should_retry(&transient, 2));
        assert!(!policy.should_retry(&transient, 3));
        let permanent = RouterError::UpstreamPermanent("422".into());
        assert!(!policy.should_retry(&permanent, 1));
    }
}
