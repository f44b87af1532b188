//! Retry delay policies.
//!
//! A policy only answers "how long to wait before retry number `attempt`"
//! (zero-based). The loops that sleep and retry live with their callers,
//! so policies can be swapped and tested without any network code.

use std::time::Duration;

use rand::Rng;

/// Computes the delay before a retry.
pub trait BackoffPolicy: Send + Sync {
    /// Delay to wait before retry number `attempt` (zero-based).
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff: `initial * multiplier^attempt`, optionally capped.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    /// Delay before the first retry
    pub initial: Duration,
    /// Growth factor between successive retries
    pub multiplier: f64,
    /// Upper bound on any single delay
    pub max: Option<Duration>,
}

impl ExponentialBackoff {
    /// Create an uncapped policy.
    pub fn new(initial: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            multiplier,
            max: None,
        }
    }

    /// Cap every delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }
}

impl Default for ExponentialBackoff {
    /// 1s, 2s, 4s, ... with no cap.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0)
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let ceiling = self.max.map(|m| m.as_secs_f64()).unwrap_or(f64::MAX);
        let secs = secs.min(ceiling);

        // Durations past this point are not meaningful and overflow from_secs_f64.
        if !secs.is_finite() || secs > u32::MAX as f64 {
            return self.max.unwrap_or(Duration::from_secs(u32::MAX as u64));
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Full jitter over another policy: a uniform delay in `[0, inner]`.
#[derive(Debug, Clone)]
pub struct Jittered<P> {
    inner: P,
}

impl<P: BackoffPolicy> Jittered<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P: BackoffPolicy> BackoffPolicy for Jittered<P> {
    fn next_delay(&self, attempt: u32) -> Duration {
        let upper = self.inner.next_delay(attempt);
        if upper.is_zero() {
            return upper;
        }
        let millis = rand::thread_rng().gen_range(0..=upper.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles() {
        let policy = ExponentialBackoff::default();

        assert_eq!(policy.next_delay(0), Duration::from_secs(1));
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_exponential_respects_cap() {
        let policy = ExponentialBackoff::default().with_max(Duration::from_secs(5));

        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(5));
        assert_eq!(policy.next_delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_huge_attempt_does_not_panic() {
        let policy = ExponentialBackoff::default();
        let delay = policy.next_delay(u32::MAX);
        assert!(delay >= Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_inner_delay() {
        let policy = Jittered::new(ExponentialBackoff::default().with_max(Duration::from_secs(5)));

        for attempt in 0..10 {
            let upper = ExponentialBackoff::default()
                .with_max(Duration::from_secs(5))
                .next_delay(attempt);
            assert!(policy.next_delay(attempt) <= upper);
        }
    }
}
