//! Retry policy shared by discovery, download, and embedding calls.
//!
//! The policy is a pure function of the retries already performed and the
//! error just observed. The caller owns the mechanism (sleeping,
//! cancellation, re-issuing the request); the policy only answers "wait this
//! long and try again" or "give up".
//!
//! Backoff is exponential: `base × 2^retries`, capped at `max_delay`.
//! Jitter is applied by the caller through [`RetryPolicy::jittered`] with a
//! uniform sample, so the decision itself stays deterministic.
//!
//! ```rust
//! use std::time::Duration;
//! use paper_harvest_core::retry::{RetryClass, RetryDecision, RetryPolicy};
//!
//! struct Flaky;
//! impl RetryClass for Flaky {
//!     fn is_transient(&self) -> bool { true }
//! }
//!
//! let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
//! assert_eq!(policy.decide(0, &Flaky), RetryDecision::RetryAfter(Duration::from_millis(100)));
//! assert_eq!(policy.decide(3, &Flaky), RetryDecision::GiveUp);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Implemented by error types the policy can classify.
pub trait RetryClass {
    /// Whether another attempt could plausibly succeed.
    fn is_transient(&self) -> bool;

    /// Server-provided minimum wait (e.g. `Retry-After`), if any.
    fn retry_after_hint(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` disables retrying.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Decide what to do after a failure, given how many retries have
    /// already been spent.
    pub fn decide<E: RetryClass + ?Sized>(&self, retries_so_far: u32, error: &E) -> RetryDecision {
        if !error.is_transient() || retries_so_far >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        let delay = self.backoff(retries_so_far);
        let delay = match error.retry_after_hint() {
            Some(hint) => delay.max(hint).min(self.max_delay.max(hint)),
            None => delay,
        };
        RetryDecision::RetryAfter(delay)
    }

    /// Un-jittered delay before retry number `retries_so_far + 1`.
    pub fn backoff(&self, retries_so_far: u32) -> Duration {
        let factor = 1u32.checked_shl(retries_so_far.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Apply "equal jitter": half the delay is fixed, the other half scaled
    /// by `sample` (expected in `[0, 1]`). Returns `delay` unchanged when
    /// jitter is disabled.
    pub fn jittered(&self, delay: Duration, sample: f64) -> Duration {
        if !self.jitter {
            return delay;
        }
        let half = delay / 2;
        half + half.mul_f64(sample.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Transient;
    impl RetryClass for Transient {
        fn is_transient(&self) -> bool {
            true
        }
    }

    struct Permanent;
    impl RetryClass for Permanent {
        fn is_transient(&self) -> bool {
            false
        }
    }

    struct Throttled(Duration);
    impl RetryClass for Throttled {
        fn is_transient(&self) -> bool {
            true
        }
        fn retry_after_hint(&self) -> Option<Duration> {
            Some(self.0)
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(3))
    }

    #[test]
    fn exponential_until_cap() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_millis(500));
        assert_eq!(p.backoff(1), Duration::from_millis(1000));
        assert_eq!(p.backoff(2), Duration::from_millis(2000));
        assert_eq!(p.backoff(3), Duration::from_secs(3));
        assert_eq!(p.backoff(40), Duration::from_secs(3));
    }

    #[test]
    fn gives_up_after_max_retries() {
        let p = policy();
        assert!(matches!(p.decide(2, &Transient), RetryDecision::RetryAfter(_)));
        assert_eq!(p.decide(3, &Transient), RetryDecision::GiveUp);
    }

    #[test]
    fn permanent_errors_never_retry() {
        assert_eq!(policy().decide(0, &Permanent), RetryDecision::GiveUp);
    }

    #[test]
    fn zero_retries_disables_retrying() {
        let p = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1));
        assert_eq!(p.decide(0, &Transient), RetryDecision::GiveUp);
    }

    #[test]
    fn retry_after_hint_extends_delay() {
        let p = policy();
        assert_eq!(
            p.decide(0, &Throttled(Duration::from_secs(2))),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
    }

    #[test]
    fn jitter_stays_within_half_and_full() {
        let p = policy().with_jitter(true);
        let d = Duration::from_millis(1000);
        assert_eq!(p.jittered(d, 0.0), Duration::from_millis(500));
        assert_eq!(p.jittered(d, 1.0), Duration::from_millis(1000));
        assert_eq!(policy().jittered(d, 0.0), d);
    }
}
