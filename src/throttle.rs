//! Request pacing.
//!
//! Two shapes of politeness are needed: metadata APIs ask for a fixed gap
//! between consecutive requests ([`MinIntervalThrottle`]), while artifact
//! downloads are budgeted as a sustained rate with a small burst
//! ([`TokenBucket`]). Both hold an async mutex across the wait, so waiters are
//! served one at a time in arrival order.
//!
//! Both are built on `tokio::time`, so tests can run them on a paused clock.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Sleep for `delay` unless `cancel` fires first. Returns `false` when
/// cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Enforces a minimum gap between the starts of consecutive requests.
#[derive(Debug)]
pub struct MinIntervalThrottle {
    interval: Duration,
    next_allowed: Mutex<Option<Instant>>,
}

impl MinIntervalThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_allowed: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until a request may start.
    pub async fn acquire(&self) {
        let mut next = self.next_allowed.lock().await;
        if let Some(at) = *next {
            tokio::time::sleep_until(at).await;
        }
        *next = Some(Instant::now() + self.interval);
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Classic token bucket: `rate` tokens per second, at most `burst` stored.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            rate: rate_per_second.max(f64::MIN_POSITIVE),
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for the refill if the bucket is empty.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return;
        }

        let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate);
        tokio::time::sleep(wait).await;
        bucket.tokens = 0.0;
        bucket.last_refill = Instant::now();
    }
}
