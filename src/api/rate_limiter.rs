//! Token-bucket rate limiter for outbound registry requests

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

/// Refill window for the configured request budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindow {
    PerSecond,
    PerMinute,
}

impl RateWindow {
    pub fn as_secs_f64(self) -> f64 {
        match self {
            Self::PerSecond => 1.0,
            Self::PerMinute => 60.0,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by every worker of one API client
///
/// The bucket starts full and refills continuously at `capacity / window`
/// tokens per second. All reads and writes of the token count happen under a
/// single async mutex; a blocking acquire sleeps while holding it, so
/// concurrent waiters queue behind one another.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter allowing `capacity` requests per `window`
    ///
    /// A zero capacity is clamped to one so the refill rate stays positive.
    pub fn new(capacity: u32, window: RateWindow) -> Self {
        let capacity = capacity.max(1);
        let refill_rate = f64::from(capacity) / window.as_secs_f64();

        tracing::debug!(
            capacity,
            window = ?window,
            refill_rate,
            "Initialized rate limiter"
        );

        Self {
            capacity,
            refill_rate,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens added per second
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(f64::from(self.capacity));
        bucket.last_refill = now;
    }

    /// Take `n` tokens from the bucket
    ///
    /// Returns immediately when enough tokens are available. Otherwise a
    /// non-blocking call returns `false`, and a blocking call sleeps for the
    /// computed deficit, refills, and deducts without re-checking. Under heavy
    /// contention this can briefly push the bucket below zero; the next
    /// caller then waits for the debt to be repaid.
    pub async fn acquire(&self, n: u32, block: bool) -> bool {
        let n = f64::from(n);
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);

        if bucket.tokens >= n {
            bucket.tokens -= n;
            return true;
        }

        if !block {
            return false;
        }

        let wait = Duration::from_secs_f64((n - bucket.tokens) / self.refill_rate);
        tracing::debug!(
            wait_ms = wait.as_millis() as u64,
            "Rate limit reached, waiting for tokens"
        );
        sleep(wait).await;

        self.refill(&mut bucket);
        bucket.tokens -= n;
        true
    }

    /// Blocking acquire of a single token, used before every network send
    pub async fn acquire_one(&self) {
        self.acquire(1, true).await;
    }

    /// Current token count after refilling
    pub async fn tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens
    }
}
