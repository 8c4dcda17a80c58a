// Token bucket shared by every caller that talks to the timetable API.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_RATE: u32 = 50;
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

/// Time source for the limiter and the fetch retry delay.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Holds up to `rate` tokens, refilled continuously at `rate` per `period`.
///
/// Refill is computed lazily on each check. The bucket lock covers both the refill
/// and the debit, and is held while a caller waits, so waiters are served one at a time.
pub struct RateLimiter {
    rate: f64,
    period: Duration,
    clock: Arc<dyn Clock>,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate: u32, period: Duration) -> Self {
        Self::with_clock(rate, period, Arc::new(SystemClock))
    }

    pub fn with_clock(rate: u32, period: Duration, clock: Arc<dyn Clock>) -> Self {
        let rate = f64::from(rate.max(1));
        let last_update = clock.now();
        RateLimiter {
            rate,
            period,
            clock,
            bucket: Mutex::new(Bucket {
                tokens: rate,
                last_update,
            }),
        }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Blocks until a token is available, then debits it.
    pub fn acquire(&self) {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            self.refill(&mut bucket);
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return;
            }
            let missing = 1.0 - bucket.tokens;
            let wait = Duration::from_secs_f64(missing * self.period.as_secs_f64() / self.rate);
            self.clock.sleep(wait.max(Duration::from_millis(1)));
        }
    }

    /// Tokens currently in the bucket, after refilling.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut bucket);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(bucket.last_update);
        let new_tokens = elapsed.as_secs_f64() * self.rate / self.period.as_secs_f64();
        bucket.tokens = (bucket.tokens + new_tokens).min(self.rate);
        bucket.last_update = now;
    }
}
