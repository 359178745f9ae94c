// =============================================================================
// Token bucket — paces all outbound exchange calls
// =============================================================================
//
// The exchange allows roughly 10 requests per second per API key group. Every
// gateway call acquires one token before sending; when the bucket is empty
// the caller sleeps until the next refill instead of burning a 429.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Default sustained request rate (tokens per second).
pub const DEFAULT_RATE: f64 = 10.0;
/// Default burst capacity.
pub const DEFAULT_CAPACITY: f64 = 10.0;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available. Returns the wait duration until a token
    /// frees up when the bucket is empty.
    fn try_take(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();

        // Refill based on elapsed wall time.
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    /// Acquire one token, sleeping as needed. Never fails; the wait is
    /// bounded by `1 / refill_per_sec` per missing token.
    pub async fn acquire(&self) {
        loop {
            match self.try_take() {
                Ok(()) => return,
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "rate limit: waiting for token");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Tokens currently available (refilled view). Test and dashboard helper.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();
        state.tokens
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_RATE)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full_and_drains() {
        let bucket = TokenBucket::new(3.0, 1.0);
        assert!(bucket.try_take().is_ok());
        assert!(bucket.try_take().is_ok());
        assert!(bucket.try_take().is_ok());
        // Fourth take must report a wait.
        match bucket.try_take() {
            Err(wait) => assert!(wait.as_secs_f64() > 0.0),
            Ok(()) => panic!("bucket should be empty"),
        }
    }

    #[test]
    fn refills_over_time() {
        let bucket = TokenBucket::new(1.0, 100.0); // fast refill for the test
        assert!(bucket.try_take().is_ok());
        assert!(bucket.try_take().is_err());
        std::thread::sleep(Duration::from_millis(30));
        assert!(bucket.try_take().is_ok());
    }

    #[test]
    fn never_exceeds_capacity() {
        let bucket = TokenBucket::new(2.0, 1000.0);
        std::thread::sleep(Duration::from_millis(20));
        assert!(bucket.available() <= 2.0);
    }

    #[tokio::test]
    async fn acquire_waits_then_succeeds() {
        let bucket = TokenBucket::new(1.0, 50.0);
        bucket.acquire().await;
        let start = Instant::now();
        bucket.acquire().await; // must wait ~20 ms for refill
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
