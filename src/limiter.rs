//! Rate limiter (C3): token-bucket admission control for sampled traces
//! and sampled spans, per spec.md §4.3.

use crate::clock::Clock;
use std::sync::Mutex;
use std::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with capacity `max_per_second` and refill rate equal to
/// capacity (one second's worth of budget refills every second).
pub struct RateLimiter {
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(max_per_second: f64, clock: &dyn Clock) -> Self {
        RateLimiter {
            capacity: max_per_second,
            bucket: Mutex::new(Bucket {
                tokens: max_per_second,
                last_refill: clock.tick_now(),
            }),
        }
    }

    /// Attempts to take one token. Returns `true` if admitted.
    pub fn allow(&self, clock: &dyn Clock) -> bool {
        let now = clock.tick_now();
        let mut bucket = self.bucket.lock().unwrap();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.capacity).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// The effective rate applied so far, used to populate `_dd.limit_psr`.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn admits_up_to_capacity_then_blocks() {
        let clock = SystemClock;
        let limiter = RateLimiter::new(2.0, &clock);
        assert!(limiter.allow(&clock));
        assert!(limiter.allow(&clock));
        assert!(!limiter.allow(&clock));
    }

    #[test]
    fn refills_over_time() {
        let clock = SystemClock;
        let limiter = RateLimiter::new(10.0, &clock);
        for _ in 0..10 {
            assert!(limiter.allow(&clock));
        }
        assert!(!limiter.allow(&clock));
        sleep(Duration::from_millis(150));
        assert!(limiter.allow(&clock));
    }
}
