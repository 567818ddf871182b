//! Sliding-window rate limiter.
//!
//! Tracks request timestamps inside a fixed window. `wait_for_slot` sleeps
//! the exact remaining delta with the internal lock released, so a waiting
//! caller never stalls other users of the limiter. Callers must not hold any
//! other lock across the wait.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    timestamps: Mutex<Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            timestamps: Mutex::new(Vec::with_capacity(max_requests)),
        }
    }

    /// Block until a slot is available, then record the request.
    pub fn wait_for_slot(&self) {
        loop {
            let wait = {
                let mut timestamps = self.timestamps.lock();
                let now = Instant::now();
                Self::clean_old_timestamps(&mut timestamps, now, self.window);

                if timestamps.len() < self.max_requests {
                    timestamps.push(now);
                    return;
                }

                // Oldest entry leaves the window first.
                (timestamps[0] + self.window).saturating_duration_since(now)
            };

            if wait.is_zero() {
                continue;
            }
            std::thread::sleep(wait);
        }
    }

    /// Non-blocking variant: record and return `true` if a slot is free.
    pub fn try_acquire(&self) -> bool {
        let mut timestamps = self.timestamps.lock();
        let now = Instant::now();
        Self::clean_old_timestamps(&mut timestamps, now, self.window);

        if timestamps.len() < self.max_requests {
            timestamps.push(now);
            return true;
        }
        false
    }

    /// Remaining slots in the current window.
    pub fn available(&self) -> usize {
        let mut timestamps = self.timestamps.lock();
        Self::clean_old_timestamps(&mut timestamps, Instant::now(), self.window);
        self.max_requests - timestamps.len()
    }

    /// Drop timestamps older than `now - window`; survivors all lie within
    /// `(now - window, now]`.
    fn clean_old_timestamps(timestamps: &mut Vec<Instant>, now: Instant, window: Duration) {
        let cutoff = now.checked_sub(window);
        match cutoff {
            Some(cutoff) => timestamps.retain(|ts| *ts > cutoff),
            // Process younger than the window: nothing can be stale.
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_respects_capacity() {
        let limiter = RateLimiter::new(9, Duration::from_secs(60));
        for i in 0..9 {
            assert!(limiter.try_acquire(), "slot {i} should be free");
        }
        assert!(!limiter.try_acquire(), "10th acquire must fail");
    }

    #[test]
    fn available_decreases_monotonically() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        let mut previous = limiter.available();
        assert_eq!(previous, 5);
        for _ in 0..5 {
            limiter.try_acquire();
            let now = limiter.available();
            assert!(now < previous);
            previous = now;
        }
        assert_eq!(limiter.available(), 0);
    }

    #[test]
    fn window_expiry_frees_slots() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        std::thread::sleep(Duration::from_millis(70));
        assert_eq!(limiter.available(), 2);
        assert!(limiter.try_acquire());
    }

    #[test]
    fn wait_for_slot_sleeps_the_delta() {
        let limiter = RateLimiter::new(1, Duration::from_millis(80));
        limiter.wait_for_slot();

        let start = Instant::now();
        limiter.wait_for_slot();
        let waited = start.elapsed();
        assert!(
            waited >= Duration::from_millis(40),
            "expected a real wait, got {waited:?}"
        );
        assert!(
            waited < Duration::from_millis(500),
            "wait should be bounded, got {waited:?}"
        );
    }
}
