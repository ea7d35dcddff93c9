//! Fixed-window rate limiting per queue

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimit;

struct Window {
    started: Instant,
    count: u32,
}

/// Admits at most `max` acquisitions per window
///
/// Shared by every worker thread of one job kind. Windows are fixed, not
/// sliding: a burst at the end of one window followed by a burst at the
/// start of the next can admit up to `2 * max` within one window's length.
pub struct RateLimiter {
    limit: RateLimit,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            window: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Report whether a slot is free without taking it
    pub fn check(&self) -> Result<(), Duration> {
        self.check_at(Instant::now())
    }

    /// Take a slot, or report how long until the window resets
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.try_acquire_at(Instant::now())
    }

    fn check_at(&self, now: Instant) -> Result<(), Duration> {
        let mut window = self.window.lock().unwrap();
        self.admit(&mut window, now)
    }

    fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
        let mut window = self.window.lock().unwrap();
        self.admit(&mut window, now)?;
        window.count += 1;
        Ok(())
    }

    fn admit(&self, window: &mut Window, now: Instant) -> Result<(), Duration> {
        let length = self.limit.window();

        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= length {
            window.started = now;
            window.count = 0;
        }

        if window.count < self.limit.max {
            Ok(())
        } else {
            Err(length.saturating_sub(now.saturating_duration_since(window.started)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_admits_max_then_waits() {
        let limiter = RateLimiter::new(RateLimit { max: 2, per_secs: 10 });
        let start = Instant::now();

        assert!(limiter.try_acquire_at(start).is_ok());
        assert!(limiter.try_acquire_at(start).is_ok());
        let wait = limiter
            .try_acquire_at(start + Duration::from_secs(4))
            .unwrap_err();
        assert!(wait <= Duration::from_secs(6));
        assert!(wait > Duration::from_secs(5));
    }

    #[test]
    fn test_check_does_not_consume() {
        let limiter = RateLimiter::new(RateLimit { max: 1, per_secs: 60 });
        let start = Instant::now();

        for _ in 0..5 {
            assert!(limiter.check_at(start).is_ok());
        }
        assert!(limiter.try_acquire_at(start).is_ok());
        assert!(limiter.check_at(start).is_err());
    }

    #[test]
    fn test_window_resets() {
        let limiter = RateLimiter::new(RateLimit { max: 1, per_secs: 1 });
        let start = Instant::now();

        assert!(limiter.try_acquire_at(start).is_ok());
        assert!(limiter.try_acquire_at(start).is_err());
        assert!(limiter.try_acquire_at(start + Duration::from_secs(2)).is_ok());
    }
}
