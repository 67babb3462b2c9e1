//! Global delivery rate limit
//!
//! A fixed-window token bucket: `max_per_window` tokens become available at
//! the start of each window and are not carried over.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    tokens: u32,
    window_start: Instant,
}

impl RateLimiter {
    /// `max_per_window == 0` disables limiting.
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            tokens: max_per_window,
            window_start: Instant::now(),
        }
    }

    pub fn per_minute(max: u32) -> Self {
        Self::new(max, Duration::from_secs(60))
    }

    pub fn unlimited() -> Self {
        Self::new(0, Duration::from_secs(60))
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_per_window == 0
    }

    /// Take a token, or return how long until the next refill.
    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), Duration> {
        if self.is_unlimited() {
            return Ok(());
        }

        self.refill(now);

        if self.tokens > 0 {
            self.tokens -= 1;
            Ok(())
        } else {
            Err((self.window_start + self.window).saturating_duration_since(now))
        }
    }

    /// Tokens left in the current window.
    pub fn available(&mut self) -> u32 {
        self.refill(Instant::now());
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) >= self.window {
            self.tokens = self.max_per_window;
            self.window_start = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_allows_exactly_max() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(1));

        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        let wait = limiter.try_acquire().unwrap_err();
        assert_eq!(wait, Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(limiter.try_acquire().unwrap_err(), Duration::from_millis(600));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiter.try_acquire().is_ok());
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_do_not_accumulate() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.available(), 3);
    }

    #[test]
    fn test_unlimited() {
        let mut limiter = RateLimiter::unlimited();
        for _ in 0..10_000 {
            assert!(limiter.try_acquire().is_ok());
        }
    }
}
