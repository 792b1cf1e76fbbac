//! Rate limiting implementation
//!
//! Spaces requests by the time the previous one *finished*, not by when it
//! started. A failed request still counts: the permit records its finish
//! time when dropped, on every exit path.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Minimum-spacing rate limiter for one harvester instance
#[derive(Debug)]
pub struct RateLimiter {
    delay: Duration,
    last_finish: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Create a new rate limiter with the given spacing
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_finish: Mutex::new(None),
        }
    }

    /// Configured spacing between requests
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait until a request may start
    ///
    /// Hold the returned permit for as long as the request runs.
    pub async fn acquire(&self) -> RequestPermit<'_> {
        let last = *self
            .last_finish
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(last) = last {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                let wait = self.delay - elapsed;
                trace!("Rate limiter waiting {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }

        RequestPermit { limiter: self }
    }

    fn mark_finished(&self) {
        *self
            .last_finish
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }
}

/// Guard for one in-flight request
///
/// Dropping it records the request's finish time.
#[derive(Debug)]
pub struct RequestPermit<'a> {
    limiter: &'a RateLimiter,
}

impl Drop for RequestPermit<'_> {
    fn drop(&mut self) {
        self.limiter.mark_finished();
    }
}

#[cfg(test)]
mod rate_limit_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_request_is_immediate() {
        let limiter = RateLimiter::new(Duration::from_secs(2));
        let start = Instant::now();
        let _permit = limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_counts_from_finish() {
        let limiter = RateLimiter::new(Duration::from_secs(2));

        let permit = limiter.acquire().await;
        // request takes a while
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(permit);

        let finished = Instant::now();
        let _permit = limiter.acquire().await;
        assert!(finished.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_wait_after_idle() {
        let limiter = RateLimiter::new(Duration::from_secs(3));
        drop(limiter.acquire().await);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let before = Instant::now();
        drop(limiter.acquire().await);
        let waited = before.elapsed();
        assert!(waited >= Duration::from_secs(2));
        assert!(waited < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_request_still_spaces() {
        async fn failing(limiter: &RateLimiter) -> Result<(), &'static str> {
            let _permit = limiter.acquire().await;
            Err("connection reset")
        }

        let limiter = RateLimiter::new(Duration::from_secs(1));
        assert!(failing(&limiter).await.is_err());

        let before = Instant::now();
        let _permit = limiter.acquire().await;
        assert!(before.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_never_waits() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let start = Instant::now();
        for _ in 0..5 {
            drop(limiter.acquire().await);
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
