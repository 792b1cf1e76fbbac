//! Retry policy with a shared, resettable budget
//!
//! A [`RetryBudget`] is drawn down by every retry made while one page is
//! being produced, however deeply the requests for that page are nested.
//! The run-loop refills it after each page, so the budget bounds transient
//! failures per page without capping retries over a long harvest.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Predicate selecting the errors a call may retry
pub type RetryOn = fn(&Error) -> bool;

/// Remaining retries for the page currently being produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    remaining: usize,
    capacity: usize,
}

impl RetryBudget {
    /// Create a full budget
    pub fn new(capacity: usize) -> Self {
        Self {
            remaining: capacity,
            capacity,
        }
    }

    /// Retries still available
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Size of a full budget
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True once no retry is left and the next attempt is the final one
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Refill the budget
    pub fn reset(&mut self) {
        self.remaining = self.capacity;
    }

    fn used(&self) -> usize {
        self.capacity - self.remaining
    }

    fn consume(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }
}

/// Backoff schedule applied against a [`RetryBudget`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    /// Create a policy from an ordered backoff schedule
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Backoff schedule
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// A full budget sized to the schedule
    pub fn budget(&self) -> RetryBudget {
        RetryBudget::new(self.delays.len())
    }

    /// Delay the next retry will sleep for
    pub fn next_delay(&self, budget: &RetryBudget) -> Duration {
        self.delays.get(budget.used()).copied().unwrap_or_default()
    }

    /// Decide what to do with a failed attempt
    ///
    /// Returns `Ok(())` after sleeping when the caller should try again,
    /// or gives the error back when it is not retryable or the budget is
    /// spent.
    pub async fn recover(
        &self,
        budget: &mut RetryBudget,
        operation: &str,
        target: &str,
        err: Error,
        retry_on: RetryOn,
    ) -> Result<()> {
        if !retry_on(&err) {
            debug!(operation, target, error = %err, "Not retrying");
            return Err(err);
        }
        if budget.is_exhausted() {
            return Err(err);
        }

        let delay = self.next_delay(budget);
        warn!(
            operation,
            target,
            error = %err,
            retries_left = budget.remaining(),
            "Request failed, retrying in {:?}",
            delay
        );
        tokio::time::sleep(delay).await;
        budget.consume();
        Ok(())
    }

    /// Run `op` until it succeeds, fails terminally or the budget is spent
    ///
    /// Once the budget is empty one last attempt is made and its outcome is
    /// returned as is.
    pub async fn run<T, F, Fut>(
        &self,
        budget: &mut RetryBudget,
        operation: &str,
        target: &str,
        retry_on: RetryOn,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    self.recover(budget, operation, target, err, retry_on)
                        .await?;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(5),
            Duration::from_secs(30),
            Duration::from_secs(120),
        ])
    }
}

#[cfg(test)]
mod retry_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(vec![
            Duration::from_secs(1),
            Duration::from_secs(10),
            Duration::from_secs(100),
        ])
    }

    #[test]
    fn test_budget_reset() {
        let mut budget = RetryBudget::new(3);
        budget.consume();
        budget.consume();
        assert_eq!(budget.remaining(), 1);
        budget.reset();
        assert_eq!(budget.remaining(), 3);
        assert_eq!(budget.capacity(), 3);
    }

    #[test]
    fn test_delays_consumed_front_to_back() {
        let policy = policy();
        let mut budget = policy.budget();
        assert_eq!(policy.next_delay(&budget), Duration::from_secs(1));
        budget.consume();
        assert_eq!(policy.next_delay(&budget), Duration::from_secs(10));
        budget.consume();
        assert_eq!(policy.next_delay(&budget), Duration::from_secs(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policy = policy();
        let mut budget = policy.budget();
        let calls = AtomicUsize::new(0);
        let start = Instant::now();

        let result = policy
            .run(&mut budget, "get", "http://x", Error::is_transient, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::status(500, "boom"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(budget.remaining(), 1);
        assert!(start.elapsed() >= Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_unguarded_attempt() {
        let policy = policy();
        let mut budget = policy.budget();
        let calls = AtomicUsize::new(0);

        let result: Result<()> = policy
            .run(&mut budget, "get", "http://x", Error::is_transient, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::status(502, "bad gateway"))
            })
            .await;

        assert!(matches!(result, Err(Error::InvalidStatus { status: 502, .. })));
        // three retries plus the last attempt
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(budget.is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_immediately() {
        let policy = policy();
        let mut budget = policy.budget();
        let calls = AtomicUsize::new(0);

        let result: Result<()> = policy
            .run(&mut budget, "get", "http://x", Error::is_transient, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::status(403, ""))
            })
            .await;

        assert!(matches!(result, Err(Error::NonRetryableStatus { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(budget.remaining(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_shared_between_calls() {
        let policy = policy();
        let mut budget = policy.budget();
        let calls = AtomicUsize::new(0);

        let flaky = || async {
            if calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                Err(Error::Timeout { timeout_ms: 10 })
            } else {
                Ok(())
            }
        };

        policy
            .run(&mut budget, "first", "a", Error::is_transient, flaky)
            .await
            .unwrap();
        policy
            .run(&mut budget, "second", "b", Error::is_transient, flaky)
            .await
            .unwrap();

        assert_eq!(budget.remaining(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_schedule_single_attempt() {
        let policy = RetryPolicy::new(Vec::new());
        let mut budget = policy.budget();
        let calls = AtomicUsize::new(0);

        let result: Result<()> = policy
            .run(&mut budget, "get", "x", Error::is_transient, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Timeout { timeout_ms: 1 })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
