//! Retry classes and their backoff schedules.
//!
//! Three policies exist, each tied to one [`RetryClass`]:
//!
//! | class    | attempts  | wait before retry n        |
//! |----------|-----------|----------------------------|
//! | throttle | 7         | base * 2^(n-1), unbounded  |
//! | pending  | unlimited | base * 2^(n-1), optional cap |
//! | storage  | 3         | base * 2^(n-1), capped 10s |
//!
//! No jitter is applied so schedules stay deterministic under test.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result, RetryClass};

/// Exponential backoff schedule for one retry class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    class: RetryClass,
    /// Total attempts including the first; `None` retries forever.
    max_attempts: Option<u32>,
    base: Duration,
    max_delay: Option<Duration>,
}

impl RetryPolicy {
    pub const fn new(
        class: RetryClass,
        max_attempts: Option<u32>,
        base: Duration,
        max_delay: Option<Duration>,
    ) -> Self {
        Self {
            class,
            max_attempts,
            base,
            max_delay,
        }
    }

    /// Backend rate limiting: 7 attempts, 1s doubling, no ceiling.
    pub const fn throttling() -> Self {
        Self::new(
            RetryClass::Throttle,
            Some(7),
            Duration::from_millis(1000),
            None,
        )
    }

    /// Still-pending invocations: no attempt cap, 1s doubling, no ceiling.
    pub const fn pending() -> Self {
        Self::new(RetryClass::Pending, None, Duration::from_millis(1000), None)
    }

    /// Transient store faults: 3 attempts, 1s doubling, capped at 10s.
    pub const fn storage() -> Self {
        Self::new(
            RetryClass::Storage,
            Some(3),
            Duration::from_millis(1000),
            Some(Duration::from_secs(10)),
        )
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn class(&self) -> RetryClass {
        self.class
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let delay = self.base.saturating_mul(1u32 << exp);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_another(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }

    /// Does this policy retry `err`?
    pub fn should_retry(&self, err: &Error) -> bool {
        err.retry_class() == self.class
    }

    /// Run `op` until it succeeds, fails with an error outside this policy's
    /// class, or the attempt budget is spent. Exhausted throttles surface as a
    /// plain backend error.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if self.should_retry(&err) => {
                    if !self.allows_another(attempts) {
                        warn!(label, attempts, error = %err, "retries exhausted");
                        return Err(err.into_exhausted());
                    }
                    let wait = self.delay_for(attempts);
                    warn!(label, attempts, wait_ms = wait.as_millis() as u64, error = %err, "retrying");
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
