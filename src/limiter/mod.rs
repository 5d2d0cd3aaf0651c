//! Global token-bucket rate limiter for outbound agent invocations.
//!
//! Admission uses a trailing window: a call may start once fewer than
//! `max_per_interval` calls have started in the last `interval_ms`.
//! Timestamps are purged lazily. The admission lock is held across the
//! capacity wait, which is what makes admission FIFO across concurrent
//! callers — later arrivals queue on the lock in order.
//!
//! The limiter's own retry loop handles only `RateLimited` failures from
//! the wrapped call (a provider saying "slow down"); every other failure
//! passes straight through so the engine's per-step retry policy stays in
//! charge of attempt counting.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::engine::backoff::backoff_with_jitter;
use crate::error::{ErrorKind, SwarmError};

/// Observer for limiter retry waits; the wiring points this at the
/// progress bus to emit `rate_limited_retry {attempt, waitMs}`.
pub type RetryHook = Arc<dyn Fn(u32, u64) + Send + Sync>;

pub struct RateLimiter {
    max_per_interval: usize,
    interval: Duration,
    max_retries: u32,
    base_delay_ms: u64,
    /// Start timestamps within the trailing window. The lock doubles as
    /// the FIFO admission queue.
    window: Mutex<VecDeque<Instant>>,
    retry_hook: OnceCell<RetryHook>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_per_interval: config.max_per_interval.max(1) as usize,
            interval: Duration::from_millis(config.interval_ms.max(1)),
            max_retries,
            base_delay_ms,
            window: Mutex::new(VecDeque::new()),
            retry_hook: OnceCell::new(),
        }
    }

    /// Install the retry observer. Later calls are ignored.
    pub fn set_retry_hook(&self, hook: RetryHook) {
        let _ = self.retry_hook.set(hook);
    }

    /// Block until a token is available, FIFO across callers.
    ///
    /// Cancellation during the wait returns `Cancelled` without consuming
    /// a token.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), SwarmError> {
        let mut window = tokio::select! {
            guard = self.window.lock() => guard,
            _ = cancel.cancelled() => {
                return Err(SwarmError::cancelled("cancelled while queued for rate limiter"));
            }
        };
        loop {
            let now = Instant::now();
            while window
                .front()
                .is_some_and(|t| now.duration_since(*t) >= self.interval)
            {
                window.pop_front();
            }
            if window.len() < self.max_per_interval {
                window.push_back(Instant::now());
                return Ok(());
            }
            // Window full: the oldest entry decides how long until a slot
            // frees. Sleeping with the lock held keeps admission FIFO.
            let oldest = *window.front().expect("window non-empty when full");
            let wait = self.interval.saturating_sub(now.duration_since(oldest));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {
                    return Err(SwarmError::cancelled("cancelled while waiting for rate limiter"));
                }
            }
        }
    }

    /// Run `f` under the rate limit.
    ///
    /// `RateLimited` failures are retried up to `max_retries` times with
    /// `base_delay_ms * 2^attempt + jitter`; the final such failure is
    /// returned as-is. Any other outcome passes through on the first try.
    pub async fn execute<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T, SwarmError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, SwarmError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.acquire(cancel).await?;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.kind == ErrorKind::RateLimited && attempt < self.max_retries => {
                    let wait = backoff_with_jitter(self.base_delay_ms, attempt, attempt as u64);
                    attempt += 1;
                    debug!(attempt, wait_ms = wait.as_millis() as u64, "rate limited — backing off");
                    if let Some(hook) = self.retry_hook.get() {
                        hook(attempt, wait.as_millis() as u64);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => {
                            return Err(SwarmError::cancelled("cancelled during rate-limit backoff"));
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Calls started within the current trailing window.
    pub async fn in_flight_window(&self) -> usize {
        let mut window = self.window.lock().await;
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.interval)
        {
            window.pop_front();
        }
        window.len()
    }
}

/// Thread-safe shared limiter.
pub type SharedLimiter = Arc<RateLimiter>;
