//! Per-provider request rate limiting.
//!
//! One `RateLimiter` instance is shared by every conversation that talks to
//! the same provider during a run. Limiters for different providers are
//! independent and never affect each other's budgets.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter keyed by provider identity.
///
/// `acquire` suspends the caller until a token is available. Waiters queue
/// on the internal async mutex, which tokio serves in FIFO order, so
/// acquisition is fair: burst load cannot starve already-queued work.
pub struct RateLimiter {
    provider: String,
    tokens_per_second: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(provider: impl Into<String>, requests_per_minute: u32) -> Self {
        Self::with_burst(provider, requests_per_minute, 1)
    }

    pub fn with_burst(provider: impl Into<String>, requests_per_minute: u32, burst: u32) -> Self {
        let rpm = requests_per_minute.max(1);
        Self {
            provider: provider.into(),
            tokens_per_second: rpm as f64 / 60.0,
            burst: burst.max(1) as f64,
            bucket: Mutex::new(Bucket {
                tokens: burst.max(1) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Take one token, suspending until the bucket can supply it.
    pub async fn acquire(&self) {
        // The lock is held across the refill wait: the next waiter in the
        // mutex queue cannot jump ahead of the caller.
        let mut bucket = self.bucket.lock().await;
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill);
            bucket.tokens =
                (bucket.tokens + elapsed.as_secs_f64() * self.tokens_per_second).min(self.burst);
            bucket.last_refill = now;

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return;
            }

            let deficit = 1.0 - bucket.tokens;
            let wait = Duration::from_secs_f64(deficit / self.tokens_per_second);
            debug!(
                provider = %self.provider,
                wait_ms = wait.as_millis() as u64,
                "rate limiter waiting for token"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_rolling_window_bound() {
        let limiter = Arc::new(RateLimiter::new("test", 60));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..120 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now().duration_since(start)
            }));
        }

        let mut offsets = Vec::new();
        for handle in handles {
            offsets.push(handle.await.unwrap());
        }
        offsets.sort();

        // 120 acquisitions at 60 rpm need at least 119 seconds of refill.
        assert!(offsets.last().unwrap() >= &Duration::from_secs(119));

        // No rolling 60-second window may contain more than 60 completions.
        for (i, window_start) in offsets.iter().enumerate() {
            let window_end = *window_start + Duration::from_secs(60);
            let in_window = offsets[i..].iter().take_while(|o| **o < window_end).count();
            assert!(
                in_window <= 60,
                "window starting at {:?} saw {} completions",
                window_start,
                in_window
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_completions_are_spaced() {
        let limiter = RateLimiter::new("test", 120);
        let start = Instant::now();

        limiter.acquire().await;
        let first = Instant::now().duration_since(start);
        limiter.acquire().await;
        let second = Instant::now().duration_since(start);

        // 120 rpm refills one token every 500ms.
        assert!(second - first >= Duration::from_millis(499));
    }

    #[tokio::test(start_paused = true)]
    async fn test_providers_are_independent() {
        let a = Arc::new(RateLimiter::new("provider-a", 60));
        let b = RateLimiter::new("provider-b", 60);

        // Drain provider A's bucket and queue one more acquisition behind it.
        a.acquire().await;
        let blocked = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.acquire().await })
        };
        tokio::task::yield_now().await;

        // Provider B is unaffected by A's exhausted budget.
        let start = Instant::now();
        b.acquire().await;
        assert!(Instant::now().duration_since(start) < Duration::from_millis(10));

        blocked.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_capacity() {
        let limiter = RateLimiter::with_burst("test", 60, 5);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        // The first burst of tokens is available immediately.
        assert!(Instant::now().duration_since(start) < Duration::from_millis(10));
    }
}
