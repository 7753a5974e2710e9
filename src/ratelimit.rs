//! Rate Limiter: a single token bucket shared by every backend
//! client operation in a run, parameterized by `rate` (tokens/s) and `burst`.
//! Blocks under contention; a caller can still escape early via cancellation.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use tokio_util::sync::CancellationToken;

pub struct TokenBucket {
    inner: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl TokenBucket {
    /// `rate` and `burst` are clamped to at least 1; a limiter with zero
    /// throughput would deadlock every caller instead of rate-limiting them.
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let rate = NonZeroU32::new(rate_per_sec.round().max(1.0) as u32)
            .unwrap_or_else(|| NonZeroU32::new(1).unwrap());
        let burst = NonZeroU32::new(burst.max(1)).unwrap_or_else(|| NonZeroU32::new(1).unwrap());
        let quota = Quota::per_second(rate).allow_burst(burst);
        Self {
            inner: RateLimiter::direct(quota),
        }
    }

    /// Waits for one token, or returns [`Cancelled`] if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        tokio::select! {
            _ = self.inner.until_ready() => Ok(()),
            _ = cancel.cancelled() => Err(Cancelled),
        }
    }
}

#[derive(Debug)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cancelled while waiting for a rate-limit token")
    }
}

impl std::error::Error for Cancelled {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_tokens_are_immediately_available() {
        let bucket = TokenBucket::new(1.0, 5);
        let cancel = CancellationToken::new();
        for _ in 0..5 {
            assert!(bucket.acquire(&cancel).await.is_ok());
        }
    }

    #[tokio::test]
    async fn acquire_returns_cancelled_when_token_already_fired() {
        let bucket = TokenBucket::new(1.0, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Burst of 1 already consumed by a fresh bucket's first token would
        // still succeed; force contention by draining it first.
        assert!(bucket.acquire(&CancellationToken::new()).await.is_ok());
        assert!(bucket.acquire(&cancel).await.is_err());
    }
}
