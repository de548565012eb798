// Copyright (C) 2024 the rtsp-bench authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token-bucket pacing for session dispatch.

use std::time::Duration;

use tokio::time::Instant;

/// A token bucket: `rate` tokens per second accrue up to `burst`. The bucket
/// is owned exclusively by the spawn loop, so there is no locking; the
/// adaptive controller changes `rate` between acquisitions.
///
/// Contract: over any interval of length `t` seconds, at most
/// `rate * t + burst` acquisitions complete.
pub(crate) struct RateLimiter {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    pub(crate) fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: rate.max(f64::MIN_POSITIVE),
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }

    pub(crate) fn rate(&self) -> f64 {
        self.rate
    }

    /// Changes the refill rate. Tokens accrued so far at the old rate are
    /// kept.
    pub(crate) fn set_rate(&mut self, rate: f64) {
        self.refill();
        self.rate = rate.max(f64::MIN_POSITIVE);
    }

    /// Takes one token, sleeping until one is available. Cancel-safe: if the
    /// caller drops this future mid-sleep, no token is consumed.
    pub(crate) async fn acquire(&mut self) {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return;
        }
        let wait = (1.0 - self.tokens) / self.rate;
        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        self.refill();
        self.tokens = (self.tokens - 1.0).max(0.0);
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_is_immediate() {
        let mut limiter = RateLimiter::new(10.0, 5);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_rate_is_bounded() {
        let mut limiter = RateLimiter::new(20.0, 5);
        let start = Instant::now();
        for _ in 0..45 {
            limiter.acquire().await;
        }
        // 5 from the burst + 40 at 20/s ≥ 2 s.
        let elapsed = start.elapsed().as_secs_f64();
        assert!(elapsed >= 1.9, "elapsed {elapsed}");
        assert!(elapsed <= 2.5, "elapsed {elapsed}");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_change_applies() {
        let mut limiter = RateLimiter::new(1.0, 1);
        limiter.acquire().await;
        limiter.set_rate(100.0);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }
}
