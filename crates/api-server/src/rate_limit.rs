//! Grant-path rate limiting
//!
//! Token bucket per client address, sized from the engine's rate-limit
//! configuration and consulted by the grant handler. The engine itself
//! only honors device blocks; the attempt ceiling lives here at the
//! facade edge.

use std::{collections::HashMap, net::IpAddr, time::Instant};
use tokio::sync::Mutex;

/// Token bucket state for one client
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(requests_per_minute: u32, burst: u32) -> Self {
        let capacity = (requests_per_minute + burst) as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: requests_per_minute as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-address token buckets
pub struct RateLimiter {
    requests_per_minute: u32,
    burst: u32,
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        Self {
            requests_per_minute,
            burst,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `addr`; false means over the ceiling
    pub async fn allow(&self, addr: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(addr)
            .or_insert_with(|| TokenBucket::new(self.requests_per_minute, self.burst))
            .try_take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_exhausts_and_isolates_clients() {
        let limiter = RateLimiter::new(60, 2);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        // Capacity is requests_per_minute + burst = 62.
        for _ in 0..62 {
            assert!(limiter.allow(a).await);
        }
        assert!(!limiter.allow(a).await);

        // A separate client has its own bucket.
        assert!(limiter.allow(b).await);
    }

    #[tokio::test]
    async fn test_zero_rate_blocks_after_burst() {
        let limiter = RateLimiter::new(0, 1);
        let a: IpAddr = "10.0.0.9".parse().unwrap();
        assert!(limiter.allow(a).await);
        assert!(!limiter.allow(a).await);
    }
}
