//! Call pacing shared by all sync workers.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-call spacer bounding how fast any one call site issues requests.
///
/// `acquire` must be awaited immediately before every outbound call. Each
/// worker independently waits the minimum interval between its own calls,
/// so aggregate throughput across N concurrent workers can exceed the
/// single-stream rate; this is pacing, not a shared token bucket.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    calls: Mutex<u64>,
    started: Instant,
}

/// Observed call volume since the limiter was created.
#[derive(Debug, Clone, Copy)]
pub struct LimiterStats {
    pub calls: u64,
    pub calls_per_minute: f64,
}

impl RateLimiter {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            calls: Mutex::new(0),
            started: Instant::now(),
        }
    }

    /// Wait out the pacing interval, then count the call.
    pub async fn acquire(&self) {
        tokio::time::sleep(self.min_interval).await;
        let mut calls = self.calls.lock().expect("limiter counter poisoned");
        *calls += 1;
    }

    pub fn stats(&self) -> LimiterStats {
        let calls = *self.calls.lock().expect("limiter counter poisoned");
        let elapsed = self.started.elapsed().as_secs_f64();
        let calls_per_minute = if elapsed > 0.0 {
            calls as f64 / (elapsed / 60.0)
        } else {
            0.0
        };
        LimiterStats {
            calls,
            calls_per_minute,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequential_calls_are_paced() {
        let limiter = RateLimiter::new(Duration::from_millis(20));
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        // 4 calls through a 20ms spacer take at least 3 intervals.
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_call_counter() {
        let limiter = RateLimiter::new(Duration::from_millis(1));
        assert_eq!(limiter.stats().calls, 0);
        limiter.acquire().await;
        limiter.acquire().await;
        let stats = limiter.stats();
        assert_eq!(stats.calls, 2);
        assert!(stats.calls_per_minute > 0.0);
    }
}
