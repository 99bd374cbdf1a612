//! Sliding-window request-weight limiter.
//!
//! Binance budgets REST usage by weight per rolling minute. The limiter
//! records every call's weight and, when usage crosses a threshold fraction
//! of the cap, parks the caller until the window drains.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

const THROTTLE_FRACTION: f64 = 0.8;
const THROTTLE_PAUSE: Duration = Duration::from_millis(500);

pub struct WeightLimiter {
    max_weight: u32,
    window: Duration,
    requests: Mutex<VecDeque<(Instant, u32)>>,
}

impl WeightLimiter {
    pub fn new(max_weight: u32, window: Duration) -> Self {
        Self {
            max_weight,
            window,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    fn cleanup(&self, requests: &mut VecDeque<(Instant, u32)>, now: Instant) {
        while let Some(&(ts, _)) = requests.front() {
            if now.duration_since(ts) > self.window {
                requests.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn current_usage(&self) -> u32 {
        let mut requests = self.requests.lock();
        self.cleanup(&mut requests, Instant::now());
        requests.iter().map(|&(_, w)| w).sum()
    }

    fn should_throttle(&self) -> bool {
        f64::from(self.current_usage()) > f64::from(self.max_weight) * THROTTLE_FRACTION
    }

    /// Waits until the window has room, then records `weight`.
    pub async fn acquire(&self, weight: u32) {
        while self.should_throttle() {
            warn!(
                usage = self.current_usage(),
                max = self.max_weight,
                "rate limiter near cap, pausing"
            );
            tokio::time::sleep(THROTTLE_PAUSE).await;
        }
        self.requests.lock().push_back((Instant::now(), weight));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_sums_weight() {
        let limiter = WeightLimiter::new(100, Duration::from_secs(60));
        limiter.acquire(5).await;
        limiter.acquire(10).await;
        assert_eq!(limiter.current_usage(), 15);
    }

    #[tokio::test]
    async fn expired_entries_are_dropped() {
        let limiter = WeightLimiter::new(100, Duration::from_millis(20));
        limiter.acquire(40).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(limiter.current_usage(), 0);
    }

    #[tokio::test]
    async fn below_threshold_does_not_block() {
        let limiter = WeightLimiter::new(10, Duration::from_secs(60));
        // 80% of 10 = 8; stay under it
        for _ in 0..7 {
            limiter.acquire(1).await;
        }
        assert_eq!(limiter.current_usage(), 7);
    }
}
