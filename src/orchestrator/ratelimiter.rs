//! A cancellable token bucket used to pace session dispatch (§4.4).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Clamps the burst size derived from a configured rate, per §4.4.
pub fn clamp_burst(rate_per_sec: f64) -> u32 {
    (rate_per_sec / 10.0).round().clamp(10.0, 100.0) as u32
}

/// A token bucket that refills continuously at `rate` tokens/sec up to
/// `burst` tokens. `acquire` is cancellation-safe: dropping the future before
/// it resolves does not consume a token.
pub struct RateLimiter {
    rate_millihertz: AtomicU64, // rate * 1000, stored as integer to allow atomic updates
    burst: AtomicI64,
    tokens: AtomicI64, // fixed-point, scaled by SCALE
    last_refill: parking_lot::Mutex<Instant>,
    notify: Notify,
}

const SCALE: i64 = 1_000_000;

impl RateLimiter {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_millihertz: AtomicU64::new((rate_per_sec * 1000.0) as u64),
            burst: AtomicI64::new(i64::from(burst)),
            tokens: AtomicI64::new(i64::from(burst) * SCALE),
            last_refill: parking_lot::Mutex::new(Instant::now()),
            notify: Notify::new(),
        }
    }

    pub fn rate_per_sec(&self) -> f64 {
        self.rate_millihertz.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn set_rate_per_sec(&self, rate: f64) {
        self.rate_millihertz.store((rate * 1000.0) as u64, Ordering::Relaxed);
    }

    fn refill(&self) {
        let mut last = self.last_refill.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(*last);
        *last = now;
        drop(last);

        let rate = self.rate_per_sec();
        let added = (elapsed.as_secs_f64() * rate * SCALE as f64) as i64;
        if added == 0 {
            return;
        }
        let burst_scaled = self.burst.load(Ordering::Relaxed) * SCALE;
        let mut current = self.tokens.load(Ordering::Relaxed);
        loop {
            let next = (current + added).min(burst_scaled);
            match self.tokens.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Waits until one token is available, then consumes it. Cancellable by
    /// selecting this future against a cancellation token at the call site.
    pub async fn acquire(&self) {
        loop {
            self.refill();
            let current = self.tokens.load(Ordering::Relaxed);
            if current >= SCALE {
                if self
                    .tokens
                    .compare_exchange(current, current - SCALE, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            let wait = Duration::from_secs_f64(1.0 / self.rate_per_sec().max(0.001));
            tokio::select! {
                _ = tokio::time::sleep(wait.min(Duration::from_millis(50))) => {}
                _ = self.notify.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_clamped() {
        assert_eq!(clamp_burst(1.0), 10);
        assert_eq!(clamp_burst(50.0), 10);
        assert_eq!(clamp_burst(2000.0), 100);
        assert_eq!(clamp_burst(500.0), 50);
    }

    #[tokio::test]
    async fn acquire_drains_initial_burst_without_blocking() {
        let limiter = RateLimiter::new(100.0, 10);
        for _ in 0..10 {
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await.expect("burst token should be immediate");
        }
    }

    #[tokio::test]
    async fn set_rate_changes_future_acquires() {
        let limiter = RateLimiter::new(1.0, 10);
        limiter.set_rate_per_sec(1000.0);
        assert!((limiter.rate_per_sec() - 1000.0).abs() < 1e-9);
    }
}
