//! Connect-latency accumulator: atomic sum/count/min/max plus a bounded
//! sample buffer for on-demand p95 (§3, §4.4).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

/// Cap on retained latency samples (§3).
pub const SAMPLE_CAP: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct LatencySummary {
    pub avg_ms: f64,
    pub min_ms: i64,
    pub max_ms: i64,
    pub p95_ms: i64,
}

pub struct LatencyAccumulator {
    sum_ms: AtomicI64,
    count: AtomicU64,
    min_ms: AtomicI64,
    max_ms: AtomicI64,
    samples: Mutex<Vec<i64>>,
}

impl Default for LatencyAccumulator {
    fn default() -> Self {
        Self {
            sum_ms: AtomicI64::new(0),
            count: AtomicU64::new(0),
            min_ms: AtomicI64::new(i64::MAX),
            max_ms: AtomicI64::new(0),
            samples: Mutex::new(Vec::new()),
        }
    }
}

impl LatencyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, latency_ms: i64) {
        self.sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        cas_min(&self.min_ms, latency_ms);
        cas_max(&self.max_ms, latency_ms);

        let mut samples = self.samples.lock();
        if samples.len() < SAMPLE_CAP {
            samples.push(latency_ms);
        }
        // Full buffer: drop the sample, per §4.4 ("drop if full").
    }

    pub fn summary(&self) -> LatencySummary {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum_ms.load(Ordering::Relaxed);
        let avg_ms = if count == 0 { 0.0 } else { sum as f64 / count as f64 };
        let min_ms = match self.min_ms.load(Ordering::Relaxed) {
            i64::MAX => 0,
            v => v,
        };
        let max_ms = self.max_ms.load(Ordering::Relaxed);
        let p95_ms = self.p95();
        LatencySummary { avg_ms, min_ms, max_ms, p95_ms }
    }

    fn p95(&self) -> i64 {
        let mut samples = self.samples.lock().clone();
        if samples.is_empty() {
            return 0;
        }
        samples.sort_unstable();
        let idx = ((samples.len() as f64) * 0.95) as usize;
        samples[idx.min(samples.len() - 1)]
    }
}

fn cas_min(cell: &AtomicI64, value: i64) {
    let mut current = cell.load(Ordering::Relaxed);
    while value < current {
        match cell.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

fn cas_max(cell: &AtomicI64, value: i64) {
    let mut current = cell.load(Ordering::Relaxed);
    while value > current {
        match cell.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_and_avg() {
        let acc = LatencyAccumulator::new();
        for ms in [50, 10, 200, 30] {
            acc.record(ms);
        }
        let s = acc.summary();
        assert_eq!(s.min_ms, 10);
        assert_eq!(s.max_ms, 200);
        assert!((s.avg_ms - 72.5).abs() < 1e-9);
    }

    #[test]
    fn min_is_zero_before_any_sample() {
        let acc = LatencyAccumulator::new();
        assert_eq!(acc.summary().min_ms, 0);
    }

    #[test]
    fn p95_of_known_distribution() {
        let acc = LatencyAccumulator::new();
        for ms in 1..=100 {
            acc.record(ms);
        }
        let s = acc.summary();
        assert_eq!(s.p95_ms, 96);
    }

    #[test]
    fn samples_beyond_cap_are_dropped_not_panicking() {
        let acc = LatencyAccumulator::new();
        for _ in 0..(SAMPLE_CAP + 100) {
            acc.record(5);
        }
        assert_eq!(acc.summary().avg_ms, 5.0);
    }
}
