//! Process-wide packet/byte/loss counters shared by every session.
//!
//! Updates are unordered and lock-free; `snapshot` is not a consistent cut
//! across the three counters, which is fine since rates are computed over
//! deltas rather than from a single instant.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Counter(AtomicU64);

impl Counter {
    fn add(&self, n: u64) {
        if n != 0 {
            self.0.fetch_add(n, Ordering::Relaxed);
        }
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A point-in-time read of the [`Aggregator`]'s three counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct AggregatorSnapshot {
    pub packets: u64,
    pub lost: u64,
    pub bytes: u64,
}

impl AggregatorSnapshot {
    /// `lost / (packets + lost)`, 0.0 when nothing has been observed yet.
    pub fn loss_rate(&self) -> f64 {
        let denom = self.packets + self.lost;
        if denom == 0 {
            0.0
        } else {
            self.lost as f64 / denom as f64
        }
    }

    /// Megabits/sec implied by `bytes` over `seconds`.
    pub fn bitrate_mbps(&self, seconds: f64) -> f64 {
        if seconds <= 0.0 {
            return 0.0;
        }
        (self.bytes as f64 * 8.0) / seconds / 1e6
    }
}

/// Process-wide packet/byte/loss counters, cheaply cloned and shared across
/// every session task.
#[derive(Clone, Default)]
pub struct Aggregator(Arc<Inner>);

#[derive(Default)]
struct Inner {
    packets: Counter,
    lost: Counter,
    bytes: Counter,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_packets(&self, n: u64) {
        self.0.packets.add(n);
    }

    pub fn add_loss(&self, n: u64) {
        self.0.lost.add(n);
    }

    pub fn add_bytes(&self, n: u64) {
        self.0.bytes.add(n);
    }

    pub fn snapshot(&self) -> AggregatorSnapshot {
        AggregatorSnapshot {
            packets: self.0.packets.get(),
            lost: self.0.lost.get(),
            bytes: self.0.bytes.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_are_monotonic_and_cumulative() {
        let agg = Aggregator::new();
        agg.add_packets(10);
        agg.add_loss(2);
        agg.add_bytes(1000);
        agg.add_packets(5);

        let snap = agg.snapshot();
        assert_eq!(snap.packets, 15);
        assert_eq!(snap.lost, 2);
        assert_eq!(snap.bytes, 1000);
    }

    #[test]
    fn zero_add_is_noop() {
        let agg = Aggregator::new();
        agg.add_packets(0);
        agg.add_loss(0);
        agg.add_bytes(0);
        assert_eq!(agg.snapshot(), AggregatorSnapshot { packets: 0, lost: 0, bytes: 0 });
    }

    #[test]
    fn derived_rates() {
        let snap = AggregatorSnapshot { packets: 98, lost: 2, bytes: 125_000 };
        assert!((snap.loss_rate() - 0.02).abs() < 1e-9);
        assert!((snap.bitrate_mbps(1.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn clone_shares_state() {
        let agg = Aggregator::new();
        let agg2 = agg.clone();
        agg2.add_packets(7);
        assert_eq!(agg.snapshot().packets, 7);
    }
}
