//! Stats Surface: periodic snapshot of orchestrator + aggregator counters
//! for an out-of-core formatter to render (§4.6).

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::aggregator::{Aggregator, AggregatorSnapshot};
use crate::orchestrator::latency::LatencySummary;
use crate::orchestrator::OrchestratorState;

pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsRecord {
    pub active: i64,
    pub target_active: i64,
    pub total_connects: u64,
    pub total_failures: u64,
    pub latency: LatencySummary,
    pub aggregate: AggregatorSnapshot,
    pub bad_clients: u64,
    pub bad_client_breakdown: HashMap<String, u64>,
}

pub fn sample(state: &OrchestratorState, aggregator: &Aggregator) -> StatsRecord {
    StatsRecord {
        active: state.active.load(Ordering::Relaxed),
        target_active: state.target_active.load(Ordering::Relaxed),
        total_connects: state.total_connects.load(Ordering::Relaxed),
        total_failures: state.total_failures.load(Ordering::Relaxed),
        latency: state.latency.summary(),
        aggregate: aggregator.snapshot(),
        bad_clients: state.bad_clients.load(Ordering::Relaxed),
        bad_client_breakdown: state.bad_client_breakdown.lock().clone(),
    }
}

/// Runs the periodic sampling loop, invoking `on_record` once per tick until
/// `cancel` fires. The out-of-core formatter lives in `on_record`; this
/// function only produces the plain-data record.
pub async fn run<F>(
    state: Arc<OrchestratorState>,
    aggregator: Aggregator,
    interval: Duration,
    cancel: CancellationToken,
    mut on_record: F,
) where
    F: FnMut(StatsRecord),
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                on_record(sample(&state, &aggregator));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_reflects_current_counters() {
        let state = OrchestratorState::default();
        state.active.store(7, Ordering::Relaxed);
        state.total_connects.store(10, Ordering::Relaxed);
        state.total_failures.store(1, Ordering::Relaxed);
        let aggregator = Aggregator::new();
        aggregator.add_packets(100);

        let record = sample(&state, &aggregator);
        assert_eq!(record.active, 7);
        assert_eq!(record.total_connects, 10);
        assert_eq!(record.total_failures, 1);
        assert_eq!(record.aggregate.packets, 100);
    }

    #[test]
    fn record_serializes_to_json() {
        let state = OrchestratorState::default();
        let aggregator = Aggregator::new();
        let record = sample(&state, &aggregator);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"active\""));
    }

    #[test]
    fn sample_reflects_bad_client_breakdown() {
        let state = OrchestratorState::default();
        state.record_bad_client("slow_send");
        state.record_bad_client("slow_send");
        state.record_bad_client("garbage_bytes");
        let aggregator = Aggregator::new();

        let record = sample(&state, &aggregator);
        assert_eq!(record.bad_clients, 3);
        assert_eq!(record.bad_client_breakdown.get("slow_send"), Some(&2));
        assert_eq!(record.bad_client_breakdown.get("garbage_bytes"), Some(&1));
    }
}
