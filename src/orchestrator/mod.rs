//! Fixed-target session orchestrator: paces dispatch, caps concurrency,
//! tracks latency/failure stats, adapts rate (§4.4).

pub mod latency;
pub mod ratelimiter;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregator;
use crate::client::{connect_with_backoff, Session, SessionConfig};
use crate::error::Error;
use latency::LatencyAccumulator;
use ratelimiter::{clamp_burst, RateLimiter};

/// Shared, atomic counters and accumulators read by the stats surface.
pub struct OrchestratorState {
    pub active: AtomicI64,
    pub total_connects: AtomicU64,
    pub total_failures: AtomicU64,
    pub bad_clients: AtomicU64,
    /// Per-behavior-name tally, keyed by [`crate::badclient::BadClientBehavior::name`].
    pub bad_client_breakdown: Mutex<HashMap<String, u64>>,
    pub latency: LatencyAccumulator,
    pub target_active: AtomicI64,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self {
            active: AtomicI64::new(0),
            total_connects: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            bad_clients: AtomicU64::new(0),
            bad_client_breakdown: Mutex::new(HashMap::new()),
            latency: LatencyAccumulator::new(),
            target_active: AtomicI64::new(0),
        }
    }
}

impl OrchestratorState {
    /// Records one dispatch of the named bad-client behavior (§4.6).
    pub fn record_bad_client(&self, name: &str) {
        self.bad_clients.fetch_add(1, Ordering::Relaxed);
        *self.bad_client_breakdown.lock().entry(name.to_string()).or_insert(0) += 1;
    }
}

/// Per-dispatch session parameters shared by every session in a fixed-target
/// run (§3 Session Configuration, minus the per-instance lifetime which the
/// real-world controller varies — see [`crate::realworld`]).
#[derive(Clone)]
pub struct SessionTemplate {
    pub addr: String, // resolved "host:port" for TCP connect
    pub url: url::Url,
    pub transport: crate::client::Transport,
    pub lifetime: Duration,
}

pub fn concurrency_cap(n: u64) -> usize {
    ((n / 10).clamp(10_000, 50_000)) as usize
}

/// Runs the fixed-target main loop: dispatches up to `n` sessions at `rate`
/// per second, adapting the rate based on recent failures, until `n` have
/// been dispatched or `cancel` fires. Returns once every dispatched session
/// has finished (§4.4: "the orchestrator waits for all sessions to drain").
pub async fn run_fixed_target(
    state: Arc<OrchestratorState>,
    n: u64,
    rate: f64,
    template: SessionTemplate,
    aggregator: Aggregator,
    run_deadline: Duration,
    cancel: CancellationToken,
) -> Arc<OrchestratorState> {
    state.target_active.store(n as i64, Ordering::Relaxed);

    let burst = clamp_burst(rate);
    let limiter = Arc::new(RateLimiter::new(rate, burst));
    let cap = concurrency_cap(n);
    let semaphore = Arc::new(Semaphore::new(cap));
    let configured_rate = rate;
    let run_end = Instant::now() + run_deadline;

    let mut join_set = tokio::task::JoinSet::new();

    let mut dispatched = 0u64;
    let mut last_check_connects = 0u64;
    let mut last_check_failures = 0u64;
    let mut last_check = Instant::now();

    while dispatched < n {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = limiter.acquire() => {}
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = semaphore.clone().acquire_owned() => match r {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let session_config = SessionConfig {
            url: template.url.clone(),
            transport: template.transport,
            lifetime: template.lifetime,
            aggregator: aggregator.clone(),
        };
        let addr = template.addr.clone();
        let state_clone = state.clone();
        let cancel_clone = cancel.child_token();

        join_set.spawn(async move {
            run_session_task(addr, session_config, state_clone, run_end, permit, cancel_clone).await;
        });

        dispatched += 1;

        if dispatched % 10 == 0 && last_check.elapsed() >= Duration::from_secs(2) {
            let connects_now = state.total_connects.load(Ordering::Relaxed);
            let failures_now = state.total_failures.load(Ordering::Relaxed);
            let failures_since = failures_now.saturating_sub(last_check_failures);
            let attempts_since = connects_now.saturating_sub(last_check_connects) + failures_since;

            if attempts_since > 0 && (failures_since as f64 / attempts_since as f64) > 0.2 {
                let new_rate = (limiter.rate_per_sec() / 2.0).max(1.0);
                limiter.set_rate_per_sec(new_rate);
                warn!("adaptive rate halved to {new_rate:.2}/s after {failures_since}/{attempts_since} failures");
            } else if failures_since == 0 && limiter.rate_per_sec() < configured_rate {
                let new_rate = (limiter.rate_per_sec() * 1.2).min(configured_rate);
                limiter.set_rate_per_sec(new_rate);
                info!("adaptive rate raised to {new_rate:.2}/s");
            }

            last_check_connects = connects_now;
            last_check_failures = failures_now;
            last_check = Instant::now();
        }
    }

    while join_set.join_next().await.is_some() {}

    state
}

/// Runs one session's connect-then-drive lifecycle; shared by fixed-target
/// and real-world dispatch.
pub async fn run_session_task(
    addr: String,
    session_config: SessionConfig,
    state: Arc<OrchestratorState>,
    run_end: Instant,
    permit: tokio::sync::OwnedSemaphorePermit,
    cancel: CancellationToken,
) {
    let connect_result = connect_with_backoff(&addr, &cancel).await;
    let stream = match connect_result {
        Ok((stream, latency)) => {
            state.latency.record(latency.as_millis() as i64);
            state.total_connects.fetch_add(1, Ordering::Relaxed);
            stream
        }
        Err(e) => {
            count_failure(&state, &e);
            drop(permit);
            return;
        }
    };

    state.active.fetch_add(1, Ordering::Relaxed);
    let remaining = run_end.saturating_duration_since(Instant::now());
    let deadline = session_config.lifetime.min(remaining);

    let result = Session::run(stream, session_config, deadline, cancel).await;
    state.active.fetch_sub(1, Ordering::Relaxed);

    if let Err(e) = result {
        count_failure(&state, &e);
    }

    drop(permit);
}

fn count_failure(state: &OrchestratorState, e: &Error) {
    if !e.is_benign_termination() {
        state.total_failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_cap_is_clamped() {
        assert_eq!(concurrency_cap(10), 10_000);
        assert_eq!(concurrency_cap(1_000_000), 50_000);
        assert_eq!(concurrency_cap(200_000), 20_000);
    }
}
