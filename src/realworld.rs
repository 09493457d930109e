//! Real-World Load Controller: chases a time-varying target active-session
//! count instead of a fixed N (§4.5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregator;
use crate::badclient::random_behavior;
use crate::client::{SessionConfig, Transport};
use crate::orchestrator::{run_session_task, OrchestratorState};

const TARGET_RECOMPUTE_INTERVAL: Duration = Duration::from_secs(10);
const CONTROLLER_TICK: Duration = Duration::from_secs(1);
const MAX_SPAWN_PER_TICK: i64 = 50;
const MAX_CANCEL_PER_TICK: i64 = 20;
const MIN_SESSION_LIFETIME: Duration = Duration::from_secs(30);
const DEFAULT_SESSION_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// `day_factor` from the hour-of-day table in §4.5.
pub fn day_factor(hour: u32) -> f64 {
    match hour {
        9..=11 => 1.2,
        12..=13 => 0.9,
        14..=17 => 1.1,
        18..=22 => 1.3,
        23 | 0..=5 => 0.6,
        _ => 0.8,
    }
}

/// Computes the target active-session count for one 10-s tick.
pub fn compute_target(avg: f64, variance: f64, hour: u32, uniform01: f64) -> f64 {
    let day = day_factor(hour);
    let random_factor = 1.0 + (uniform01 - 0.5) * variance;
    let raw = avg * day * random_factor;
    raw.clamp(avg * (1.0 - variance), avg * (1.0 + variance))
}

fn local_hour() -> u32 {
    time::OffsetDateTime::now_local()
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc())
        .hour() as u32
}

/// Template shared by every session the controller spawns, minus lifetime
/// (each spawn picks its own per §4.5).
#[derive(Clone)]
pub struct RealWorldTemplate {
    pub addr: String,
    pub url: url::Url,
    pub transport: Transport,
    pub duration_cap: Duration, // D; sessions draw lifetime in [30s, D]
}

pub struct RealWorldConfig {
    pub avg: f64,
    pub variance: f64,
    pub bad_ratio: Option<f64>,
    pub concurrency_cap: usize,
}

/// Runs the real-world controller until `cancel` fires, returning the shared
/// orchestrator counters (also readable mid-run by the stats surface).
pub async fn run(
    state: Arc<OrchestratorState>,
    config: RealWorldConfig,
    template: RealWorldTemplate,
    aggregator: Aggregator,
    run_deadline: Duration,
    cancel: CancellationToken,
) -> Arc<OrchestratorState> {
    let semaphore = Arc::new(Semaphore::new(config.concurrency_cap));
    // Keyed by an internal dispatch id, not the RTSP session-id (which is only
    // known once SETUP completes, by which point the controller has already
    // committed to tracking the slot).
    let sessions: Arc<Mutex<HashMap<u64, CancellationToken>>> = Arc::new(Mutex::new(HashMap::new()));
    let next_id = Arc::new(AtomicU64::new(0));
    let run_end = tokio::time::Instant::now() + run_deadline;

    let mut target = compute_target(config.avg, config.variance, local_hour(), rand::rng().random());
    state.target_active.store(target as i64, Ordering::Relaxed);

    let mut target_tick = tokio::time::interval(TARGET_RECOMPUTE_INTERVAL);
    let mut controller_tick = tokio::time::interval(CONTROLLER_TICK);
    let mut join_set = tokio::task::JoinSet::new();
    let overall_deadline = tokio::time::sleep(run_deadline);
    tokio::pin!(overall_deadline);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = &mut overall_deadline => break,
            _ = target_tick.tick() => {
                target = compute_target(config.avg, config.variance, local_hour(), rand::rng().random());
                state.target_active.store(target as i64, Ordering::Relaxed);
                debug!("real-world target recomputed: {target:.1}");
            }
            _ = controller_tick.tick() => {
                let active = state.active.load(Ordering::Relaxed);
                let diff = target as i64 - active;
                if diff > 0 {
                    let spawn_n = diff.min(MAX_SPAWN_PER_TICK);
                    for _ in 0..spawn_n {
                        spawn_one(&config, &template, &aggregator, &state, &semaphore, &sessions, &next_id, run_end, &cancel, &mut join_set);
                    }
                } else if diff < 0 {
                    cancel_some((-diff).min(MAX_CANCEL_PER_TICK) as usize, &sessions);
                }
            }
        }
    }

    // Drain: cancel every tracked session and let already-spawned tasks exit.
    for (_, token) in sessions.lock().drain() {
        token.cancel();
    }
    while join_set.join_next().await.is_some() {}

    state
}

#[allow(clippy::too_many_arguments)]
fn spawn_one(
    config: &RealWorldConfig,
    template: &RealWorldTemplate,
    aggregator: &Aggregator,
    state: &Arc<OrchestratorState>,
    semaphore: &Arc<Semaphore>,
    sessions: &Arc<Mutex<HashMap<u64, CancellationToken>>>,
    next_id: &Arc<AtomicU64>,
    run_end: tokio::time::Instant,
    run_cancel: &CancellationToken,
    join_set: &mut tokio::task::JoinSet<()>,
) {
    let id = next_id.fetch_add(1, Ordering::Relaxed);
    let child = run_cancel.child_token();
    sessions.lock().insert(id, child.clone());

    let is_bad_client = config.bad_ratio.map(|r| rand::rng().random::<f64>() < r).unwrap_or(false);

    if is_bad_client {
        let url = template.url.clone();
        let state = state.clone();
        let sessions = sessions.clone();
        state.active.fetch_add(1, Ordering::Relaxed);
        join_set.spawn(async move {
            let behavior = random_behavior();
            state.record_bad_client(behavior.name());
            behavior.run(&url, child).await;
            state.active.fetch_sub(1, Ordering::Relaxed);
            sessions.lock().remove(&id);
        });
        return;
    }

    let cap = if template.duration_cap >= MIN_SESSION_LIFETIME { template.duration_cap } else { DEFAULT_SESSION_LIFETIME };
    let lifetime_secs = rand::rng().random_range(MIN_SESSION_LIFETIME.as_secs()..=cap.as_secs());
    let lifetime = Duration::from_secs(lifetime_secs);

    let session_config = SessionConfig {
        url: template.url.clone(),
        transport: template.transport,
        lifetime,
        aggregator: aggregator.clone(),
    };
    let addr = template.addr.clone();
    let state = state.clone();
    let permit_fut = semaphore.clone().acquire_owned();
    let sessions_clone = sessions.clone();

    join_set.spawn(async move {
        let Ok(permit) = permit_fut.await else { return };
        run_session_task(addr, session_config, state, run_end, permit, child).await;
        sessions_clone.lock().remove(&id);
    });
}

fn cancel_some(count: usize, sessions: &Arc<Mutex<HashMap<u64, CancellationToken>>>) {
    let mut guard = sessions.lock();
    let ids: Vec<u64> = guard.keys().take(count).copied().collect();
    for id in ids {
        if let Some(token) = guard.remove(&id) {
            token.cancel();
            info!("real-world controller cancelled session {id}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_factor_matches_table() {
        assert_eq!(day_factor(10), 1.2);
        assert_eq!(day_factor(12), 0.9);
        assert_eq!(day_factor(15), 1.1);
        assert_eq!(day_factor(20), 1.3);
        assert_eq!(day_factor(2), 0.6);
        assert_eq!(day_factor(23), 0.6);
        assert_eq!(day_factor(7), 0.8);
        assert_eq!(day_factor(8), 0.8);
    }

    #[test]
    fn target_is_clamped_to_variance_band() {
        let t = compute_target(500.0, 0.3, 20, 1.0); // max random_factor, peak hour
        assert!(t <= 500.0 * 1.3 + 1e-9);
        let t = compute_target(500.0, 0.3, 2, 0.0); // min random_factor, trough hour
        assert!(t >= 500.0 * 0.7 - 1e-9);
    }

    #[test]
    fn target_midpoint_is_avg_times_day_factor() {
        let t = compute_target(500.0, 0.3, 10, 0.5); // uniform01 = 0.5 cancels random_factor
        assert!((t - 500.0 * 1.2).abs() < 1e-9);
    }
}
