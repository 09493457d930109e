//! CLI entry point: parses [`RunConfig`], wires the orchestrator (or
//! real-world controller) to the stats surface, and runs to completion.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use log::info;
use rtsp_bench::aggregator::Aggregator;
use rtsp_bench::config::{Cli, RunConfig};
use rtsp_bench::orchestrator::{self, OrchestratorState, SessionTemplate};
use rtsp_bench::realworld::{self, RealWorldConfig, RealWorldTemplate};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = RunConfig::load(cli)?;

    simple_logger::SimpleLogger::new().with_level(config.log_level.to_level_filter()).init()?;

    let url = url::Url::parse(&config.url)?;
    let host = url.host_str().ok_or_else(|| anyhow::anyhow!("url has no host"))?;
    let port = url.port().unwrap_or(554);
    let addr = format!("{host}:{port}");

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel_for_signal.cancel();
        }
    });

    let aggregator = Aggregator::new();
    let state = Arc::new(OrchestratorState::default());

    let run_handle = if config.real_world {
        let template = RealWorldTemplate {
            addr,
            url,
            transport: config.transport,
            duration_cap: config.duration,
        };
        let rw_config = RealWorldConfig {
            avg: config.real_world_avg,
            variance: config.real_world_variance,
            bad_ratio: config.bad_clients.then_some(config.bad_client_ratio),
            concurrency_cap: orchestrator::concurrency_cap(config.real_world_avg.max(1.0) as u64 * 2),
        };
        tokio::spawn(realworld::run(state.clone(), rw_config, template, aggregator.clone(), config.duration, cancel.clone()))
    } else {
        let template = SessionTemplate {
            addr,
            url,
            transport: config.transport,
            lifetime: config.duration,
        };
        tokio::spawn(orchestrator::run_fixed_target(
            state.clone(),
            config.sessions,
            config.rate,
            template,
            aggregator.clone(),
            config.duration,
            cancel.clone(),
        ))
    };

    let stats_cancel = cancel.clone();
    let stats_state = state.clone();
    let stats_aggregator = aggregator.clone();
    let stats_interval = config.stats_interval;
    let stats_task = tokio::spawn(async move {
        rtsp_bench::stats::run(stats_state, stats_aggregator, stats_interval, stats_cancel, |record| {
            info!(
                "active={} target={} total_connects={} total_failures={} lost={} packets={}",
                record.active, record.target_active, record.total_connects, record.total_failures, record.aggregate.lost, record.aggregate.packets
            );
        })
        .await;
    });

    run_handle.await?;
    cancel.cancel();
    let _ = stats_task.await;

    info!(
        "run complete: total_connects={} total_failures={} lost={}",
        state.total_connects.load(Ordering::Relaxed),
        state.total_failures.load(Ordering::Relaxed),
        aggregator.snapshot().lost
    );

    Ok(())
}
