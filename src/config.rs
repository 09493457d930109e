//! Config/CLI loader (§4.7): merges a `clap`-parsed CLI with an optional TOML
//! file into the single [`RunConfig`] threaded into the orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::client::Transport;

#[derive(Parser, Debug)]
#[command(name = "rtsp-bench", about = "high-concurrency RTSP load generator")]
pub struct Cli {
    /// Optional TOML file; CLI flags that were actually passed override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub url: Option<String>,

    #[arg(long)]
    pub sessions: Option<u64>,

    #[arg(long)]
    pub rate: Option<f64>,

    #[arg(long, value_name = "SECONDS")]
    pub duration_secs: Option<u64>,

    #[arg(long, value_enum)]
    pub transport: Option<CliTransport>,

    #[arg(long, value_name = "SECONDS")]
    pub stats_interval_secs: Option<u64>,

    #[arg(long)]
    pub real_world: bool,

    #[arg(long)]
    pub real_world_avg: Option<f64>,

    #[arg(long)]
    pub real_world_variance: Option<f64>,

    #[arg(long)]
    pub bad_clients: bool,

    #[arg(long)]
    pub bad_client_ratio: Option<f64>,

    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CliTransport {
    TcpInterleaved,
    UdpUnicast,
}

impl From<CliTransport> for Transport {
    fn from(t: CliTransport) -> Self {
        match t {
            CliTransport::TcpInterleaved => Transport::TcpInterleaved,
            CliTransport::UdpUnicast => Transport::UdpUnicast,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

fn default_sessions() -> u64 {
    10
}
fn default_rate() -> f64 {
    2.0
}
fn default_duration_secs() -> u64 {
    10
}
fn default_transport() -> CliTransport {
    CliTransport::TcpInterleaved
}
fn default_stats_interval_secs() -> u64 {
    5
}
fn default_real_world_avg() -> f64 {
    500.0
}
fn default_real_world_variance() -> f64 {
    0.3
}
fn default_bad_client_ratio() -> f64 {
    0.0
}

/// The on-disk shape of an optional TOML config file; every field has a
/// default so a partial file is valid, mirroring `turn-server::config`'s
/// `#[serde(default = "...")]` structs.
#[derive(Deserialize, Debug)]
struct FileConfig {
    #[serde(default)]
    url: Option<String>,
    #[serde(default = "default_sessions")]
    sessions: u64,
    #[serde(default = "default_rate")]
    rate: f64,
    #[serde(default = "default_duration_secs")]
    duration_secs: u64,
    #[serde(default = "default_transport")]
    transport: CliTransport,
    #[serde(default = "default_stats_interval_secs")]
    stats_interval_secs: u64,
    #[serde(default)]
    real_world: bool,
    #[serde(default = "default_real_world_avg")]
    real_world_avg: f64,
    #[serde(default = "default_real_world_variance")]
    real_world_variance: f64,
    #[serde(default)]
    bad_clients: bool,
    #[serde(default = "default_bad_client_ratio")]
    bad_client_ratio: f64,
}

impl Default for FileConfig {
    fn default() -> Self {
        FileConfig {
            url: None,
            sessions: default_sessions(),
            rate: default_rate(),
            duration_secs: default_duration_secs(),
            transport: default_transport(),
            stats_interval_secs: default_stats_interval_secs(),
            real_world: false,
            real_world_avg: default_real_world_avg(),
            real_world_variance: default_real_world_variance(),
            bad_clients: false,
            bad_client_ratio: default_bad_client_ratio(),
        }
    }
}

/// The fully-merged run configuration threaded from `main` into the
/// orchestrator/controller entry points (§3 RunConfig).
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub url: String,
    pub sessions: u64,
    pub rate: f64,
    pub duration: Duration,
    pub transport: Transport,
    pub stats_interval: Duration,
    pub real_world: bool,
    pub real_world_avg: f64,
    pub real_world_variance: f64,
    pub bad_clients: bool,
    pub bad_client_ratio: f64,
    pub log_level: LogLevel,
}

impl RunConfig {
    /// Loads the optional TOML file named by `cli.config`, then applies any
    /// CLI flags the operator actually passed on top.
    pub fn load(cli: Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text)?
            }
            None => FileConfig::default(),
        };

        let url = cli.url.or(file.url).ok_or_else(|| anyhow::anyhow!("--url is required (or set `url` in the config file)"))?;

        Ok(RunConfig {
            url,
            sessions: cli.sessions.unwrap_or(file.sessions),
            rate: cli.rate.unwrap_or(file.rate),
            duration: Duration::from_secs(cli.duration_secs.unwrap_or(file.duration_secs)),
            transport: cli.transport.unwrap_or(file.transport).into(),
            stats_interval: Duration::from_secs(cli.stats_interval_secs.unwrap_or(file.stats_interval_secs)),
            real_world: cli.real_world || file.real_world,
            real_world_avg: cli.real_world_avg.unwrap_or(file.real_world_avg),
            real_world_variance: cli.real_world_variance.unwrap_or(file.real_world_variance),
            bad_clients: cli.bad_clients || file.bad_clients,
            bad_client_ratio: cli.bad_client_ratio.unwrap_or(file.bad_client_ratio),
            log_level: cli.log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_take_precedence_over_file_defaults() {
        let cli = Cli {
            config: None,
            url: Some("rtsp://127.0.0.1:8554/test".into()),
            sessions: Some(100),
            rate: None,
            duration_secs: None,
            transport: None,
            stats_interval_secs: None,
            real_world: false,
            real_world_avg: None,
            real_world_variance: None,
            bad_clients: false,
            bad_client_ratio: None,
            log_level: LogLevel::Info,
        };
        let config = RunConfig::load(cli).unwrap();
        assert_eq!(config.sessions, 100);
        assert_eq!(config.rate, default_rate());
    }

    #[test]
    fn missing_url_is_an_error() {
        let cli = Cli {
            config: None,
            url: None,
            sessions: None,
            rate: None,
            duration_secs: None,
            transport: None,
            stats_interval_secs: None,
            real_world: false,
            real_world_avg: None,
            real_world_variance: None,
            bad_clients: false,
            bad_client_ratio: None,
            log_level: LogLevel::Info,
        };
        assert!(RunConfig::load(cli).is_err());
    }
}
