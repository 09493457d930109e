//! Core of a high-concurrency RTSP load generator: session orchestration,
//! the RTSP client state machine, and RTP loss detection.
//!
//! CLI flag grammar, stats formatting, and kernel tuning live outside this
//! crate; see [`config`] for the merged configuration this crate consumes.

pub mod aggregator;
pub mod badclient;
pub mod client;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod realworld;
pub mod rtp;
pub mod rtsp;
pub mod stats;

pub use aggregator::Aggregator;
pub use error::{Error, Result};
