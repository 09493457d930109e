//! The RTSP client session: handshake, keep-alive, and media receive loop.

pub mod session;
pub mod transport;

pub use session::{connect_with_backoff, Session, State};

use std::time::Duration;

use crate::aggregator::Aggregator;

/// Media transport negotiated for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    TcpInterleaved,
    UdpUnicast,
}

/// Immutable per-session configuration (§3 Session Configuration).
#[derive(Clone)]
pub struct SessionConfig {
    pub url: url::Url,
    pub transport: Transport,
    pub lifetime: Duration,
    pub aggregator: Aggregator,
}
