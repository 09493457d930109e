//! Error taxonomy for the core: see the crate's error handling design notes.
//!
//! Every variant maps to exactly one of the kinds the orchestrator cares about:
//! retryable during establishment, non-retryable handshake failure, a failure
//! of an already-playing stream, or a normal (non-failure) termination.

use std::net::SocketAddr;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connect timed out or a transient I/O error occurred while establishing
    /// the session (before `PLAY` succeeded). Retryable by the caller.
    #[error("transient network error connecting to {addr}: {source}")]
    TransientNetwork {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The server returned a malformed response or a status code >= 400
    /// during the handshake. Not retryable.
    #[error("RTSP protocol error during {method}: {description}")]
    ProtocolError { method: &'static str, description: String },

    /// A read failed on an already-established stream (post-`PLAY`), outside
    /// of cancellation/deadline expiry.
    #[error("media error: {0}")]
    MediaError(#[from] MediaErrorKind),

    /// The run-level or session-level cancellation token fired.
    #[error("cancelled")]
    Cancelled,

    /// The session's configured lifetime elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, thiserror::Error)]
pub enum MediaErrorKind {
    #[error("I/O error reading media: {0}")]
    Io(#[from] std::io::Error),

    /// More than the bounded number of consecutive non-`$` interleaved frame
    /// headers were seen; the stream is presumed desynchronized.
    #[error("interleaved stream desynchronized after {consecutive} non-'$' reads")]
    Resync { consecutive: u32 },

    #[error("keep-alive failed: {0}")]
    KeepAlive(#[source] std::io::Error),
}

impl Error {
    /// `true` for the two kinds that the orchestrator must *not* count as a
    /// `total_failures` increment.
    pub fn is_benign_termination(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}
