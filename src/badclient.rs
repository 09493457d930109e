//! Adversarial client behaviors used to exercise server resilience. Each
//! behavior contributes only to aggregate counters — no measurements.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// One adversarial routine. Implementations should return promptly once
/// `cancel` fires; errors are expected and discarded by the caller.
#[async_trait]
pub trait BadClientBehavior: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, url: &url::Url, cancel: CancellationToken);
}

fn addr_of(url: &url::Url) -> Option<String> {
    let host = url.host_str()?;
    let port = url.port().unwrap_or(554);
    Some(format!("{host}:{port}"))
}

async fn connect(url: &url::Url) -> std::io::Result<TcpStream> {
    let addr = addr_of(url).ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no host in url"))?;
    TcpStream::connect(addr).await
}

/// Connects then trickles the request body one byte at a time.
pub struct SlowSend;

#[async_trait]
impl BadClientBehavior for SlowSend {
    fn name(&self) -> &'static str {
        "slow_send"
    }

    async fn run(&self, url: &url::Url, cancel: CancellationToken) {
        let Ok(mut stream) = connect(url).await else { return };
        let req = format!("OPTIONS {url} RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        for byte in req.as_bytes() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
            if stream.write_all(&[*byte]).await.is_err() {
                return;
            }
        }
        cancel.cancelled().await;
    }
}

/// Sends a stream of random bytes with no RTSP structure at all.
pub struct GarbageBytes;

#[async_trait]
impl BadClientBehavior for GarbageBytes {
    fn name(&self) -> &'static str {
        "garbage_bytes"
    }

    async fn run(&self, url: &url::Url, cancel: CancellationToken) {
        let Ok(mut stream) = connect(url).await else { return };
        let mut rng = rand::rng();
        loop {
            let buf: Vec<u8> = (0..64).map(|_| rng.random()).collect();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                r = stream.write_all(&buf) => if r.is_err() { return },
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }
}

/// Sends syntactically-invalid RTSP requests (missing CSeq, bad method).
pub struct MalformedRequests;

#[async_trait]
impl BadClientBehavior for MalformedRequests {
    fn name(&self) -> &'static str {
        "malformed_requests"
    }

    async fn run(&self, url: &url::Url, cancel: CancellationToken) {
        let Ok(mut stream) = connect(url).await else { return };
        let bad_requests = [
            format!("FROBNICATE {url} RTSP/1.0\r\n\r\n"),
            format!("OPTIONS {url} HTTP/1.1\r\n\r\n"),
            "OPTIONS \r\n\r\n".to_string(),
        ];
        for req in bad_requests {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                r = stream.write_all(req.as_bytes()) => if r.is_err() { return },
            }
        }
        cancel.cancelled().await;
    }
}

/// Connects and sends OPTIONS but never continues the handshake.
pub struct IncompleteHandshake;

#[async_trait]
impl BadClientBehavior for IncompleteHandshake {
    fn name(&self) -> &'static str {
        "incomplete_handshake"
    }

    async fn run(&self, url: &url::Url, cancel: CancellationToken) {
        let Ok(mut stream) = connect(url).await else { return };
        let req = format!("OPTIONS {url} RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        if stream.write_all(req.as_bytes()).await.is_err() {
            return;
        }
        cancel.cancelled().await;
    }
}

/// Connects, completes nothing, and disconnects after a short random delay.
pub struct RandomDisconnect;

#[async_trait]
impl BadClientBehavior for RandomDisconnect {
    fn name(&self) -> &'static str {
        "random_disconnect"
    }

    async fn run(&self, url: &url::Url, cancel: CancellationToken) {
        let Ok(stream) = connect(url).await else { return };
        let delay_ms = rand::rng().random_range(50..2_000);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
        }
        drop(stream);
        debug!("random_disconnect closed its connection");
    }
}

/// Opens many connections to the same target without ever completing a
/// handshake on any of them, to probe connection-table exhaustion.
pub struct ResourceHog;

#[async_trait]
impl BadClientBehavior for ResourceHog {
    fn name(&self) -> &'static str {
        "resource_hog"
    }

    async fn run(&self, url: &url::Url, cancel: CancellationToken) {
        let mut streams = Vec::new();
        for _ in 0..16 {
            if cancel.is_cancelled() {
                break;
            }
            if let Ok(stream) = connect(url).await {
                streams.push(stream);
            }
        }
        cancel.cancelled().await;
    }
}

/// The six built-in behaviors, in the order named by the interface contract.
pub fn builtin_behaviors() -> Vec<Box<dyn BadClientBehavior>> {
    vec![
        Box::new(SlowSend),
        Box::new(GarbageBytes),
        Box::new(MalformedRequests),
        Box::new(IncompleteHandshake),
        Box::new(RandomDisconnect),
        Box::new(ResourceHog),
    ]
}

/// Picks one behavior uniformly at random.
pub fn random_behavior() -> Box<dyn BadClientBehavior> {
    let behaviors = builtin_behaviors();
    let idx = rand::rng().random_range(0..behaviors.len());
    // builtin_behaviors() is cheap to rebuild; indexing twice avoids Vec<Box<dyn _>> cloning.
    match idx {
        0 => Box::new(SlowSend),
        1 => Box::new(GarbageBytes),
        2 => Box::new(MalformedRequests),
        3 => Box::new(IncompleteHandshake),
        4 => Box::new(RandomDisconnect),
        _ => Box::new(ResourceHog),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn six_builtin_behaviors_are_registered() {
        assert_eq!(builtin_behaviors().len(), 6);
    }

    #[test]
    fn names_are_unique() {
        let behaviors = builtin_behaviors();
        let mut names: Vec<&str> = behaviors.iter().map(|b| b.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 6);
    }
}
