//! Drives the RTSP Session handshake and media loop against an in-process
//! fake TCP server, covering the smoke scenario's shape at small scale, the
//! cancellation-is-not-a-failure rule, and the bounded interleaved-resync
//! failure.

use std::time::Duration;

use rtsp_bench::aggregator::Aggregator;
use rtsp_bench::client::{Session, SessionConfig, Transport};
use rtsp_bench::error::{Error, MediaErrorKind};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Reads one RTSP request (until the blank line) and returns its CSeq.
async fn read_request_cseq(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> u64 {
    let mut cseq = 0u64;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        if line.trim().is_empty() {
            break;
        }
        if let Some(v) = line.strip_prefix("CSeq:") {
            cseq = v.trim().parse().unwrap();
        }
    }
    cseq
}

async fn respond_ok(writer: &mut tokio::net::tcp::OwnedWriteHalf, cseq: u64, extra: &str) {
    let resp = format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n{extra}\r\n");
    writer.write_all(resp.as_bytes()).await.unwrap();
}

fn interleaved_frame(channel: u8, seq: u16) -> Vec<u8> {
    let mut payload = vec![0x80, 0x60];
    payload.extend_from_slice(&seq.to_be_bytes());
    payload.extend_from_slice(&[0u8; 8]); // pad to >= 12 bytes
    let mut frame = vec![0x24, channel];
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

async fn handshake(stream: TcpStream) -> (BufReader<tokio::net::tcp::OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let cseq = read_request_cseq(&mut reader).await; // OPTIONS
    respond_ok(&mut write_half, cseq, "").await;

    let cseq = read_request_cseq(&mut reader).await; // DESCRIBE
    respond_ok(&mut write_half, cseq, "Content-Length: 0\r\n").await;

    let cseq = read_request_cseq(&mut reader).await; // SETUP video
    respond_ok(&mut write_half, cseq, "Session: abc123;timeout=60\r\n").await;

    let cseq = read_request_cseq(&mut reader).await; // SETUP audio
    respond_ok(&mut write_half, cseq, "Session: abc123;timeout=60\r\n").await;

    let cseq = read_request_cseq(&mut reader).await; // PLAY
    respond_ok(&mut write_half, cseq, "Session: abc123\r\n").await;

    (reader, write_half)
}

#[tokio::test]
async fn smoke_scenario_receives_media_with_no_loss() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (_reader, mut writer) = handshake(stream).await;
        for seq in 0..20u16 {
            writer.write_all(&interleaved_frame(0, seq)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let aggregator = Aggregator::new();
    let url = url::Url::parse(&format!("rtsp://{addr}/test")).unwrap();
    let stream = TcpStream::connect(addr).await.unwrap();
    let config = SessionConfig {
        url,
        transport: Transport::TcpInterleaved,
        lifetime: Duration::from_millis(300),
        aggregator: aggregator.clone(),
    };

    let result = Session::run(stream, config, Duration::from_millis(300), CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::DeadlineExceeded)));
    assert_eq!(aggregator.snapshot().lost, 0);
    assert!(aggregator.snapshot().packets >= 10, "expected media to have been received, got {:?}", aggregator.snapshot());

    server.abort();
}

#[tokio::test]
async fn cancellation_is_not_counted_as_a_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (_reader, _writer) = handshake(stream).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let aggregator = Aggregator::new();
    let url = url::Url::parse(&format!("rtsp://{addr}/test")).unwrap();
    let stream = TcpStream::connect(addr).await.unwrap();
    let config = SessionConfig { url, transport: Transport::TcpInterleaved, lifetime: Duration::from_secs(60), aggregator };

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_clone.cancel();
    });

    let result = Session::run(stream, config, Duration::from_secs(60), cancel).await;
    let err = result.unwrap_err();
    assert!(err.is_benign_termination());
    assert!(matches!(err, Error::Cancelled));

    server.abort();
}

#[tokio::test]
async fn desynchronized_interleaved_stream_fails_bounded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (_reader, mut writer) = handshake(stream).await;
        for _ in 0..64 {
            writer.write_all(b"not-a-frame-header\r\n").await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let aggregator = Aggregator::new();
    let url = url::Url::parse(&format!("rtsp://{addr}/test")).unwrap();
    let stream = TcpStream::connect(addr).await.unwrap();
    let config = SessionConfig { url, transport: Transport::TcpInterleaved, lifetime: Duration::from_secs(5), aggregator };

    let result = Session::run(stream, config, Duration::from_secs(5), CancellationToken::new()).await;
    match result {
        Err(Error::MediaError(MediaErrorKind::Resync { consecutive })) => {
            assert!(consecutive > rtsp_bench::rtsp::MAX_CONSECUTIVE_RESYNC);
        }
        other => panic!("expected a bounded Resync failure, got {other:?}"),
    }

    server.abort();
}
