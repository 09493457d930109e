//! The RTSP session state machine (§4.3): handshake, keep-alive, media loop,
//! teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregator;
use crate::client::transport::{
    self, parse_transport_header, UdpTrackSockets, RTCP_RR_INTERVAL, UDP_READ_BUFFER, UDP_READ_DEADLINE,
};
use crate::client::{SessionConfig, Transport};
use crate::error::{Error, MediaErrorKind};
use crate::rtp::SequenceTracker;
use crate::rtsp::{
    build_request, check_status, read_response, write_request, InterleavedReader, Method, Response,
    CONTROL_BUFFER_CAPACITY,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Gaps before the 2nd and 3rd of the allowed 3 connect attempts (§4.4).
const CONNECT_BACKOFFS: [Duration; 2] = [Duration::from_millis(100), Duration::from_millis(200)];
const CONNECT_ATTEMPTS: usize = 3;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
const RTP_MIN_LEN: usize = 12;

/// States driven by the handshake; see SPEC_FULL.md §4.3 for the full
/// transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Connected,
    OptionsOk,
    DescribeOk,
    SetupVideoOk,
    SetupAudioOk,
    SetupAudioFailed,
    Playing,
    Closing,
    Closed,
}

/// Attempts up to three TCP connects with exponential backoff, returning the
/// established stream and the latency of the successful attempt (§4.4 step
/// 1). Cancellable between attempts.
pub async fn connect_with_backoff(addr: &str, cancel: &CancellationToken) -> Result<(TcpStream, Duration), Error> {
    let sockaddr: std::net::SocketAddr = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        resolved = resolve(addr) => resolved?,
    };

    let mut last_err = None;
    for attempt in 0..CONNECT_ATTEMPTS {
        if attempt > 0 {
            let backoff = CONNECT_BACKOFFS[attempt - 1];
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(sockaddr)) => r,
        };

        match result {
            Ok(Ok(stream)) => return Ok((stream, start.elapsed())),
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => last_err = Some(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")),
        }
    }

    Err(Error::TransientNetwork {
        addr: sockaddr,
        source: last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "connect failed")),
    })
}

async fn resolve(addr: &str) -> Result<std::net::SocketAddr, Error> {
    tokio::net::lookup_host(addr)
        .await
        .ok()
        .and_then(|mut it| it.next())
        .ok_or_else(|| Error::ProtocolError { method: "connect", description: format!("could not resolve {addr}") })
}

/// A single established RTSP session, from `OPTIONS` through `TEARDOWN`.
pub struct Session {
    state: State,
    /// Shared with the keep-alive task so CSeq stays monotonic across both
    /// writers on the control connection.
    cseq: Arc<AtomicU64>,
    session_id: Option<String>,
    uri_base: String,
    control_read: BufReader<OwnedReadHalf>,
    control_write: std::sync::Arc<Mutex<OwnedWriteHalf>>,
    video_tracker: SequenceTracker,
    audio_tracker: Option<SequenceTracker>,
    video_sockets: Option<UdpTrackSockets>,
    closed: bool,
    aggregator: Aggregator,
}

impl Session {
    /// Drives a full session to completion on an already-connected TCP
    /// stream: handshake, keep-alives, media loop until `deadline` or
    /// `cancel`, then best-effort teardown.
    pub async fn run(stream: TcpStream, config: SessionConfig, deadline: Duration, cancel: CancellationToken) -> Result<(), Error> {
        let (read_half, write_half) = stream.into_split();
        let mut session = Session {
            state: State::Connected,
            cseq: Arc::new(AtomicU64::new(1)),
            session_id: None,
            uri_base: config.url.to_string(),
            control_read: BufReader::with_capacity(CONTROL_BUFFER_CAPACITY, read_half),
            control_write: std::sync::Arc::new(Mutex::new(write_half)),
            video_tracker: SequenceTracker::new(),
            audio_tracker: None,
            video_sockets: None,
            closed: false,
            aggregator: config.aggregator.clone(),
        };

        let result = session.run_inner(&config, deadline, &cancel).await;

        session.teardown_best_effort().await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_benign_termination() => Err(e),
            Err(e) => Err(e),
        }
    }

    async fn run_inner(&mut self, config: &SessionConfig, deadline: Duration, cancel: &CancellationToken) -> Result<(), Error> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = self.handshake(config) => r?,
        }

        let session_cancel = cancel.child_token();
        let keepalive_cancel = session_cancel.clone();
        let keepalive_write = self.control_write.clone();
        let keepalive_cseq = self.cseq.clone();
        let uri = self.uri_base.clone();
        let session_id = self.session_id.clone().unwrap_or_default();
        let keepalive_failed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let keepalive_failed_writer = keepalive_failed.clone();

        let keepalive_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = keepalive_cancel.cancelled() => return,
                    _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {}
                }
                let cseq = keepalive_cseq.fetch_add(1, Ordering::Relaxed);
                let req = build_request(Method::GetParameter, &uri, cseq, &[("Session", &session_id)]);
                let mut guard = keepalive_write.lock().await;
                if let Err(e) = guard.write_all(&req).await {
                    warn!("keep-alive write failed: {e}");
                    keepalive_failed_writer.store(true, std::sync::atomic::Ordering::Relaxed);
                    return;
                }
                if let Err(e) = guard.flush().await {
                    warn!("keep-alive flush failed: {e}");
                    keepalive_failed_writer.store(true, std::sync::atomic::Ordering::Relaxed);
                    return;
                }
            }
        });

        self.state = State::Playing;
        let media_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(deadline) => Err(Error::DeadlineExceeded),
            r = self.media_loop(config) => r,
        };

        session_cancel.cancel();
        keepalive_task.abort();

        if keepalive_failed.load(std::sync::atomic::Ordering::Relaxed) {
            if let Err(ref e) = media_result {
                if e.is_benign_termination() {
                    return Err(Error::MediaError(MediaErrorKind::KeepAlive(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "keep-alive channel closed",
                    ))));
                }
            }
        }

        self.state = State::Closing;
        media_result
    }

    async fn handshake(&mut self, config: &SessionConfig) -> Result<(), Error> {
        self.send_options().await?;
        self.state = State::OptionsOk;

        self.send_describe().await?;
        self.state = State::DescribeOk;

        let video_transport = match config.transport {
            Transport::TcpInterleaved => "RTP/AVP/TCP;unicast;interleaved=0-1".to_string(),
            Transport::UdpUnicast => {
                let sockets = UdpTrackSockets::bind().await.map_err(|e| Error::TransientNetwork {
                    addr: "0.0.0.0:0".parse().unwrap(),
                    source: e,
                })?;
                let header = format!("RTP/AVP;unicast;{}", sockets.client_port_header_value());
                self.video_sockets = Some(sockets);
                header
            }
        };
        let resp = self.send_setup(0, &video_transport, None).await?;
        check_status(Method::Setup, &resp)?;
        self.session_id = resp.session_id();
        if let (Transport::UdpUnicast, Some(sockets)) = (config.transport, self.video_sockets.as_ref()) {
            self.connect_udp_if_announced(&resp, sockets).await;
        }
        self.state = State::SetupVideoOk;

        let audio_transport = match config.transport {
            Transport::TcpInterleaved => "RTP/AVP/TCP;unicast;interleaved=2-3".to_string(),
            Transport::UdpUnicast => {
                let sockets = self.video_sockets.as_ref().expect("video sockets bound above");
                format!("RTP/AVP;unicast;{}", sockets.client_port_header_value())
            }
        };
        match self.send_setup(1, &audio_transport, self.session_id.as_deref()).await {
            Ok(resp) if check_status(Method::Setup, &resp).is_ok() => {
                self.audio_tracker = Some(SequenceTracker::new());
                self.state = State::SetupAudioOk;
            }
            _ => {
                self.state = State::SetupAudioFailed;
            }
        }

        self.send_play().await?;
        Ok(())
    }

    async fn send_options(&mut self) -> Result<(), Error> {
        let resp = self.request(Method::Options, &self.uri_base.clone(), &[]).await?;
        check_status(Method::Options, &resp)
    }

    async fn send_describe(&mut self) -> Result<(), Error> {
        let resp = self.request(Method::Describe, &self.uri_base.clone(), &[("Accept", "application/sdp")]).await?;
        check_status(Method::Describe, &resp)
        // Body intentionally unparsed (§4.3): tracks are assumed trackID=0/1.
    }

    async fn send_setup(&mut self, track: u32, transport_header: &str, session: Option<&str>) -> Result<Response, Error> {
        let uri = format!("{}/trackID={}", self.uri_base, track);
        let mut headers = vec![("Transport", transport_header)];
        if let Some(id) = session {
            headers.push(("Session", id));
        }
        self.request(Method::Setup, &uri, &headers).await
    }

    async fn send_play(&mut self) -> Result<(), Error> {
        let session_id = self.session_id.clone().unwrap_or_default();
        let resp = self
            .request(Method::Play, &self.uri_base.clone(), &[("Session", &session_id), ("Range", "npt=0.000-")])
            .await?;
        check_status(Method::Play, &resp)
    }

    async fn connect_udp_if_announced(&self, resp: &Response, sockets: &UdpTrackSockets) {
        let Some(transport_value) = resp.header("Transport") else { return };
        let Some((rtp_port, rtcp_port)) = parse_transport_header(transport_value).server_port else { return };
        let Some(server_host) = self.server_host() else { return };
        if let Err(e) = sockets.connect(server_host, rtp_port, rtcp_port).await {
            warn!("UDP connect() to server_port failed, falling back to unconnected: {e}");
        }
    }

    fn server_host(&self) -> Option<std::net::IpAddr> {
        url::Url::parse(&self.uri_base).ok()?.host_str()?.parse().ok()
    }

    /// Sends one request and reads its response. Requests are never
    /// pipelined: the write-then-read pair holds the write lock for the
    /// duration of the write only, matching the ordering guarantee in §5
    /// (only one outstanding request at a time during the handshake, since
    /// the handshake itself runs sequentially on this task).
    async fn request(&mut self, method: Method, uri: &str, extra_headers: &[(&str, &str)]) -> Result<Response, Error> {
        let cseq = self.cseq.fetch_add(1, Ordering::Relaxed);
        let req = build_request(method, uri, cseq, extra_headers);
        {
            let mut guard = self.control_write.lock().await;
            write_request(&mut *guard, &req).await.map_err(|e| Error::TransientNetwork {
                addr: "0.0.0.0:0".parse().unwrap(),
                source: e,
            })?;
        }
        read_response(&mut self.control_read).await
    }

    async fn media_loop(&mut self, config: &SessionConfig) -> Result<(), Error> {
        match config.transport {
            Transport::TcpInterleaved => self.media_loop_tcp().await,
            Transport::UdpUnicast => self.media_loop_udp().await,
        }
    }

    async fn media_loop_tcp(&mut self) -> Result<(), Error> {
        let mut reader = InterleavedReader::new();
        loop {
            let frame = reader.read_frame(&mut self.control_read).await?;
            if !crate::rtsp::interleave::is_rtp_channel(frame.channel) {
                continue; // RTCP, discarded
            }
            if frame.payload.len() < RTP_MIN_LEN {
                continue;
            }
            let tracker = if frame.channel == 0 {
                Some(&mut self.video_tracker)
            } else {
                self.audio_tracker.as_mut()
            };
            if let Some(tracker) = tracker {
                process_rtp(tracker, &frame.payload, &self.aggregator);
            }
        }
    }

    async fn media_loop_udp(&mut self) -> Result<(), Error> {
        let sockets = self.video_sockets.take().ok_or_else(|| Error::ProtocolError {
            method: "SETUP",
            description: "UDP sockets were never bound".into(),
        })?;
        let mut buf = vec![0u8; UDP_READ_BUFFER];
        let mut rr_interval = tokio::time::interval(RTCP_RR_INTERVAL);
        let mut since_packets = 0u64;
        let mut since_lost = 0u64;

        // Opportunistically drains keep-alive responses arriving on the
        // idle control connection. `read_response` builds on `read_line`,
        // which is not cancellation-safe, so the future is kept alive
        // across polls instead of being re-created every loop iteration —
        // losing a `select!` race must not discard bytes it already
        // pulled out of the reader.
        let mut control_read_fut = Box::pin(read_response(&mut self.control_read));

        loop {
            tokio::select! {
                biased;
                _ = rr_interval.tick() => {
                    transport::send_receiver_report(&sockets.rtcp, &self.video_tracker, since_packets, since_lost).await;
                    since_packets = self.video_tracker.total_packets();
                    since_lost = self.video_tracker.total_lost();
                }
                r = tokio::time::timeout(UDP_READ_DEADLINE, sockets.rtp.recv_from(&mut buf)) => {
                    match r {
                        Ok(Ok((n, _from))) if n >= RTP_MIN_LEN => {
                            process_rtp(&mut self.video_tracker, &buf[..n], &self.aggregator);
                        }
                        Ok(Ok(_)) => {} // too short, drop
                        Ok(Err(e)) => return Err(transport::io_to_media_error(e)),
                        Err(_) => { debug!("UDP read deadline elapsed, refreshing"); }
                    }
                }
                r = &mut control_read_fut => {
                    if let Err(e) = r {
                        debug!("control channel read during UDP playback ended: {e}");
                    }
                    control_read_fut = Box::pin(read_response(&mut self.control_read));
                }
            }
        }
    }

    async fn teardown_best_effort(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let Some(session_id) = self.session_id.clone() else { return };
        let cseq = self.cseq.fetch_add(1, Ordering::Relaxed);
        let req = build_request(Method::Teardown, &self.uri_base.clone(), cseq, &[("Session", &session_id)]);
        let mut guard = self.control_write.lock().await;
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            let _ = write_request(&mut *guard, &req).await;
        })
        .await;
        self.state = State::Closed;
    }
}

fn process_rtp(tracker: &mut SequenceTracker, payload: &[u8], aggregator: &Aggregator) {
    let seq = u16::from_be_bytes([payload[2], payload[3]]);
    let lost = tracker.push(seq);
    if lost > 0 {
        aggregator.add_loss(lost);
    }
    aggregator.add_packets(1);
    aggregator.add_bytes(payload.len() as u64);
}
