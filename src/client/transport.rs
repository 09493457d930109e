//! Transport-specific pieces of a session: UDP socket pair setup, `Transport:`
//! header parsing, and the outgoing RTCP receiver report.

use std::net::SocketAddr;
use std::time::Duration;

use log::warn;
use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::{Error, MediaErrorKind};
use crate::rtp::SequenceTracker;

/// Minimum receive buffer for media datagram sockets (§3).
pub const UDP_RECV_BUFFER_MIN: usize = 2 << 20;

/// Read-loop buffer for a single UDP datagram (§4.3).
pub const UDP_READ_BUFFER: usize = 64 * 1024;

pub const UDP_READ_DEADLINE: Duration = Duration::from_secs(30);

/// RTCP receiver-report cadence for UDP sessions (§4.3 redesign).
pub const RTCP_RR_INTERVAL: Duration = Duration::from_secs(5);

/// A bound RTP/RTCP datagram socket pair for one track, plus the server
/// address they should be `connect()`-ed to once learned from the SETUP
/// response.
pub struct UdpTrackSockets {
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
    pub client_rtp_port: u16,
    pub client_rtcp_port: u16,
}

impl UdpTrackSockets {
    /// Binds a consecutive RTP/RTCP port pair (RTP even, RTCP = RTP + 1 is
    /// the convention, but we don't depend on it: we bind two independent
    /// ephemeral ports and report whatever the OS gave us).
    pub async fn bind() -> std::io::Result<Self> {
        let rtp = bind_with_large_buffer("0.0.0.0:0").await?;
        let rtcp = bind_with_large_buffer("0.0.0.0:0").await?;
        let client_rtp_port = rtp.local_addr()?.port();
        let client_rtcp_port = rtcp.local_addr()?.port();
        Ok(Self { rtp, rtcp, client_rtp_port, client_rtcp_port })
    }

    /// `connect()`s both sockets to the server-announced ports, so the OS
    /// filters out datagrams from anyone but the target server.
    pub async fn connect(&self, server_host: std::net::IpAddr, server_rtp_port: u16, server_rtcp_port: u16) -> std::io::Result<()> {
        self.rtp.connect(SocketAddr::new(server_host, server_rtp_port)).await?;
        self.rtcp.connect(SocketAddr::new(server_host, server_rtcp_port)).await?;
        Ok(())
    }

    pub fn client_port_header_value(&self) -> String {
        format!("client_port={}-{}", self.client_rtp_port, self.client_rtcp_port)
    }
}

async fn bind_with_large_buffer(addr: &str) -> std::io::Result<UdpSocket> {
    let std_addr: SocketAddr = addr.parse().expect("literal bind address");
    let socket = Socket::new(Domain::for_address(std_addr), Type::DGRAM, None)?;
    socket.set_nonblocking(true)?;
    socket.bind(&std_addr.into())?;
    if let Err(e) = socket.set_recv_buffer_size(UDP_RECV_BUFFER_MIN) {
        warn!("failed to raise UDP receive buffer to {UDP_RECV_BUFFER_MIN}: {e}");
    }
    UdpSocket::from_std(socket.into())
}

/// The subset of a SETUP response's `Transport:` header this crate reads:
/// `server_port=<rtp>-<rtcp>`, if present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTransport {
    pub server_port: Option<(u16, u16)>,
}

pub fn parse_transport_header(value: &str) -> ParsedTransport {
    for param in value.split(';') {
        let param = param.trim();
        if let Some(ports) = param.strip_prefix("server_port=") {
            if let Some((lo, hi)) = ports.split_once('-') {
                if let (Ok(lo), Ok(hi)) = (lo.parse(), hi.parse()) {
                    return ParsedTransport { server_port: Some((lo, hi)) };
                }
            }
        }
    }
    ParsedTransport { server_port: None }
}

/// Builds a minimal write-only RTCP receiver report: version 2, no sender
/// info, one report block with SSRC 0 (this client never learns the real
/// SSRC), fraction/cumulative loss and the extended highest sequence number
/// pulled from the tracker.
pub fn build_receiver_report(tracker: &SequenceTracker, since_packets: u64, since_lost: u64) -> Vec<u8> {
    let fraction_lost = tracker.fraction_lost(since_packets, since_lost);
    let cumulative_lost = (tracker.total_lost() - since_lost).min(0x00FF_FFFF) as u32;
    let ext_highest = tracker.max_seq_extended();

    let mut pkt = Vec::with_capacity(32);
    pkt.push(0x80 | 0x01); // version 2, padding 0, RC = 1
    pkt.push(201); // RR
    let length_words: u16 = 7; // (header + 1 report block) / 4 - 1
    pkt.extend_from_slice(&length_words.to_be_bytes());
    pkt.extend_from_slice(&0u32.to_be_bytes()); // sender SSRC (unknown, 0)
    pkt.extend_from_slice(&0u32.to_be_bytes()); // source SSRC (unknown, 0)
    pkt.push(fraction_lost);
    pkt.extend_from_slice(&cumulative_lost.to_be_bytes()[1..]); // 24-bit
    pkt.extend_from_slice(&ext_highest.to_be_bytes());
    pkt.extend_from_slice(&0u32.to_be_bytes()); // interarrival jitter
    pkt.extend_from_slice(&0u32.to_be_bytes()); // last SR
    pkt.extend_from_slice(&0u32.to_be_bytes()); // delay since last SR
    pkt
}

/// Sends the receiver report, logging but not failing the session on error
/// (§4.3: "Send failures are logged and otherwise ignored").
pub async fn send_receiver_report(socket: &UdpSocket, tracker: &SequenceTracker, since_packets: u64, since_lost: u64) {
    let pkt = build_receiver_report(tracker, since_packets, since_lost);
    if let Err(e) = socket.send(&pkt).await {
        warn!("RTCP RR send failed: {e}");
    }
}

pub fn io_to_media_error(e: std::io::Error) -> Error {
    Error::MediaError(MediaErrorKind::Io(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_port() {
        let t = parse_transport_header("RTP/AVP;unicast;client_port=5000-5001;server_port=6000-6001");
        assert_eq!(t.server_port, Some((6000, 6001)));
    }

    #[test]
    fn missing_server_port_is_none() {
        let t = parse_transport_header("RTP/AVP;unicast;client_port=5000-5001");
        assert_eq!(t.server_port, None);
    }

    #[test]
    fn receiver_report_has_rr_packet_type() {
        let mut t = SequenceTracker::new();
        t.push(10);
        t.push(12);
        let pkt = build_receiver_report(&t, 0, 0);
        assert_eq!(pkt[1], 201);
        assert_eq!(pkt.len(), 32);
    }
}
