//! Request/response framing for the RTSP 1.0 subset this crate drives.
//!
//! See [RFC 2326 §4](https://datatracker.ietf.org/doc/html/rfc2326#section-4) for the
//! full grammar; only the pieces needed to drive MediaMTX/GStreamer are
//! implemented here.

use std::fmt;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, MediaErrorKind};

pub const USER_AGENT: &str = concat!("rtsp-bench/", env!("CARGO_PKG_VERSION"));

/// Control read buffer floor (§3: "large read buffer ... SHOULD be at least
/// 1 MiB"). This is a capacity hint for the buffered reader, not a hard cap:
/// the line/body loops below grow past it for oversized SDP bodies.
pub const CONTROL_BUFFER_CAPACITY: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    GetParameter,
    Teardown,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::GetParameter => "GET_PARAMETER",
            Method::Teardown => "TEARDOWN",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed RTSP response.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Strips everything from the first `;` onward, per §6's rule for
    /// extracting `session-id` from the `Session:` header.
    pub fn session_id(&self) -> Option<String> {
        self.header("Session")
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
    }
}

/// Serializes one request: request line, `CSeq`, `User-Agent`, caller
/// headers, blank line. No pipelining: callers must await the matching
/// response before sending another request on the same connection.
pub fn build_request(method: Method, uri: &str, cseq: u64, extra_headers: &[(&str, &str)]) -> Vec<u8> {
    let mut out = format!("{} {} RTSP/1.0\r\n", method, uri).into_bytes();
    out.extend_from_slice(format!("CSeq: {}\r\n", cseq).as_bytes());
    out.extend_from_slice(format!("User-Agent: {}\r\n", USER_AGENT).as_bytes());
    for (name, value) in extra_headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Writes `req` to `writer` in one call; the caller is responsible for
/// serializing writes to the control channel (§5: no pipelining).
pub async fn write_request<W>(writer: &mut W, req: &[u8]) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.write_all(req).await?;
    writer.flush().await
}

/// Reads one full response: the status line, headers until a blank line,
/// then exactly `Content-Length` body bytes if that header was present.
///
/// Loops on partial line fills so that header lines or SDP bodies larger
/// than the reader's initial buffer fill are tolerated (§4.3's "long-line
/// tolerance").
pub async fn read_response<R>(reader: &mut R) -> Result<Response, Error>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let status_line = read_line(reader).await?;
    let status_line = status_line.trim_end();
    if !status_line.starts_with("RTSP/1.0") {
        return Err(Error::ProtocolError {
            method: "response",
            description: format!("unexpected status line: {:?}", status_line),
        });
    }

    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next();
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::ProtocolError {
            method: "response",
            description: format!("malformed status line: {:?}", status_line),
        })?;
    let reason = parts.next().unwrap_or("").to_string();

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader).await?;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let body = if content_length > 0 {
        let mut buf = BytesMut::zeroed(content_length);
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| Error::MediaError(MediaErrorKind::Io(e)))?;
        buf.freeze()
    } else {
        Bytes::new()
    };

    Ok(Response { status, reason, headers, body })
}

async fn read_line<R>(reader: &mut R) -> Result<String, Error>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut total = 0usize;
    loop {
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| Error::MediaError(MediaErrorKind::Io(e)))?;
        if n == 0 {
            return Err(Error::ProtocolError {
                method: "response",
                description: "connection closed mid-response".into(),
            });
        }
        total += n;
        if line.ends_with('\n') {
            return Ok(line);
        }
        // Partial line fill (buffer boundary); keep reading into the same
        // string until the terminator shows up.
        debug_assert!(total > 0);
    }
}

/// Fails the handshake if `resp.status >= 400`, per §4.3.
pub fn check_status(method: Method, resp: &Response) -> Result<(), Error> {
    if resp.status >= 400 {
        return Err(Error::ProtocolError {
            method: method.as_str(),
            description: format!("{} {}", resp.status, resp.reason),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_request_with_required_headers() {
        let req = build_request(Method::Options, "rtsp://h/x", 1, &[]);
        let s = String::from_utf8(req).unwrap();
        assert!(s.starts_with("OPTIONS rtsp://h/x RTSP/1.0\r\n"));
        assert!(s.contains("CSeq: 1\r\n"));
        assert!(s.contains(&format!("User-Agent: {}\r\n", USER_AGENT)));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn extra_headers_are_included_in_order() {
        let req = build_request(Method::Setup, "rtsp://h/x/trackID=0", 3, &[("Session", "abc"), ("Transport", "RTP/AVP;unicast")]);
        let s = String::from_utf8(req).unwrap();
        let session_pos = s.find("Session: abc").unwrap();
        let transport_pos = s.find("Transport: RTP/AVP;unicast").unwrap();
        assert!(session_pos < transport_pos);
    }

    #[tokio::test]
    async fn reads_response_with_body() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 5\r\n\r\nhello";
        let mut reader = tokio::io::BufReader::new(&raw[..]);
        let resp = read_response(&mut reader).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.header("CSeq"), Some("1"));
        assert_eq!(&resp.body[..], b"hello");
    }

    #[tokio::test]
    async fn session_id_strips_parameters() {
        let raw = b"RTSP/1.0 200 OK\r\nSession: abc123;timeout=60\r\n\r\n";
        let mut reader = tokio::io::BufReader::new(&raw[..]);
        let resp = read_response(&mut reader).await.unwrap();
        assert_eq!(resp.session_id().as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn status_ge_400_is_protocol_error() {
        let raw = b"RTSP/1.0 404 Not Found\r\n\r\n";
        let mut reader = tokio::io::BufReader::new(&raw[..]);
        let resp = read_response(&mut reader).await.unwrap();
        assert!(check_status(Method::Describe, &resp).is_err());
    }
}
