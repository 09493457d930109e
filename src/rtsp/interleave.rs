//! TCP interleaved RTP/RTCP framing: `0x24 | channel:u8 | length:u16_be | payload`.
//!
//! Channel mapping used here: 0/1 video RTP/RTCP, 2/3 audio RTP/RTCP; odd
//! channels are RTCP and discarded by the caller.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt};

use crate::error::{Error, MediaErrorKind};

/// Bound on consecutive non-`$` reads before the session is failed as
/// desynchronized (REDESIGN FLAGS: the legacy reader looped on this forever).
pub const MAX_CONSECUTIVE_RESYNC: u32 = 16;

pub const MARKER: u8 = 0x24; // b'$'

#[derive(Debug)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Bytes,
}

/// Reads interleaved frames off a buffered control-channel reader, discarding
/// unsolicited RTSP messages that appear between frames and bounding how many
/// of those it will tolerate in a row.
pub struct InterleavedReader {
    consecutive_non_marker: u32,
}

impl InterleavedReader {
    pub fn new() -> Self {
        Self { consecutive_non_marker: 0 }
    }

    /// Reads one interleaved frame, transparently skipping any unsolicited
    /// RTSP messages (lines not starting with `$`) found in between.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<InterleavedFrame, Error>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        loop {
            let marker = read_u8(reader).await?;
            if marker != MARKER {
                self.consecutive_non_marker += 1;
                if self.consecutive_non_marker > MAX_CONSECUTIVE_RESYNC {
                    return Err(Error::MediaError(MediaErrorKind::Resync {
                        consecutive: self.consecutive_non_marker,
                    }));
                }
                // Unsolicited RTSP message: consume the rest of the line and
                // keep looking for the next frame.
                discard_line(reader).await?;
                continue;
            }

            self.consecutive_non_marker = 0;
            let channel = read_u8(reader).await?;
            let len = u16::from_be_bytes([read_u8(reader).await?, read_u8(reader).await?]);

            let mut payload = BytesMut::zeroed(usize::from(len));
            reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| Error::MediaError(MediaErrorKind::Io(e)))?;

            return Ok(InterleavedFrame { channel, payload: payload.freeze() });
        }
    }
}

impl Default for InterleavedReader {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_u8<R>(reader: &mut R) -> Result<u8, Error>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut byte = [0u8; 1];
    reader
        .read_exact(&mut byte)
        .await
        .map_err(|e| Error::MediaError(MediaErrorKind::Io(e)))?;
    Ok(byte[0])
}

async fn discard_line<R>(reader: &mut R) -> Result<(), Error>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(|e| Error::MediaError(MediaErrorKind::Io(e)))?;
    Ok(())
}

/// Channel 0/2 (even, RTP) carry media; any payload shorter than a minimal
/// RTP header is dropped rather than handed to sequence tracking (§6).
pub fn is_rtp_channel(channel: u8) -> bool {
    channel % 2 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn frame(channel: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![MARKER, channel];
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[tokio::test]
    async fn reads_a_well_formed_frame() {
        let data = frame(0, &[1, 2, 3, 4]);
        let mut reader = BufReader::new(&data[..]);
        let mut r = InterleavedReader::new();
        let f = r.read_frame(&mut reader).await.unwrap();
        assert_eq!(f.channel, 0);
        assert_eq!(&f.payload[..], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn skips_one_unsolicited_message() {
        let mut data = b"RTSP/1.0 200 OK\r\n".to_vec();
        data.extend(frame(2, &[9, 9]));
        let mut reader = BufReader::new(&data[..]);
        let mut r = InterleavedReader::new();
        let f = r.read_frame(&mut reader).await.unwrap();
        assert_eq!(f.channel, 2);
        assert_eq!(&f.payload[..], &[9, 9]);
    }

    #[tokio::test]
    async fn fails_after_too_many_consecutive_non_markers() {
        let mut data = Vec::new();
        for _ in 0..(MAX_CONSECUTIVE_RESYNC + 2) {
            data.extend_from_slice(b"garbage line\r\n");
        }
        let mut reader = BufReader::new(&data[..]);
        let mut r = InterleavedReader::new();
        let err = r.read_frame(&mut reader).await.unwrap_err();
        match err {
            Error::MediaError(MediaErrorKind::Resync { consecutive }) => {
                assert!(consecutive > MAX_CONSECUTIVE_RESYNC);
            }
            other => panic!("expected Resync error, got {other:?}"),
        }
    }

    #[test]
    fn even_channels_are_rtp() {
        assert!(is_rtp_channel(0));
        assert!(is_rtp_channel(2));
        assert!(!is_rtp_channel(1));
        assert!(!is_rtp_channel(3));
    }
}
