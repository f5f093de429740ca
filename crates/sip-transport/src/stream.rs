//! Stream framing and per-connection sessions for TCP.

use std::net::SocketAddr;

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{InboundPacket, InboundSink, TransportKind};

/// Upper bound on buffered, not yet framed bytes for one connection.
pub const MAX_BUFFER_SIZE: usize = 256 * 1024;

/// Runs the read side of a stream connection until EOF, error or cancellation.
///
/// Writes queued on the returned channel are flushed by a companion task, so
/// responses to requests received here travel back on the same connection.
pub(crate) async fn run_stream_session<S>(
    peer: SocketAddr,
    stream: S,
    transport: TransportKind,
    sink: InboundSink,
    writer_tx: mpsc::Sender<Bytes>,
    mut writer_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let writer_handle = tokio::spawn(async move {
        while let Some(buf) = writer_rx.recv().await {
            if let Err(e) = writer.write_all(&buf).await {
                warn!(%peer, error = %e, "{} write error", transport.as_str());
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if buf.len() >= MAX_BUFFER_SIZE {
            warn!(%peer, buffer_size = buf.len(), "stream buffer limit exceeded, closing connection");
            break;
        }
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!(%peer, "{} connection closed by peer", transport.as_str());
                break;
            }
            Ok(_) => match drain_sip_frames(&mut buf) {
                Ok(frames) => {
                    for payload in frames {
                        sink(InboundPacket {
                            transport,
                            peer,
                            payload,
                            stream: Some(writer_tx.clone()),
                        });
                    }
                }
                Err(e) => {
                    warn!(%peer, error = %e, "framing error, closing connection");
                    break;
                }
            },
            Err(e) => {
                warn!(%peer, error = %e, "{} read error", transport.as_str());
                break;
            }
        }
    }

    drop(writer_tx);
    writer_handle.abort();
}

/// Splits buffered stream data into complete SIP messages using
/// `Content-Length`. Incomplete trailing data stays in `buf`.
pub fn drain_sip_frames(buf: &mut BytesMut) -> Result<Vec<Bytes>> {
    let mut frames = Vec::new();
    loop {
        // CRLF keep-alives (RFC 5626 §4.4.1) between messages.
        let leading = buf
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        if leading > 0 {
            let _ = buf.split_to(leading);
        }
        if buf.is_empty() {
            break;
        }

        let head_end = match memchr::memmem::find(buf.as_ref(), b"\r\n\r\n") {
            Some(pos) => pos,
            None => break,
        };

        let content_length = parse_content_length(&buf[..head_end]).unwrap_or(0);
        if content_length > MAX_BUFFER_SIZE {
            return Err(anyhow!("declared Content-Length {} too large", content_length));
        }
        let needed = head_end + 4 + content_length;
        if buf.len() < needed {
            break;
        }

        frames.push(buf.split_to(needed).freeze());
    }
    Ok(frames)
}

fn parse_content_length(headers: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(headers).ok()?;
    for line in text.lines() {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_multiple_frames_and_bodies() {
        let msg1 = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 4\r\n\r\nbody";
        let msg2 = b"SIP/2.0 200 OK\r\nl: 0\r\n\r\n";
        let payload = [msg1.as_slice(), msg2.as_slice()].concat();
        let mut buf = BytesMut::from(&payload[..]);
        let frames = drain_sip_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(buf.is_empty());
        assert_eq!(frames[0].as_ref(), msg1);
        assert_eq!(frames[1].as_ref(), msg2);
    }

    #[test]
    fn leaves_partial_body_in_buffer() {
        let payload = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 5\r\n\r\nhi";
        let mut buf = BytesMut::from(&payload[..]);
        let frames = drain_sip_frames(&mut buf).unwrap();
        assert!(frames.is_empty());
        assert_eq!(buf.len(), payload.len());
    }

    #[test]
    fn discards_crlf_keepalive() {
        let mut buf = BytesMut::from(&b"\r\n\r\nSIP/2.0 200 OK\r\n\r\n"[..]);
        let frames = drain_sip_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with(b"SIP/2.0"));
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_oversized_content_length() {
        let mut buf = BytesMut::from(&b"MESSAGE sip:a SIP/2.0\r\nContent-Length: 99999999\r\n\r\n"[..]);
        assert!(drain_sip_frames(&mut buf).is_err());
    }
}
