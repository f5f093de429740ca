// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test harness shared by the workspace: request/response builders, loopback
//! UDP and TCP peers for driving a running server and an in-memory log sink.
//!
//! # Example
//! ```
//! use sip_testkit::build_options;
//! let req = build_options("sip:test@example.com");
//! assert_eq!(req.method().as_str(), "OPTIONS");
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sip_core::{Headers, Method, Request, RequestLine, Response, SipMessage, SipUri, StatusLine};
use sip_parse::{parse_message, serialize_request, serialize_response};
use smol_str::SmolStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Default Via sent-by used by the builders.
pub const CLIENT_SENT_BY: &str = "client.example.com:5060";

fn push(headers: &mut Headers, name: &str, value: impl Into<SmolStr>) {
    headers.push(SmolStr::new(name), value.into());
}

/// Constructs a request with the usual dialog-less header set.
///
/// `sent_by` becomes the Via sent-by; `branch` its branch parameter.
pub fn build_request(method: Method, uri: &str, sent_by: &str, branch: &str) -> Request {
    let mut headers = Headers::new();
    push(
        &mut headers,
        "Via",
        format!("SIP/2.0/UDP {};branch={}", sent_by, branch),
    );
    push(&mut headers, "From", "<sip:alice@example.com>;tag=1234");
    push(&mut headers, "To", "<sip:bob@example.com>");
    push(&mut headers, "Call-ID", format!("{}@example.com", branch));
    push(&mut headers, "CSeq", format!("1 {}", method.as_str()));
    push(&mut headers, "Max-Forwards", "70");
    push(&mut headers, "Content-Length", "0");

    Request::new(
        RequestLine::new(method, SipUri::parse(uri).expect("valid test URI")),
        headers,
        Bytes::new(),
    )
    .expect("valid test request")
}

/// Constructs a minimal OPTIONS request for the provided URI string.
pub fn build_options(uri: &str) -> Request {
    build_request(Method::Options, uri, CLIENT_SENT_BY, "z9hG4bKtest")
}

/// Constructs a minimal INVITE request for the provided URI string.
pub fn build_invite(uri: &str, branch: &str, call_id: &str) -> Request {
    let mut req = build_request(Method::Invite, uri, CLIENT_SENT_BY, branch);
    req.headers_mut()
        .set(SmolStr::new("Call-ID"), SmolStr::new(call_id));
    push(
        req.headers_mut(),
        "Contact",
        "<sip:alice@client.example.com:5060>",
    );
    req
}

/// Constructs a REGISTER request binding `contact`.
pub fn build_register(uri: &str, contact: &str) -> Request {
    let mut req = build_request(Method::Register, uri, CLIENT_SENT_BY, "z9hG4bKreg");
    req.headers_mut()
        .set(SmolStr::new("To"), SmolStr::new("<sip:alice@example.com>"));
    push(req.headers_mut(), "Contact", format!("<{}>", contact));
    push(req.headers_mut(), "Expires", "3600");
    req
}

/// ACK for a non-2xx final response to `invite` (same branch, RFC 3261 §17.1.1.3).
pub fn build_ack_for(invite: &Request, response: &Response) -> Request {
    let mut headers = Headers::new();
    if let Some(via) = invite.headers().top_via() {
        push(&mut headers, "Via", via.to_string());
    }
    for name in ["From", "Call-ID"] {
        if let Some(value) = invite.headers().get(name) {
            push(&mut headers, name, value.clone());
        }
    }
    if let Some(to) = response.headers().get("To") {
        push(&mut headers, "To", to.clone());
    }
    let seq = invite
        .headers()
        .get("CSeq")
        .and_then(|v| v.split_whitespace().next())
        .unwrap_or("1")
        .to_owned();
    push(&mut headers, "CSeq", format!("{} ACK", seq));
    push(&mut headers, "Max-Forwards", "70");

    Request::new(
        RequestLine::new(Method::Ack, invite.uri().clone()),
        headers,
        Bytes::new(),
    )
    .expect("valid ACK")
}

/// Constructs a bare response with a single Via and dialog headers.
pub fn build_response(code: u16, reason: &str) -> Response {
    let mut headers = Headers::new();
    push(
        &mut headers,
        "Via",
        format!("SIP/2.0/UDP {};branch=z9hG4bKtest", CLIENT_SENT_BY),
    );
    push(&mut headers, "From", "<sip:alice@example.com>;tag=1234");
    push(&mut headers, "To", "<sip:bob@example.com>;tag=5678");
    push(&mut headers, "Call-ID", "test-callid@example.com");
    push(&mut headers, "CSeq", "1 OPTIONS");

    Response::new(
        StatusLine::new(code, reason).expect("valid status line"),
        headers,
        Bytes::new(),
    )
    .expect("valid test response")
}

/// Serializes a request to wire bytes.
pub fn as_bytes(request: &Request) -> Bytes {
    serialize_request(request)
}

/// Serializes a response to wire bytes.
pub fn response_as_bytes(response: &Response) -> Bytes {
    serialize_response(response)
}

/// Loopback UDP endpoint playing the remote side of a test.
pub struct UdpPeer {
    socket: UdpSocket,
}

impl UdpPeer {
    pub async fn bind() -> std::io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind("127.0.0.1:0").await?,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket
            .local_addr()
            .expect("bound socket has a local address")
    }

    /// `host:port` of this peer, for use as a Via sent-by.
    pub fn sent_by(&self) -> String {
        self.local_addr().to_string()
    }

    pub async fn send(&self, data: &[u8], to: SocketAddr) -> std::io::Result<()> {
        self.socket.send_to(data, to).await.map(|_| ())
    }

    pub async fn send_request(&self, req: &Request, to: SocketAddr) -> std::io::Result<()> {
        self.send(&serialize_request(req), to).await
    }

    /// Waits up to `timeout` for the next parseable message.
    pub async fn recv(&self, timeout: Duration) -> Option<(SipMessage, SocketAddr)> {
        let mut buf = vec![0u8; 65_535];
        let (n, from) = tokio::time::timeout(timeout, self.socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        let msg = parse_message(&Bytes::copy_from_slice(&buf[..n]))?;
        Some((msg, from))
    }

    /// Like [`UdpPeer::recv`] but only accepts responses.
    pub async fn recv_response(&self, timeout: Duration) -> Option<Response> {
        match self.recv(timeout).await? {
            (SipMessage::Response(res), _) => Some(res),
            _ => None,
        }
    }
}

/// Loopback TCP connection playing the remote side of a test. Responses come
/// back on the same connection.
pub struct TcpPeer {
    stream: TcpStream,
    buf: BytesMut,
}

impl TcpPeer {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(addr).await?,
            buf: BytesMut::with_capacity(4096),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.stream
            .local_addr()
            .expect("connected stream has a local address")
    }

    /// `host:port` of this peer, for use as a Via sent-by.
    pub fn sent_by(&self) -> String {
        self.local_addr().to_string()
    }

    /// Sends `req` with its top Via switched to `SIP/2.0/TCP`.
    pub async fn send_request(&mut self, req: &Request) -> std::io::Result<()> {
        let mut req = req.clone();
        if let Some(mut via) = req.headers().top_via() {
            via.transport = SmolStr::new("TCP");
            req.headers_mut().replace_top_via(&via);
        }
        self.stream.write_all(&serialize_request(&req)).await?;
        self.stream.flush().await
    }

    /// Waits up to `timeout` for the next complete, parseable message.
    pub async fn recv(&mut self, timeout: Duration) -> Option<SipMessage> {
        tokio::time::timeout(timeout, async {
            loop {
                if let Some(frame) = next_frame(&mut self.buf) {
                    return parse_message(&frame);
                }
                match self.stream.read_buf(&mut self.buf).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        })
        .await
        .ok()?
    }

    /// Like [`TcpPeer::recv`] but only accepts responses.
    pub async fn recv_response(&mut self, timeout: Duration) -> Option<Response> {
        match self.recv(timeout).await? {
            SipMessage::Response(res) => Some(res),
            _ => None,
        }
    }
}

/// Splits one `Content-Length` framed message off the front of `buf`.
fn next_frame(buf: &mut BytesMut) -> Option<Bytes> {
    let head_end = buf.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&buf[..head_end]).ok()?;
    let body_len = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| {
            let name = name.trim();
            name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l")
        })
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let needed = head_end + 4 + body_len;
    (buf.len() >= needed).then(|| buf.split_to(needed).freeze())
}

/// Polls `check` every few milliseconds until it returns `Some` or `timeout`
/// elapses. Useful for waiting on listeners started in the background.
pub async fn wait_for<T, F>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// In-memory log sink. Pass [`LogCapture::dispatch`] to code under test and
/// inspect what it logged.
#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher recording events at DEBUG and above, without ANSI colors.
    pub fn dispatch(&self) -> tracing::Dispatch {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::Dispatch::new(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().expect("log buffer poisoned")).into_owned()
    }

    /// Number of log lines containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.contents().lines().filter(|l| l.contains(needle)).count()
    }

    /// Index of the first log line containing `needle`.
    pub fn line_of(&self, needle: &str) -> Option<usize> {
        self.contents().lines().position(|l| l.contains(needle))
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf
            .lock()
            .expect("log buffer poisoned")
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
