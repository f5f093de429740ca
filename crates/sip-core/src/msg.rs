// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::SocketAddr;

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{headers::Headers, method::Method, uri::SipUri, version::SipVersion};

const MAX_REASON_LENGTH: usize = 256;
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Headers a UAS copies from a request into every response it builds
/// (RFC 3261 §8.2.6.2).
const RESPONSE_COPIED_HEADERS: [&str; 4] = ["From", "To", "Call-ID", "CSeq"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    InvalidStatusCode { code: u16 },
    ReasonTooLong { max: usize, actual: usize },
    InvalidReason(String),
    BodyTooLarge { max: usize, actual: usize },
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidStatusCode { code } => {
                write!(f, "invalid SIP status code: {} (must be 100-699)", code)
            }
            Self::ReasonTooLong { max, actual } => {
                write!(f, "reason phrase too long (max {}, got {})", max, actual)
            }
            Self::InvalidReason(msg) => write!(f, "invalid reason phrase: {}", msg),
            Self::BodyTooLarge { max, actual } => {
                write!(f, "body too large (max {}, got {})", max, actual)
            }
        }
    }
}

impl std::error::Error for MessageError {}

/// First line of a SIP request.
///
/// Per RFC 3261, the request line has the format:
/// `Method SP Request-URI SP SIP-Version CRLF`
///
/// # Examples
///
/// ```
/// use sip_core::{RequestLine, Method, SipUri};
///
/// let uri = SipUri::parse("sip:bob@example.com").unwrap();
/// let request_line = RequestLine::new(Method::Invite, uri);
/// assert_eq!(request_line.method(), &Method::Invite);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    method: Method,
    uri: SipUri,
    version: SipVersion,
}

impl RequestLine {
    /// Creates a request line for the given method and target URI.
    ///
    /// Defaults to SIP/2.0 as the version.
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self {
            method,
            uri,
            version: SipVersion::V2,
        }
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request URI.
    pub fn uri(&self) -> &SipUri {
        &self.uri
    }

    /// Returns the SIP version.
    pub fn version(&self) -> &SipVersion {
        &self.version
    }

    /// Sets the request URI.
    pub fn set_uri(&mut self, uri: SipUri) {
        self.uri = uri;
    }

    /// Consumes self and returns the components.
    pub fn into_parts(self) -> (Method, SipUri, SipVersion) {
        (self.method, self.uri, self.version)
    }
}

/// First line of a SIP response.
///
/// Per RFC 3261, the status line has the format:
/// `SIP-Version SP Status-Code SP Reason-Phrase CRLF`
///
/// # Security
///
/// StatusLine validates the status code and reason phrase to prevent:
/// - Invalid status codes outside the SIP range (100-699)
/// - CRLF injection in reason phrases
/// - Excessive length reason phrases
///
/// # Examples
///
/// ```
/// use sip_core::StatusLine;
///
/// let status = StatusLine::new(200, "OK").unwrap();
/// assert_eq!(status.code(), 200);
/// assert_eq!(status.reason(), "OK");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    version: SipVersion,
    code: u16,
    reason: SmolStr,
}

impl StatusLine {
    /// Creates a status line with the provided code and reason phrase.
    ///
    /// # Errors
    ///
    /// Returns an error if the code is outside 100-699, or the reason phrase
    /// contains control characters or exceeds `MAX_REASON_LENGTH`.
    pub fn new(code: u16, reason: impl AsRef<str>) -> Result<Self, MessageError> {
        if !(100..=699).contains(&code) {
            return Err(MessageError::InvalidStatusCode { code });
        }

        let reason = reason.as_ref();
        validate_reason_phrase(reason)?;

        Ok(Self {
            version: SipVersion::V2,
            code,
            reason: SmolStr::new(reason),
        })
    }

    /// Returns the SIP version.
    pub fn version(&self) -> &SipVersion {
        &self.version
    }

    /// Returns the status code.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Returns the reason phrase.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Returns true if this is an informational response (1xx).
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true for any final response (200-699).
    pub fn is_final(&self) -> bool {
        self.code >= 200
    }
}

/// Where a message came from and where it is headed on the network.
///
/// Filled in by the transport when a message is received and consulted when
/// a message is written. Never serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct NetMeta {
    source: Option<SocketAddr>,
    destination: Option<SocketAddr>,
    transport: Option<SmolStr>,
}

/// In-memory representation of a SIP request message.
///
/// # Examples
///
/// ```
/// use sip_core::{Request, RequestLine, Method, SipUri, Headers};
/// use bytes::Bytes;
///
/// let uri = SipUri::parse("sip:bob@example.com").unwrap();
/// let request_line = RequestLine::new(Method::Invite, uri);
/// let request = Request::new(request_line, Headers::new(), Bytes::new()).unwrap();
/// assert_eq!(request.transport(), "UDP");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    start: RequestLine,
    headers: Headers,
    body: Bytes,
    net: NetMeta,
}

impl Request {
    /// Builds a request from its components.
    ///
    /// # Errors
    ///
    /// Returns an error if the body exceeds MAX_BODY_SIZE.
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;

        Ok(Self {
            start,
            headers,
            body,
            net: NetMeta::default(),
        })
    }

    /// Returns the request line.
    pub fn start_line(&self) -> &RequestLine {
        &self.start
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        self.start.method()
    }

    /// Returns the request URI.
    pub fn uri(&self) -> &SipUri {
        self.start.uri()
    }

    /// Returns the SIP version.
    pub fn version(&self) -> &SipVersion {
        self.start.version()
    }

    /// Returns the headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns a mutable reference to the headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the message body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Sets the request URI.
    pub fn set_uri(&mut self, uri: SipUri) {
        self.start.set_uri(uri);
    }

    /// Sets the message body.
    ///
    /// # Errors
    /// Returns an error if the body exceeds MAX_BODY_SIZE.
    pub fn set_body(&mut self, body: Bytes) -> Result<(), MessageError> {
        validate_body_size(&body)?;
        self.body = body;
        Ok(())
    }

    /// Address the request was received from, recorded by the transport.
    pub fn source(&self) -> Option<SocketAddr> {
        self.net.source
    }

    pub fn set_source(&mut self, addr: SocketAddr) {
        self.net.source = Some(addr);
    }

    /// Explicit next-hop address, overriding Route / Request-URI resolution.
    pub fn destination(&self) -> Option<SocketAddr> {
        self.net.destination
    }

    pub fn set_destination(&mut self, addr: SocketAddr) {
        self.net.destination = Some(addr);
    }

    /// Transport the request travels over, upper case.
    ///
    /// Falls back to the top Via transport, then to UDP.
    pub fn transport(&self) -> SmolStr {
        if let Some(transport) = &self.net.transport {
            return transport.clone();
        }
        self.headers
            .top_via()
            .map(|via| via.transport)
            .unwrap_or_else(|| SmolStr::new("UDP"))
    }

    pub fn set_transport(&mut self, transport: &str) {
        self.net.transport = Some(SmolStr::new(transport.to_ascii_uppercase()));
    }

    /// Observed source host and port. Uses the recorded network source and
    /// otherwise the top Via (`received`/`rport` before sent-by).
    pub fn source_host_port(&self) -> Option<(SmolStr, u16)> {
        if let Some(addr) = self.net.source {
            return Some((SmolStr::new(addr.ip().to_string()), addr.port()));
        }
        let via = self.headers.top_via()?;
        let host = via
            .received()
            .map(SmolStr::new)
            .unwrap_or_else(|| via.host.clone());
        let port = via.rport().or(via.port).unwrap_or(5060);
        Some((host, port))
    }

    /// Consumes self and returns the components.
    pub fn into_parts(self) -> (RequestLine, Headers, Bytes) {
        (self.start, self.headers, self.body)
    }
}

/// In-memory representation of a SIP response message.
///
/// # Examples
///
/// ```
/// use sip_core::{Response, StatusLine, Headers};
/// use bytes::Bytes;
///
/// let status_line = StatusLine::new(200, "OK").unwrap();
/// let response = Response::new(status_line, Headers::new(), Bytes::new()).unwrap();
/// assert!(response.is_success());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    start: StatusLine,
    headers: Headers,
    body: Bytes,
    net: NetMeta,
}

impl Response {
    /// Builds a response from its components.
    ///
    /// # Errors
    ///
    /// Returns an error if the body exceeds MAX_BODY_SIZE.
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;

        Ok(Self {
            start,
            headers,
            body,
            net: NetMeta::default(),
        })
    }

    /// Builds a response to `req`: all Via lines, then From/To/Call-ID/CSeq
    /// copied verbatim. Dialog creating 1xx/2xx answers also carry the
    /// Record-Route set (RFC 3261 §12.1.1).
    ///
    /// The response is addressed to the request's recorded source and keeps
    /// its transport.
    pub fn from_request(req: &Request, code: u16, reason: &str) -> Result<Self, MessageError> {
        let start = StatusLine::new(code, reason)?;
        let mut headers = Headers::new();
        for header in req.headers().iter() {
            if header.name.eq_ignore_ascii_case("Via") || header.name.eq_ignore_ascii_case("v") {
                headers.push(SmolStr::new("Via"), header.value.clone());
            }
        }
        if code > 100 && code < 300 {
            for value in req.headers().get_all("Record-Route") {
                headers.push(SmolStr::new("Record-Route"), value.clone());
            }
        }
        for name in RESPONSE_COPIED_HEADERS {
            if let Some(value) = req.headers().get(name) {
                headers.push(SmolStr::new(name), value.clone());
            }
        }

        let mut res = Self::new(start, headers, Bytes::new())?;
        res.net.destination = req.source();
        res.net.transport = Some(req.transport());
        Ok(res)
    }

    /// Returns the status line.
    pub fn start_line(&self) -> &StatusLine {
        &self.start
    }

    /// Returns the status code.
    pub fn code(&self) -> u16 {
        self.start.code()
    }

    /// Returns the reason phrase.
    pub fn reason(&self) -> &str {
        self.start.reason()
    }

    /// Returns the headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns a mutable reference to the headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the message body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns true if this is an informational response (1xx).
    pub fn is_provisional(&self) -> bool {
        self.start.is_provisional()
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        self.start.is_success()
    }

    /// Returns true for any final response (200-699).
    pub fn is_final(&self) -> bool {
        self.start.is_final()
    }

    /// Sets the message body.
    ///
    /// # Errors
    /// Returns an error if the body exceeds MAX_BODY_SIZE.
    pub fn set_body(&mut self, body: Bytes) -> Result<(), MessageError> {
        validate_body_size(&body)?;
        self.body = body;
        Ok(())
    }

    /// Address the response was received from, recorded by the transport.
    pub fn source(&self) -> Option<SocketAddr> {
        self.net.source
    }

    pub fn set_source(&mut self, addr: SocketAddr) {
        self.net.source = Some(addr);
    }

    /// Explicit next-hop address, overriding Via based routing.
    pub fn destination(&self) -> Option<SocketAddr> {
        self.net.destination
    }

    pub fn set_destination(&mut self, addr: SocketAddr) {
        self.net.destination = Some(addr);
    }

    /// Transport the response travels over; falls back to the top Via, then UDP.
    pub fn transport(&self) -> SmolStr {
        if let Some(transport) = &self.net.transport {
            return transport.clone();
        }
        self.headers
            .top_via()
            .map(|via| via.transport)
            .unwrap_or_else(|| SmolStr::new("UDP"))
    }

    pub fn set_transport(&mut self, transport: &str) {
        self.net.transport = Some(SmolStr::new(transport.to_ascii_uppercase()));
    }

    /// Consumes self and returns the components.
    pub fn into_parts(self) -> (StatusLine, Headers, Bytes) {
        (self.start, self.headers, self.body)
    }
}

/// Either a SIP request or response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    /// Returns true if this is a request.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    /// Returns true if this is a response.
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response(_))
    }

    /// Returns a reference to the request if this is a request.
    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(req) => Some(req),
            _ => None,
        }
    }

    /// Returns a reference to the response if this is a response.
    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(res) => Some(res),
            _ => None,
        }
    }

    /// Returns the headers regardless of message type.
    pub fn headers(&self) -> &Headers {
        match self {
            Self::Request(req) => req.headers(),
            Self::Response(res) => res.headers(),
        }
    }

    /// Returns the body regardless of message type.
    pub fn body(&self) -> &Bytes {
        match self {
            Self::Request(req) => req.body(),
            Self::Response(res) => res.body(),
        }
    }

    pub fn source(&self) -> Option<SocketAddr> {
        match self {
            Self::Request(req) => req.source(),
            Self::Response(res) => res.source(),
        }
    }

    pub fn set_source(&mut self, addr: SocketAddr) {
        match self {
            Self::Request(req) => req.set_source(addr),
            Self::Response(res) => res.set_source(addr),
        }
    }

    /// Explicit destination, when one was set.
    pub fn destination(&self) -> Option<SocketAddr> {
        match self {
            Self::Request(req) => req.destination(),
            Self::Response(res) => res.destination(),
        }
    }

    pub fn transport(&self) -> SmolStr {
        match self {
            Self::Request(req) => req.transport(),
            Self::Response(res) => res.transport(),
        }
    }

    pub fn set_transport(&mut self, transport: &str) {
        match self {
            Self::Request(req) => req.set_transport(transport),
            Self::Response(res) => res.set_transport(transport),
        }
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        Self::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(res: Response) -> Self {
        Self::Response(res)
    }
}

// Validation functions

fn validate_reason_phrase(reason: &str) -> Result<(), MessageError> {
    if reason.len() > MAX_REASON_LENGTH {
        return Err(MessageError::ReasonTooLong {
            max: MAX_REASON_LENGTH,
            actual: reason.len(),
        });
    }

    // Per RFC 3261, reason phrase is UTF8-TEXT which excludes control characters
    if reason.chars().any(|c| c.is_ascii_control()) {
        return Err(MessageError::InvalidReason(
            "contains control characters".to_string(),
        ));
    }

    Ok(())
}

fn validate_body_size(body: &Bytes) -> Result<(), MessageError> {
    if body.len() > MAX_BODY_SIZE {
        return Err(MessageError::BodyTooLarge {
            max: MAX_BODY_SIZE,
            actual: body.len(),
        });
    }
    Ok(())
}
