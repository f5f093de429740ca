//! SIP wire codec: start lines via `nom`, header folding, compact names and
//! `Content-Length` aware body extraction.

use bytes::{Bytes, BytesMut};
use sip_core::{
    Headers, Method, Request, RequestLine, Response, SipMessage, SipUri, SipVersion, StatusLine,
};
use smol_str::SmolStr;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Parses a SIP request from raw network bytes.
pub fn parse_request(datagram: &Bytes) -> Option<Request> {
    parse_request_with_limit(datagram, DEFAULT_MAX_MESSAGE_SIZE)
}

/// Parses a SIP request with an explicit max size check.
pub fn parse_request_with_limit(datagram: &Bytes, max_size: usize) -> Option<Request> {
    if datagram.len() > max_size {
        return None;
    }
    let (head, body_bytes) = split_head_body(datagram)?;
    let mut lines = head.split("\r\n");
    let first = lines.next()?.trim();
    if first.is_empty() {
        return None;
    }

    let (method, uri) = parse_request_line(first)?;
    let headers = parse_headers(lines)?;
    let body = extract_body(body_bytes, &headers)?;
    if !cseq_matches(&headers, &method)? {
        return None;
    }

    Request::new(RequestLine::new(method, uri), headers, body).ok()
}

/// Parses a SIP response from raw network bytes.
pub fn parse_response(datagram: &Bytes) -> Option<Response> {
    if datagram.len() > DEFAULT_MAX_MESSAGE_SIZE {
        return None;
    }
    let (head, body_bytes) = split_head_body(datagram)?;
    let mut lines = head.split("\r\n");
    let first = lines.next()?.trim();
    if first.is_empty() {
        return None;
    }

    let status = parse_status_line(first)?;
    let headers = parse_headers(lines)?;
    let body = extract_body(body_bytes, &headers)?;

    Response::new(status, headers, body).ok()
}

/// Parses either message kind, deciding on the start line.
pub fn parse_message(datagram: &Bytes) -> Option<SipMessage> {
    let trimmed = datagram
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|start| &datagram[start..])?;
    if trimmed.len() >= 4 && trimmed[..4].eq_ignore_ascii_case(b"SIP/") {
        parse_response(datagram).map(SipMessage::Response)
    } else {
        parse_request(datagram).map(SipMessage::Request)
    }
}

/// Serializes a SIP request while normalising the `Content-Length` header.
pub fn serialize_request(req: &Request) -> Bytes {
    let mut buf = String::new();
    use std::fmt::Write;

    let _ = write!(
        buf,
        "{} {} {}\r\n",
        req.method().as_str(),
        req.uri(),
        req.version().as_str()
    );

    let mut has_max_forwards = false;
    for header in req.headers().iter() {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        if header.name.eq_ignore_ascii_case("Max-Forwards") {
            has_max_forwards = true;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value.trim());
    }

    if !has_max_forwards {
        let _ = write!(buf, "Max-Forwards: 70\r\n");
    }

    finish(buf, req.body())
}

/// Serializes a SIP response while normalising the `Content-Length` header.
pub fn serialize_response(res: &Response) -> Bytes {
    let mut buf = String::new();
    use std::fmt::Write;

    let _ = write!(
        buf,
        "{} {} {}\r\n",
        res.start_line().version().as_str(),
        res.code(),
        res.reason()
    );

    for header in res.headers().iter() {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value);
    }

    finish(buf, res.body())
}

pub fn serialize_message(msg: &SipMessage) -> Bytes {
    match msg {
        SipMessage::Request(req) => serialize_request(req),
        SipMessage::Response(res) => serialize_response(res),
    }
}

fn finish(mut head: String, body: &Bytes) -> Bytes {
    use std::fmt::Write;

    let _ = write!(head, "Content-Length: {}\r\n\r\n", body.len());
    let mut out = BytesMut::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body.as_ref());
    out.freeze()
}

/// Parses the request-line into a method and request URI.
fn parse_request_line(line: &str) -> Option<(Method, SipUri)> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1::<_, nom::error::Error<_>>,
        take_while1::<_, _, nom::error::Error<_>>(is_uri_char),
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (method_token, _, uri_token, _, version_token)) = parser(line.trim()).ok()?;

    SipVersion::parse(version_token)?;
    let uri = SipUri::parse(uri_token)?;
    Some((Method::from_token(method_token), uri))
}

/// Parses the status-line of a SIP response.
fn parse_status_line(line: &str) -> Option<StatusLine> {
    use nom::{
        bytes::complete::tag_no_case,
        character::complete::{space0, u16 as nom_u16},
        combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        tag_no_case::<_, _, nom::error::Error<_>>("SIP/2.0"),
        space0::<_, nom::error::Error<_>>,
        nom_u16::<_, nom::error::Error<_>>,
        space0::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (_, _, code, _, reason)) = parser(line.trim()).ok()?;

    StatusLine::new(code, reason.trim()).ok()
}

/// Returns the first header value matching `name` (case insensitive, compact forms allowed).
pub fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a SmolStr> {
    let canonical = canonical_header_name(name);
    headers
        .get(name)
        .or_else(|| headers.get(canonical.as_str()))
}

/// Splits raw bytes into header text and body slice using the `\r\n\r\n` separator.
fn split_head_body(datagram: &Bytes) -> Option<(&str, &[u8])> {
    let data = datagram.as_ref();
    let delim = b"\r\n\r\n";

    if let Some(pos) = data.windows(delim.len()).position(|window| window == delim) {
        let head = std::str::from_utf8(&data[..pos]).ok()?;
        let body = &data[pos + delim.len()..];
        Some((head, body))
    } else {
        let head = std::str::from_utf8(data).ok()?;
        Some((head, &[]))
    }
}

/// Parses SIP headers, handling folded continuation lines per RFC 3261 §7.3.1.
fn parse_headers<'a, I>(lines: I) -> Option<Headers>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut headers = Headers::new();
    let mut current_name: Option<SmolStr> = None;
    let mut current_value = String::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            let value = line.trim();
            if value.is_empty() {
                continue;
            }
            current_name.as_ref()?;
            if !current_value.is_empty() {
                current_value.push(' ');
            }
            current_value.push_str(value);
            continue;
        }

        let (name, value) = line.split_once(':')?;
        if let Some(prev_name) = current_name.take() {
            headers.push(prev_name, SmolStr::new(current_value.trim()));
        }
        current_name = Some(canonical_header_name(name.trim()));
        current_value = value.trim().to_owned();
    }

    if let Some(name) = current_name.take() {
        headers.push(name, SmolStr::new(current_value.trim()));
    }

    Some(headers)
}

/// Expands compact header forms (RFC 3261 §7.3.3) and normalises the case of
/// headers the stack manipulates.
pub fn canonical_header_name(name: &str) -> SmolStr {
    let lower = name.to_ascii_lowercase();
    let canonical = match lower.as_str() {
        "i" | "call-id" => "Call-ID",
        "f" | "from" => "From",
        "t" | "to" => "To",
        "m" | "contact" => "Contact",
        "l" | "content-length" => "Content-Length",
        "s" => "Subject",
        "k" => "Supported",
        "o" => "Event",
        "e" => "Content-Encoding",
        "c" | "content-type" => "Content-Type",
        "v" | "via" => "Via",
        "r" => "Refer-To",
        "b" => "Referred-By",
        "u" => "Allow-Events",
        "cseq" => "CSeq",
        "route" => "Route",
        "record-route" => "Record-Route",
        _ => name,
    };
    SmolStr::new(canonical)
}

/// Returns the body truncated to the declared `Content-Length`, or [`None`] if shorter.
fn extract_body(body_bytes: &[u8], headers: &Headers) -> Option<Bytes> {
    let declared = content_length(headers).unwrap_or(body_bytes.len());
    if declared > body_bytes.len() {
        return None;
    }
    Some(Bytes::copy_from_slice(&body_bytes[..declared]))
}

/// Reads the `Content-Length` header, ignoring invalid values.
fn content_length(headers: &Headers) -> Option<usize> {
    headers
        .get("Content-Length")
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '%' | '\'' | '*' | '+' | '-' | '.' | '_' | '`' | '~'
        )
}

// Permissive URI character set: stop at whitespace.
fn is_uri_char(c: char) -> bool {
    !c.is_whitespace()
}

fn cseq_matches(headers: &Headers, method: &Method) -> Option<bool> {
    let cseq = match headers.get("CSeq") {
        Some(v) => v,
        None => return Some(true),
    };
    let mut parts = cseq.split_whitespace();
    let _number = parts.next()?;
    let m = parts.next()?;
    Some(Method::from_token(m) == *method)
}
