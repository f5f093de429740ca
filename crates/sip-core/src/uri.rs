// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;
use std::fmt;

use percent_encoding::percent_decode_str;
use smol_str::SmolStr;

use crate::params::Params;

/// Parsed representation of a SIP URI (RFC 3261 §19).
///
/// IPv6 hosts are stored without brackets; [`fmt::Display`] restores them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub sips: bool,
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: Params,
    pub headers: BTreeMap<SmolStr, SmolStr>,
}

impl SipUri {
    /// Constructs a `sip:` URI with the given host and default settings.
    pub fn new(host: impl Into<SmolStr>) -> Self {
        let host: SmolStr = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(SmolStr::new)
            .unwrap_or(host);
        Self {
            sips: false,
            user: None,
            host,
            port: None,
            params: Params::new(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn with_param(mut self, name: &str, value: Option<&str>) -> Self {
        self.params.set(name, value.map(SmolStr::new));
        self
    }

    /// Attempts to parse a SIP or SIPS URI from the provided string.
    pub fn parse(input: &str) -> Option<Self> {
        let (scheme, rest) = input.trim().split_once(':')?;
        let sips = scheme.eq_ignore_ascii_case("sips");
        if !sips && !scheme.eq_ignore_ascii_case("sip") {
            return None;
        }

        let (addr_part, headers_part) = match rest.split_once('?') {
            Some((addr, headers)) => (addr, Some(headers)),
            None => (rest, None),
        };

        let (base, params) = match addr_part.split_once(';') {
            Some((base, params)) => (base.trim(), Params::parse(params)),
            None => (addr_part.trim(), Params::new()),
        };

        let (user, host_port) = match base.rsplit_once('@') {
            Some((user, host)) => (
                percent_decode_str(user.trim())
                    .decode_utf8()
                    .ok()
                    .map(|s| SmolStr::new(s.as_ref())),
                host.trim(),
            ),
            None => (None, base),
        };

        if host_port.is_empty() {
            return None;
        }

        let (host, port) = split_host_port(host_port)?;
        if host.is_empty() {
            return None;
        }

        let mut headers = BTreeMap::new();
        if let Some(headers_part) = headers_part {
            for pair in headers_part.split('&') {
                if let Some((k, v)) = pair.split_once('=') {
                    headers.insert(SmolStr::new(k.trim()), SmolStr::new(v.trim()));
                }
            }
        }

        Some(Self {
            sips,
            user,
            host: SmolStr::new(host.to_ascii_lowercase()),
            port,
            params,
            headers,
        })
    }

    /// Default port for the scheme when none is present.
    pub fn default_port(&self) -> u16 {
        if self.sips {
            5061
        } else {
            5060
        }
    }

    /// Transport named by the `transport` URI parameter, if any.
    pub fn transport(&self) -> Option<&str> {
        self.params.value("transport")
    }

    /// Host formatted for use in a host:port pair (IPv6 bracketed).
    pub fn host_for_display(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.to_string()
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.sips { "sips:" } else { "sip:" })?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host_for_display())?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)?;
        for (idx, (k, v)) in self.headers.iter().enumerate() {
            let sep = if idx == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, k, v)?;
        }
        Ok(())
    }
}

/// Splits a host[:port] or IPv6 literal "[host]:port" string.
pub(crate) fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    if let Some(stripped) = input.strip_prefix('[') {
        let end = stripped.find(']')?;
        let host = &stripped[..end];
        let remainder = &stripped[end + 1..];
        match remainder.strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None if remainder.is_empty() => Some((host, None)),
            None => None,
        }
    } else if let Some((host, port)) = input.rsplit_once(':') {
        if host.contains(':') {
            return None;
        }
        Some((host, Some(port.parse().ok()?)))
    } else {
        Some((input, None))
    }
}
