use std::fmt;

use smol_str::SmolStr;

use crate::{
    headers::{split_list, Headers},
    params::Params,
    uri::split_host_port,
};

/// Parsed representation of one Via entry (`SIP/2.0/UDP host:port;params`).
///
/// `host` keeps the textual form from the wire, so IPv6 hosts stay bracketed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    pub transport: SmolStr,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: Params,
}

impl ViaHeader {
    pub fn new(transport: &str, host: impl Into<SmolStr>, port: Option<u16>) -> Self {
        Self {
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            host: host.into(),
            port,
            params: Params::new(),
        }
    }

    /// Parses a single Via entry. Comma separated lists must be split first.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (protocol, rest) = input.split_once(|c: char| c.is_ascii_whitespace())?;
        let mut parts = protocol.split('/');
        let name = parts.next()?;
        let version = parts.next()?;
        let transport = parts.next()?;
        if !name.eq_ignore_ascii_case("SIP") || version != "2.0" || transport.is_empty() {
            return None;
        }

        let rest = rest.trim_start();
        let (sent_by, params) = match rest.split_once(';') {
            Some((sent_by, params)) => (sent_by.trim(), Params::parse(params)),
            None => (rest.trim(), Params::new()),
        };
        if sent_by.is_empty() {
            return None;
        }
        let (host, port) = split_host_port(sent_by)?;
        if host.is_empty() {
            return None;
        }
        let host = if sent_by.starts_with('[') {
            SmolStr::new(format!("[{}]", host))
        } else {
            SmolStr::new(host)
        };

        Some(Self {
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            host,
            port,
            params,
        })
    }

    /// Returns the transport token (e.g. UDP/TCP/TLS) associated with this Via.
    pub fn transport(&self) -> &str {
        self.transport.as_str()
    }

    /// `host[:port]` as it appears on the wire.
    pub fn sent_by(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.to_string(),
        }
    }

    /// Looks up the provided parameter ignoring ASCII case.
    pub fn param(&self, name: &str) -> Option<&Option<SmolStr>> {
        self.params.get(name)
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.value("branch")
    }

    pub fn received(&self) -> Option<&str> {
        self.params.value("received")
    }

    /// `rport` value when the parameter carries one.
    pub fn rport(&self) -> Option<u16> {
        self.params.value("rport").and_then(|v| v.parse().ok())
    }

    pub fn has_rport(&self) -> bool {
        self.params.contains("rport")
    }
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}{}", self.transport, self.sent_by(), self.params)
    }
}

fn is_via(name: &str) -> bool {
    name.eq_ignore_ascii_case("Via") || name.eq_ignore_ascii_case("v")
}

/// Via chain operations. All `Via` header lines are treated as one ordered
/// sequence; a line holding several comma separated entries contributes them
/// in order.
impl Headers {
    /// Every parseable Via entry, top-most first.
    pub fn vias(&self) -> Vec<ViaHeader> {
        self.iter()
            .filter(|h| is_via(&h.name))
            .flat_map(|h| split_list(&h.value).into_iter().map(ViaHeader::parse))
            .flatten()
            .collect()
    }

    /// Number of parseable Via entries; always `self.vias().len()`.
    pub fn via_count(&self) -> usize {
        self.iter()
            .filter(|h| is_via(&h.name))
            .flat_map(|h| split_list(&h.value))
            .filter(|entry| ViaHeader::parse(entry).is_some())
            .count()
    }

    /// The top-most Via entry.
    pub fn top_via(&self) -> Option<ViaHeader> {
        let idx = self.iter().position(|h| is_via(&h.name))?;
        let line = self.iter().nth(idx)?;
        ViaHeader::parse(split_list(&line.value).first()?)
    }

    /// Pushes `via` onto the top of the chain as its own header line.
    pub fn prepend_via(&mut self, via: &ViaHeader) {
        self.prepend(SmolStr::new("Via"), SmolStr::new(via.to_string()));
    }

    /// Rewrites the first chain entry in place. Returns `false` without a Via.
    pub fn replace_top_via(&mut self, via: &ViaHeader) -> bool {
        let Some(idx) = self.iter().position(|h| is_via(&h.name)) else {
            return false;
        };
        let Some(line) = self.get_at_mut(idx) else {
            return false;
        };
        let mut entries: Vec<String> = split_list(&line.value)
            .into_iter()
            .map(str::to_owned)
            .collect();
        match entries.first_mut() {
            Some(first) => *first = via.to_string(),
            None => entries.push(via.to_string()),
        }
        line.value = SmolStr::new(entries.join(", "));
        true
    }

    /// Unlinks the first chain entry. A line left empty is removed entirely.
    pub fn remove_top_via(&mut self) -> Option<ViaHeader> {
        let idx = self.iter().position(|h| is_via(&h.name))?;
        let line = self.get_at_mut(idx)?;
        let entries = split_list(&line.value);
        let removed = entries.first().and_then(|e| ViaHeader::parse(e));
        if entries.len() > 1 {
            line.value = SmolStr::new(entries[1..].join(", "));
        } else {
            self.remove_at(idx);
        }
        removed
    }
}
