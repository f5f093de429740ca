// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Construction options for [`crate::Server`].
//!
//! Options are applied in order; the first one that fails aborts
//! construction.
//!
//! ```no_run
//! use sip_server::{with_ip, with_user_agent, Server};
//!
//! let server = Server::new([with_ip("10.0.0.5:5060"), with_user_agent("edge-1")]).unwrap();
//! assert_eq!(server.host(), "10.0.0.5");
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use sip_dns::{DnsResolver, Resolver};
use sip_transaction::TimerConfig;
use tracing::warn;

use crate::error::ConfigError;

/// User agent advertised when none is configured.
pub const DEFAULT_USER_AGENT: &str = "siphon";

/// Partially built server state that options mutate.
pub struct ServerConfig {
    pub(crate) ip: Option<IpAddr>,
    pub(crate) port: Option<u16>,
    pub(crate) user_agent: String,
    pub(crate) resolver: Option<Arc<dyn Resolver>>,
    pub(crate) logger: Option<tracing::Dispatch>,
    pub(crate) timers: TimerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: None,
            port: None,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            resolver: None,
            logger: None,
            timers: TimerConfig::default(),
        }
    }
}

/// A single construction step.
pub type ServerOption = Box<dyn FnOnce(&mut ServerConfig) -> Result<(), ConfigError> + Send>;

/// Routes every event the server emits to `logger`.
pub fn with_logger(logger: tracing::Dispatch) -> ServerOption {
    Box::new(move |config| {
        config.logger = Some(logger);
        Ok(())
    })
}

/// Sets the local identity from `host:port`. Names go through the system
/// resolver; the port becomes the advertised local port.
pub fn with_ip(addr: impl Into<String>) -> ServerOption {
    let addr = addr.into();
    Box::new(move |config| {
        let (host, port) = split_host_port(&addr)?;
        config.ip = Some(resolve_host(host)?);
        config.port = Some(port);
        Ok(())
    })
}

/// Advertised port, when it differs from what `with_ip` carried.
pub fn with_port(port: u16) -> ServerOption {
    Box::new(move |config| {
        config.port = Some(port);
        Ok(())
    })
}

pub fn with_dns_resolver(resolver: impl Resolver + 'static) -> ServerOption {
    let resolver: Arc<dyn Resolver> = Arc::new(resolver);
    Box::new(move |config| {
        config.resolver = Some(resolver);
        Ok(())
    })
}

/// Uses a resolver that only queries the UDP name server at `server`.
pub fn with_udp_dns_resolver(server: impl Into<String>) -> ServerOption {
    let server = server.into();
    Box::new(move |config| {
        let resolver = DnsResolver::with_udp_server(&server)
            .map_err(|e| ConfigError::invalid_address(&server, e.to_string()))?;
        config.resolver = Some(Arc::new(resolver));
        Ok(())
    })
}

pub fn with_user_agent(user_agent: impl Into<String>) -> ServerOption {
    let user_agent = user_agent.into();
    Box::new(move |config| {
        config.user_agent = user_agent;
        Ok(())
    })
}

/// Overrides the RFC 3261 base timers used by the transaction layer.
pub fn with_transaction_timers(timers: TimerConfig) -> ServerOption {
    Box::new(move |config| {
        config.timers = timers;
        Ok(())
    })
}

fn split_host_port(addr: &str) -> Result<(&str, u16), ConfigError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::invalid_address(addr, "missing port"))?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| ConfigError::invalid_address(addr, "unterminated IPv6 literal"))?,
        None if host.contains(':') => {
            return Err(ConfigError::invalid_address(addr, "IPv6 literal must be bracketed"))
        }
        None => host,
    };
    if host.is_empty() {
        return Err(ConfigError::invalid_address(addr, "missing host"));
    }
    let port = port
        .parse()
        .map_err(|_| ConfigError::invalid_address(addr, format!("invalid port {port:?}")))?;
    Ok((host, port))
}

fn resolve_host(host: &str) -> Result<IpAddr, ConfigError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs: Vec<SocketAddr> = (host, 0)
        .to_socket_addrs()
        .map_err(|source| ConfigError::Resolve {
            host: host.to_owned(),
            source,
        })?
        .collect();
    addrs.sort_by_key(|addr| addr.is_ipv6());
    addrs
        .first()
        .map(SocketAddr::ip)
        .ok_or_else(|| ConfigError::Resolve {
            host: host.to_owned(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
        })
}

/// Picks the first non-loopback IPv4 interface address. A host with only a
/// loopback interface gets 127.0.0.1 and a warning.
pub(crate) fn resolve_self_ip() -> Result<IpAddr, ConfigError> {
    let interfaces = get_if_addrs::get_if_addrs().map_err(|e| ConfigError::SelfIp(e.to_string()))?;
    let v4: Vec<Ipv4Addr> = interfaces
        .iter()
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(ip) => Some((ip, iface.is_loopback())),
            IpAddr::V6(_) => None,
        })
        .filter_map(|(ip, loopback)| (!loopback).then_some(ip))
        .collect();
    if let Some(ip) = v4.first() {
        return Ok(IpAddr::V4(*ip));
    }
    if interfaces.iter().any(|iface| iface.ip() == IpAddr::V4(Ipv4Addr::LOCALHOST)) {
        warn!("no routable IPv4 interface, using loopback");
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    Err(ConfigError::SelfIp("no IPv4 interface found".into()))
}

/// Host string for Via and Record-Route. IPv6 is bracketed.
pub(crate) fn host_string(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}
