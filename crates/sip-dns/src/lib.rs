// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Name resolution used by the transport layer when a message has no
//! explicit destination address.
//!
//! [`DnsResolver`] wraps a `trust-dns` tokio resolver and follows a reduced
//! RFC 3263 order: numeric hosts are used directly, an explicit port means a
//! plain A/AAAA lookup, otherwise SRV records are tried before falling back to
//! A/AAAA on the scheme's default port.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use anyhow::{anyhow, Result};
use rand::Rng;
use sip_core::SipUri;
use smol_str::SmolStr;
use tracing::{debug, warn};
use trust_dns_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};

/// Transport a resolved target should be reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

impl Transport {
    /// Maps a `transport=` URI parameter or network name onto a transport.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "udp" => Some(Transport::Udp),
            "tcp" => Some(Transport::Tcp),
            "tls" => Some(Transport::Tls),
            _ => None,
        }
    }

    fn as_proto_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp | Transport::Tls => "tcp",
        }
    }

    fn as_service_str(&self, sips: bool) -> &'static str {
        match self {
            Transport::Tls => "_sips",
            _ if sips => "_sips",
            _ => "_sip",
        }
    }
}

/// Target endpoint returned by resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsTarget {
    pub host: SmolStr,
    pub port: u16,
    pub transport: Transport,
    pub priority: u16,
}

impl DnsTarget {
    pub fn new(host: impl Into<SmolStr>, port: u16, transport: Transport) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    /// Socket address when the target host is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.host.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }
}

/// Resolution backend used by the transport layer.
#[async_trait::async_trait]
pub trait Resolver: Send + Sync {
    /// Resolves a SIP URI into ordered targets.
    async fn resolve(&self, uri: &SipUri) -> Result<Vec<DnsTarget>>;

    /// Resolves a bare host name into addresses.
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// DNS backed resolver.
#[derive(Clone)]
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver").finish_non_exhaustive()
    }
}

impl DnsResolver {
    /// Uses the host's resolver configuration (`/etc/resolv.conf` on unix).
    ///
    /// Falls back to the library defaults when the system configuration
    /// cannot be read.
    pub fn from_system() -> Self {
        match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => Self { resolver },
            Err(e) => {
                warn!(error = %e, "system resolver configuration unavailable, using defaults");
                Self::with_config(ResolverConfig::default(), ResolverOpts::default())
            }
        }
    }

    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }

    /// Sends every query over UDP to a single name server.
    ///
    /// Accepts `ip:port` or a bare IP (port 53).
    pub fn with_udp_server(server: &str) -> Result<Self> {
        let addr = match server.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => {
                let ip: IpAddr = server
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .parse()
                    .map_err(|_| anyhow!("invalid DNS server address: {}", server))?;
                SocketAddr::new(ip, 53)
            }
        };
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
        debug!(%addr, "using pinned UDP name server");
        Ok(Self::with_config(config, ResolverOpts::default()))
    }

    fn default_transport(uri: &SipUri) -> Transport {
        if uri.sips {
            return Transport::Tls;
        }
        uri.transport()
            .and_then(Transport::from_token)
            .unwrap_or(Transport::Udp)
    }

    fn transport_order(uri: &SipUri) -> Vec<Transport> {
        if uri.sips {
            vec![Transport::Tls]
        } else if let Some(t) = uri.transport().and_then(Transport::from_token) {
            vec![t]
        } else {
            vec![Transport::Udp, Transport::Tcp]
        }
    }

    async fn resolve_internal(&self, uri: &SipUri) -> Result<Vec<DnsTarget>> {
        let host = uri.host.as_str();

        if host.parse::<IpAddr>().is_ok() {
            let port = uri.port.unwrap_or_else(|| uri.default_port());
            return Ok(vec![DnsTarget::new(
                host,
                port,
                Self::default_transport(uri),
            )]);
        }

        if let Some(port) = uri.port {
            let ips = self.lookup_a_aaaa(host).await?;
            return Ok(ips
                .into_iter()
                .map(|ip| DnsTarget::new(ip.to_string(), port, Self::default_transport(uri)))
                .collect());
        }

        let mut all_targets = Vec::new();
        for transport in Self::transport_order(uri) {
            if let Ok(targets) = self.lookup_srv(host, transport, uri.sips).await {
                all_targets.extend(targets);
            }
        }

        if all_targets.is_empty() {
            let ips = self.lookup_a_aaaa(host).await?;
            all_targets.extend(ips.into_iter().map(|ip| {
                DnsTarget::new(ip.to_string(), uri.default_port(), Self::default_transport(uri))
            }));
        }

        if all_targets.is_empty() {
            Err(anyhow!("no DNS targets found for {}", host))
        } else {
            Ok(all_targets)
        }
    }

    async fn lookup_srv(
        &self,
        host: &str,
        transport: Transport,
        sips: bool,
    ) -> Result<Vec<DnsTarget>> {
        let srv_name = format!(
            "{}._{}.{}",
            transport.as_service_str(sips),
            transport.as_proto_str(),
            host
        );
        let lookup = self.resolver.srv_lookup(srv_name).await?;

        let mut priority_groups: BTreeMap<u16, Vec<(u16, SmolStr, u16)>> = BTreeMap::new();
        for rec in lookup.iter() {
            let target = rec.target().to_utf8();
            priority_groups.entry(rec.priority()).or_default().push((
                rec.weight(),
                SmolStr::new(target.trim_end_matches('.')),
                rec.port(),
            ));
        }

        let mut targets = Vec::new();
        for (priority, records) in priority_groups {
            for (host, port) in select_by_weight(records) {
                targets.push(DnsTarget::new(host, port, transport).with_priority(priority));
            }
        }

        if targets.is_empty() {
            Err(anyhow!("no SRV records found"))
        } else {
            Ok(targets)
        }
    }

    /// A and AAAA records, IPv4 first.
    async fn lookup_a_aaaa(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = self.resolver.lookup_ip(host).await?;
        let (mut result, v6): (Vec<IpAddr>, Vec<IpAddr>) =
            lookup.iter().partition(|ip| ip.is_ipv4());
        result.extend(v6);

        if result.is_empty() {
            Err(anyhow!("no A/AAAA records found for {}", host))
        } else {
            Ok(result)
        }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::from_system()
    }
}

#[async_trait::async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, uri: &SipUri) -> Result<Vec<DnsTarget>> {
        self.resolve_internal(uri).await
    }

    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        self.lookup_a_aaaa(bare).await
    }
}

/// Orders one SRV priority group by weight (RFC 2782).
fn select_by_weight(mut records: Vec<(u16, SmolStr, u16)>) -> Vec<(SmolStr, u16)> {
    let mut rng = rand::thread_rng();
    let mut result = Vec::with_capacity(records.len());

    while !records.is_empty() {
        let total_weight: u32 = records.iter().map(|(w, _, _)| *w as u32).sum();

        let idx = if total_weight == 0 {
            rng.gen_range(0..records.len())
        } else {
            let pick = rng.gen_range(0..total_weight);
            let mut cumulative = 0u32;
            records
                .iter()
                .position(|(w, _, _)| {
                    cumulative += *w as u32;
                    cumulative > pick
                })
                .unwrap_or(0)
        };

        let (_, host, port) = records.remove(idx);
        result.push((host, port));
    }

    result
}

/// Resolver returning fixed answers, for tests and static deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    targets: Vec<DnsTarget>,
    hosts: BTreeMap<SmolStr, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new(targets: Vec<DnsTarget>) -> Self {
        Self {
            targets,
            hosts: BTreeMap::new(),
        }
    }

    pub fn single(host: impl Into<SmolStr>, port: u16, transport: Transport) -> Self {
        Self::new(vec![DnsTarget::new(host, port, transport)])
    }

    /// Registers addresses returned by [`Resolver::lookup_ip`] for `host`.
    pub fn with_host(mut self, host: &str, ips: Vec<IpAddr>) -> Self {
        self.hosts
            .insert(SmolStr::new(host.to_ascii_lowercase()), ips);
        self
    }
}

#[async_trait::async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, uri: &SipUri) -> Result<Vec<DnsTarget>> {
        if !self.targets.is_empty() {
            return Ok(self.targets.clone());
        }
        let port = uri.port.unwrap_or_else(|| uri.default_port());
        let ips = self.lookup_ip(&uri.host).await?;
        Ok(ips
            .into_iter()
            .map(|ip| DnsTarget::new(ip.to_string(), port, DnsResolver::default_transport(uri)))
            .collect())
    }

    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        self.hosts
            .get(bare.to_ascii_lowercase().as_str())
            .cloned()
            .ok_or_else(|| anyhow!("unknown host {}", host))
    }
}
