// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::IpAddr;

use sip_core::SipUri;
use sip_dns::{DnsResolver, DnsTarget, Resolver, StaticResolver, Transport};

#[tokio::test]
async fn resolve_numeric_ipv4() {
    let resolver = DnsResolver::from_system();
    let uri = SipUri::parse("sip:192.168.1.1:5060").unwrap();

    let targets = resolver.resolve(&uri).await.expect("resolve");

    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].host.as_str(), "192.168.1.1");
    assert_eq!(targets[0].port, 5060);
}

#[tokio::test]
async fn resolve_numeric_ipv6() {
    let resolver = DnsResolver::from_system();
    let uri = SipUri::parse("sip:[::1]:5070").unwrap();

    let targets = resolver.resolve(&uri).await.expect("resolve");

    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].host.as_str(), "::1");
    assert_eq!(targets[0].socket_addr(), Some("[::1]:5070".parse().unwrap()));
}

#[tokio::test]
async fn sips_uses_port_5061_by_default() {
    let resolver = DnsResolver::from_system();
    let uri = SipUri::parse("sips:192.168.1.1").unwrap();

    let targets = resolver.resolve(&uri).await.expect("resolve");

    assert_eq!(targets[0].port, 5061);
    assert_eq!(targets[0].transport, Transport::Tls);
}

#[tokio::test]
async fn lookup_ip_short_circuits_literals() {
    let resolver = DnsResolver::with_udp_server("127.0.0.1:9").expect("resolver");

    let ips = resolver.lookup_ip("[2001:db8::5]").await.expect("literal");
    assert_eq!(ips, vec!["2001:db8::5".parse::<IpAddr>().unwrap()]);
}

#[tokio::test]
async fn transport_parameter_honored_in_uri() {
    let resolver = DnsResolver::from_system();
    let uri = SipUri::parse("sip:10.0.0.7;transport=tcp").unwrap();

    let targets = resolver.resolve(&uri).await.expect("resolve");
    assert_eq!(targets[0].transport, Transport::Tcp);
    assert_eq!(targets[0].port, 5060);
}

#[tokio::test]
async fn static_resolver_as_trait_object() {
    let resolver: Box<dyn Resolver> = Box::new(StaticResolver::new(vec![
        DnsTarget::new("10.0.0.1", 5060, Transport::Udp).with_priority(10),
        DnsTarget::new("10.0.0.2", 5060, Transport::Udp).with_priority(20),
    ]));
    let uri = SipUri::parse("sip:anything.example.com").unwrap();

    let targets = resolver.resolve(&uri).await.expect("resolve");
    assert_eq!(targets.len(), 2);
    assert!(targets[0].priority < targets[1].priority);
}

#[test]
fn transport_tokens() {
    assert_eq!(Transport::from_token("UDP"), Some(Transport::Udp));
    assert_eq!(Transport::from_token("tls"), Some(Transport::Tls));
    assert_eq!(Transport::from_token("sctp"), None);
}
