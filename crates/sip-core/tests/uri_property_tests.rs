// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use proptest::prelude::*;
use sip_core::{RouteHeader, SipUri};

fn host_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z][a-z0-9\\-]{0,10}\\.example\\.com",
        (1u8..255, 1u8..255).prop_map(|(a, b)| format!("10.0.{}.{}", a, b)),
        (1u16..0xffff).prop_map(|n| format!("2001:db8::{:x}", n)),
    ]
}

proptest! {
    /// Parsing the display form of a built URI yields the same URI.
    #[test]
    fn built_uri_survives_display(
        host in host_strategy(),
        user in proptest::option::of("[a-z0-9]{1,8}"),
        port in proptest::option::of(1024u16..65535),
        transport in prop::sample::select(vec!["udp", "tcp", "tls", "ws"]),
    ) {
        let mut uri = SipUri::new(host.as_str())
            .with_port(port)
            .with_param("transport", Some(transport));
        uri.user = user.map(Into::into);

        let reparsed = SipUri::parse(&uri.to_string());
        prop_assert_eq!(reparsed, Some(uri));
    }

    /// Record-Route values built for this stack keep the loose-routing flag.
    #[test]
    fn record_route_is_loose(host in host_strategy(), port in 1u16..65535) {
        let uri = SipUri::new(host.as_str())
            .with_port(Some(port))
            .with_param("transport", Some("udp"))
            .with_param("lr", None);
        let rendered = RouteHeader::new(uri).to_string();

        let parsed = RouteHeader::parse(&rendered).expect("parse");
        prop_assert!(parsed.is_loose());
        prop_assert_eq!(parsed.uri.port, Some(port));
        prop_assert_eq!(parsed.uri.transport(), Some("udp"));
    }

    /// Bracketed and bare IPv6 hosts are stored the same way.
    #[test]
    fn ipv6_brackets_are_stripped(n in 1u16..0xffff) {
        let bare = format!("2001:db8::{:x}", n);
        let bracketed = format!("[{}]", bare);
        prop_assert_eq!(SipUri::new(bracketed.as_str()), SipUri::new(bare.as_str()));
        prop_assert_eq!(SipUri::new(bare.as_str()).host_for_display(), bracketed);
    }

    #[test]
    fn scheme_is_case_insensitive(
        scheme in prop::sample::select(vec!["sip", "SIP", "Sip", "sIp"]),
        host in "[a-z]{3,8}",
    ) {
        let uri = SipUri::parse(&format!("{}:{}", scheme, host)).expect("parse");
        prop_assert!(!uri.sips);
        prop_assert_eq!(uri.host.as_str(), host.as_str());
    }
}

#[test]
fn rejects_invalid_uris() {
    for input in [
        "",
        "example.com",
        "http://example.com",
        "sip:",
        "sip:user@",
        "sip:example.com:99999",
    ] {
        assert!(SipUri::parse(input).is_none(), "accepted {:?}", input);
    }
}

#[test]
fn default_ports_follow_scheme() {
    let sip = SipUri::parse("sip:example.com").expect("parse");
    assert_eq!(sip.port, None);
    assert_eq!(sip.default_port(), 5060);

    let sips = SipUri::parse("sips:example.com").expect("parse");
    assert!(sips.sips);
    assert_eq!(sips.default_port(), 5061);
}
