// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Via and Record-Route rewriting for messages leaving through the server
//! (RFC 3261 §16.6, §18.2.1; RFC 3581).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sip_core::{Request, Response, RouteHeader, SipUri};
use sip_transport::network_to_lower;
use smol_str::SmolStr;

/// Applies this hop's Via and Record-Route policy.
///
/// Both policy flags are shared with the owning server and may be toggled at
/// runtime.
#[derive(Debug, Clone)]
pub struct HeaderRewriter {
    host: SmolStr,
    port: Option<u16>,
    add_via: Arc<AtomicBool>,
    add_record_route: Arc<AtomicBool>,
}

impl HeaderRewriter {
    pub fn new(host: impl Into<SmolStr>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
            add_via: Arc::new(AtomicBool::new(true)),
            add_record_route: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn add_via(&self) -> bool {
        self.add_via.load(Ordering::Relaxed)
    }

    pub fn set_add_via(&self, enabled: bool) {
        self.add_via.store(enabled, Ordering::Relaxed);
    }

    pub fn add_record_route(&self) -> bool {
        self.add_record_route.load(Ordering::Relaxed)
    }

    pub fn set_add_record_route(&self, enabled: bool) {
        self.add_record_route.store(enabled, Ordering::Relaxed);
    }

    /// Prepends this hop's Via (a copy of the top Via with our sent-by) and a
    /// Record-Route. A request without a Via gets neither Via change.
    pub fn update_request(&self, req: &mut Request) {
        if self.add_via() {
            if let Some(mut original) = req.headers().top_via() {
                let mut ours = original.clone();
                ours.host = self.host.clone();
                ours.port = self.port;

                if original.params.contains("rport") {
                    if let Some((host, port)) = req.source_host_port() {
                        original.params.set("rport", Some(SmolStr::new(port.to_string())));
                        original.params.set("received", Some(host));
                        req.headers_mut().replace_top_via(&original);
                    }
                }
                req.headers_mut().prepend_via(&ours);
            }
        }

        if self.add_record_route() {
            let uri = SipUri::new(self.host.clone())
                .with_port(self.port)
                .with_param("transport", Some(network_to_lower(&req.transport()).as_str()))
                .with_param("lr", None);
            let record_route = RouteHeader::new(uri);
            req.headers_mut().prepend(
                SmolStr::new("Record-Route"),
                SmolStr::new(record_route.to_string()),
            );
        }
    }

    pub fn update_response(&self, res: &mut Response) {
        if self.add_via() {
            self.remove_via(res);
        }
    }

    /// Removes the top Via entry when its host is ours. Other entries of a
    /// multi-value line stay; a line left empty is dropped.
    pub fn remove_via(&self, res: &mut Response) {
        let ours = res
            .headers()
            .top_via()
            .is_some_and(|via| via.host.eq_ignore_ascii_case(&self.host));
        if ours {
            res.headers_mut().remove_top_via();
        }
    }
}
