// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP types used by the server stack.
//!
//! - **Messages**: [`Request`], [`Response`], [`SipMessage`], with network
//!   metadata (source, destination, transport) recorded alongside
//! - **URIs**: [`SipUri`] (sip/sips) and ordered [`Params`]
//! - **Headers**: [`Headers`] container, [`ViaHeader`] with Via chain
//!   operations, [`RouteHeader`] for Route / Record-Route
//! - **Methods**: [`Method`] enum (INVITE, REGISTER, SUBSCRIBE, etc.)
//!
//! # Examples
//!
//! ```
//! # use sip_core::*;
//! let uri = SipUri::parse("sip:alice@example.com").unwrap();
//! let via = ViaHeader::parse("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1").unwrap();
//! assert_eq!(via.branch(), Some("z9hG4bK1"));
//! # let _ = uri;
//! ```

pub mod headers;
pub mod method;
pub mod msg;
pub mod params;
pub mod route;
pub mod uri;
pub mod version;
pub mod via;

pub use headers::{split_list, Header, Headers};
pub use method::Method;
pub use msg::{MessageError, Request, RequestLine, Response, SipMessage, StatusLine};
pub use params::Params;
pub use route::RouteHeader;
pub use uri::SipUri;
pub use version::SipVersion;
pub use via::ViaHeader;
