// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Server orchestration for the siphon stack.
//!
//! A [`Server`] owns a transport layer and a transaction layer. Every new
//! server transaction is dispatched on its own task to the handler registered
//! for the request method; a method without a handler is answered with a
//! stateless `405 Method Not Allowed`.
//!
//! Messages sent through the server follow RFC 3261 hop rules: requests get
//! this server's Via and a loose-routing Record-Route, responses lose the top
//! Via when it names this server. See [`HeaderRewriter`].
//!
//! - **Configuration**: [`ServerOption`]s such as [`with_ip`] and
//!   [`with_logger`], applied in order by [`Server::new`]
//! - **Handlers**: [`RequestHandler`], implemented by async closures
//! - **Lifecycle**: [`Server::listen`], [`Server::serve_with_cancel`]

mod config;
mod dispatch;
mod error;
mod listener;
mod registry;
mod rewrite;
mod server;

pub use config::{
    with_dns_resolver, with_ip, with_logger, with_port, with_transaction_timers,
    with_udp_dns_resolver, with_user_agent, ServerConfig, ServerOption, DEFAULT_USER_AGENT,
};
pub use error::{ConfigError, Result, ServerError};
pub use registry::{HandlerRegistry, RequestHandler};
pub use rewrite::HeaderRewriter;
pub use server::Server;
