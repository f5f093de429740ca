// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sip_core::{Method, Request, Response};
use sip_server::Server;
use sip_transaction::ServerTransaction;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{DaemonConfig, DaemonMode};

/// Standalone SIP server answering out-of-dialog requests
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON configuration file; flags below are merged on top of it
    #[arg(long)]
    config: Option<PathBuf>,
    /// UDP bind address (repeatable)
    #[arg(long)]
    udp_bind: Vec<String>,
    /// TCP bind address (repeatable)
    #[arg(long)]
    tcp_bind: Vec<String>,
    /// Advertised ip:port for Via and Record-Route
    #[arg(long)]
    ip: Option<String>,
    /// Value of the Server / User-Agent header
    #[arg(long)]
    user_agent: Option<String>,
    /// UDP DNS server used instead of the system configuration
    #[arg(long)]
    dns_server: Option<String>,
    #[arg(long, value_enum)]
    mode: Option<DaemonMode>,
    /// Reject INVITE with 486 Busy Here
    #[arg(long)]
    busy: bool,
}

impl Args {
    async fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path).await?,
            None => DaemonConfig::default(),
        };
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if self.ip.is_some() {
            config.ip = self.ip;
        }
        if let Some(user_agent) = self.user_agent {
            config.user_agent = user_agent;
        }
        if self.dns_server.is_some() {
            config.dns_server = self.dns_server;
        }
        if self.busy {
            config.auto_accept_calls = false;
        }
        for addr in &self.udp_bind {
            config.add_listener("udp", addr);
        }
        for addr in &self.tcp_bind {
            config.add_listener("tcp", addr);
        }
        if config.listeners.is_empty() {
            config.add_listener("udp", "0.0.0.0:5060");
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Args::parse().into_config().await?;
    let server = Arc::new(Server::new(config.server_options()).context("building server")?);
    register_handlers(&server, &config);
    for listener in &config.listeners {
        server.listen(&listener.network, &listener.addr);
    }
    info!(
        host = %server.host(),
        mode = ?config.mode,
        methods = ?server.methods(),
        "siphond starting"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            info!("ctrl-c received, shutting down");
            cancel.cancel();
        });
    }

    server.serve_with_cancel(cancel).await?;
    Ok(())
}

fn register_handlers(server: &Server, config: &DaemonConfig) {
    server.on_options(|req: Request, tx: ServerTransaction| async move {
        reply(&req, &tx, 200, "OK").await;
    });
    if config.mode == DaemonMode::Minimal {
        return;
    }

    for method in [Method::Message, Method::Info, Method::Register, Method::Bye] {
        server.on_request(method, |req: Request, tx: ServerTransaction| async move {
            reply(&req, &tx, 200, "OK").await;
        });
    }
    let accept = config.auto_accept_calls;
    server.on_invite(move |req: Request, tx: ServerTransaction| async move {
        reply(&req, &tx, 100, "Trying").await;
        if accept {
            reply(&req, &tx, 200, "OK").await;
        } else {
            reply(&req, &tx, 486, "Busy Here").await;
        }
    });
}

async fn reply(req: &Request, tx: &ServerTransaction, code: u16, reason: &str) {
    let res = match Response::from_request(req, code, reason) {
        Ok(res) => res,
        Err(e) => {
            warn!(error = %e, code, "failed to build response");
            return;
        }
    };
    if let Err(e) = tx.respond(res).await {
        warn!(error = %e, code, method = %req.method(), "failed to send response");
    }
}
