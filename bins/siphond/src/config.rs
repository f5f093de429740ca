//! Configuration and operational modes for siphond daemon.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use sip_server::{with_ip, with_udp_dns_resolver, with_user_agent, ServerOption};

/// Operational mode determines which SIP methods are handled and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonMode {
    /// Only respond to OPTIONS with 200 OK
    #[default]
    Minimal,

    /// Answer every out-of-dialog request: 200 OK for OPTIONS, MESSAGE,
    /// INFO, REGISTER and BYE; INVITE per `auto_accept_calls`.
    FullUas,
}

/// One `network`/`addr` pair to serve on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListenerConfig {
    pub network: String,
    pub addr: String,
}

/// File form of the daemon configuration (`--config path.json`).
///
/// ```json
/// {
///   "mode": "full-uas",
///   "ip": "192.0.2.10:5060",
///   "listeners": [{ "network": "udp", "addr": "0.0.0.0:5060" }]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub mode: DaemonMode,
    /// Advertised `ip:port`. Probed from the local interfaces when absent.
    pub ip: Option<String>,
    pub user_agent: String,
    /// UDP DNS server (`ip` or `ip:port`); system configuration otherwise.
    pub dns_server: Option<String>,
    /// Reject INVITE with 486 Busy Here when false.
    pub auto_accept_calls: bool,
    pub listeners: Vec<ListenerConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            mode: DaemonMode::default(),
            ip: None,
            user_agent: "siphond".to_owned(),
            dns_server: None,
            auto_accept_calls: true,
            listeners: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid daemon configuration")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&text)
    }

    /// Adds a listener unless the same pair is already configured.
    pub fn add_listener(&mut self, network: &str, addr: &str) {
        let listener = ListenerConfig {
            network: network.to_owned(),
            addr: addr.to_owned(),
        };
        if !self.listeners.contains(&listener) {
            self.listeners.push(listener);
        }
    }

    pub fn server_options(&self) -> Vec<ServerOption> {
        let mut options = vec![with_user_agent(self.user_agent.clone())];
        if let Some(ip) = &self.ip {
            options.push(with_ip(ip.clone()));
        }
        if let Some(dns) = &self.dns_server {
            options.push(with_udp_dns_resolver(dns.clone()));
        }
        options
    }
}
