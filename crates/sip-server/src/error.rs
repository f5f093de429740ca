use thiserror::Error;

/// Construction-time failures. No server is produced when one occurs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },
    #[error("failed to resolve {host:?}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not determine a local IP address: {0}")]
    SelfIp(String),
    #[error("DNS resolver: {0}")]
    Resolver(String),
}

impl ConfigError {
    pub(crate) fn invalid_address(addr: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            addr: addr.to_owned(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The transport refused or failed to send a message.
    #[error("write failed: {0}")]
    Write(#[source] anyhow::Error),
    /// The transaction layer rejected the request or response.
    #[error("transaction failed: {0}")]
    Transaction(#[source] anyhow::Error),
    /// A one-shot observer was registered a second time.
    #[error("{observer} observer can only be registered once")]
    ObserverAlreadyRegistered { observer: &'static str },
    #[error("server already shut down")]
    ShutDown,
    #[error("server is already serving")]
    AlreadyServing,
}

pub type Result<T, E = ServerError> = std::result::Result<T, E>;
