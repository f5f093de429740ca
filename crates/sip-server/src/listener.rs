//! Declared listeners and their serve tasks.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use sip_transport::TransportLayer;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{instrument::WithSubscriber, warn};

/// Address → network name. Nothing is bound until [`Listeners::spawn_all`].
#[derive(Debug, Default)]
pub(crate) struct Listeners {
    declared: Mutex<BTreeMap<String, String>>,
}

impl Listeners {
    /// Records a listener; a later call for the same address replaces the
    /// network.
    pub(crate) fn declare(&self, network: &str, addr: &str) {
        self.declared
            .lock()
            .insert(addr.to_owned(), network.to_owned());
    }

    pub(crate) fn snapshot(&self) -> Vec<(String, String)> {
        self.declared
            .lock()
            .iter()
            .map(|(addr, network)| (network.clone(), addr.clone()))
            .collect()
    }

    /// Starts one transport serve loop per declared listener without waiting
    /// for any of them to bind.
    pub(crate) fn spawn_all(
        &self,
        transport: &TransportLayer,
        cancel: &CancellationToken,
        logger: &tracing::Dispatch,
    ) -> Vec<JoinHandle<()>> {
        self.snapshot()
            .into_iter()
            .map(|(network, addr)| {
                let transport = transport.clone();
                let cancel = cancel.clone();
                tokio::spawn(
                    async move {
                        if let Err(e) = transport.serve(cancel, &network, &addr).await {
                            warn!(error = %e, %network, %addr, "listener exited");
                        }
                    }
                    .with_subscriber(logger.clone()),
                )
            })
            .collect()
    }
}
