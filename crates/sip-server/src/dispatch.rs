// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bridge between the transaction layer and the handler registry.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use sip_core::{Method, Request, Response, SipMessage};
use sip_transaction::{ServerTransaction, TransactionUser};
use sip_transport::TransportLayer;
use smol_str::SmolStr;
use tracing::{error, instrument::WithSubscriber, warn, Instrument};

use crate::registry::HandlerRegistry;

pub(crate) type RequestObserver = Arc<dyn Fn(&Request) + Send + Sync>;

/// Transaction user of the server: each new server transaction becomes one
/// spawned handling unit.
pub(crate) struct Dispatcher {
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) request_observer: Arc<OnceCell<RequestObserver>>,
    pub(crate) transport: TransportLayer,
    pub(crate) user_agent: SmolStr,
    pub(crate) logger: tracing::Dispatch,
}

impl TransactionUser for Dispatcher {
    fn on_request(&self, req: Request, tx: ServerTransaction) {
        let unit = HandlingUnit {
            registry: self.registry.clone(),
            request_observer: self.request_observer.clone(),
            transport: self.transport.clone(),
            user_agent: self.user_agent.clone(),
        };
        let logger = self.logger.clone();
        tokio::spawn(
            async move {
                let span = tracing::debug_span!(
                    "sip_server",
                    method = %req.method(),
                    branch = %tx.key().branch,
                );
                unit.run(req, tx).instrument(span).await
            }
            .with_subscriber(logger),
        );
    }
}

struct HandlingUnit {
    registry: Arc<HandlerRegistry>,
    request_observer: Arc<OnceCell<RequestObserver>>,
    transport: TransportLayer,
    user_agent: SmolStr,
}

impl HandlingUnit {
    async fn run(self, req: Request, tx: ServerTransaction) {
        if let Some(observer) = self.request_observer.get() {
            observer(&req);
        }

        let Some(handler) = self.registry.get(req.method()) else {
            warn!(method = %req.method(), "SIP request handler not found");
            self.reject(&req).await;
            drain(&tx).await;
            return;
        };

        let _terminate = TerminateOnDrop(tx.clone());
        handler.handle(req, tx).await;
    }

    /// Stateless 405. ACK never gets a response (RFC 3261 §17.1.1.3).
    async fn reject(&self, req: &Request) {
        if req.method() == &Method::Ack {
            return;
        }
        let res = match method_not_allowed(req, &self.registry, &self.user_agent) {
            Ok(res) => res,
            Err(e) => {
                error!(error = %e, "failed to build 405 Method Not Allowed");
                return;
            }
        };
        if let Err(e) = self.transport.write_msg(&SipMessage::Response(res)).await {
            error!(error = %e, "respond '405 Method Not Allowed' failed");
        }
    }
}

/// Terminates the transaction once the handler is finished with it, also
/// when the handler panics.
struct TerminateOnDrop(ServerTransaction);

impl Drop for TerminateOnDrop {
    fn drop(&mut self) {
        self.0.terminate();
    }
}

/// Waits until the transaction completes or its error stream closes.
async fn drain(tx: &ServerTransaction) {
    let done = tx.done();
    loop {
        // Errors first: `finish` publishes before it cancels `done`.
        tokio::select! {
            biased;
            err = tx.next_error() => match err {
                Some(e) => warn!(error = %e, key = ?tx.key(), "error from SIP server transaction"),
                None => return,
            },
            _ = done.cancelled() => return,
        }
    }
}

pub(crate) fn method_not_allowed(
    req: &Request,
    registry: &HandlerRegistry,
    user_agent: &str,
) -> Result<Response, sip_core::MessageError> {
    let mut res = Response::from_request(req, 405, "Method Not Allowed")?;
    let allow = registry
        .methods()
        .iter()
        .map(|m| m.as_str().to_owned())
        .collect::<Vec<_>>()
        .join(", ");
    let headers = res.headers_mut();
    headers.push(SmolStr::new("Allow"), SmolStr::new(allow));
    headers.push(SmolStr::new("Server"), SmolStr::new(user_agent));
    if let Some(to) = headers.get("To").cloned() {
        if !to.contains(";tag=") {
            let tag = sip_transaction::generate_tag();
            headers.set(SmolStr::new("To"), SmolStr::new(format!("{to};tag={tag}")));
        }
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_testkit::build_request;

    #[test]
    fn method_not_allowed_lists_registered_methods() {
        let registry = HandlerRegistry::new();
        registry.insert(
            Method::Options,
            Arc::new(|_req: Request, _tx: ServerTransaction| async {}),
        );
        registry.insert(
            Method::Invite,
            Arc::new(|_req: Request, _tx: ServerTransaction| async {}),
        );
        let req = build_request(Method::Publish, "sip:bob@example.com", "10.0.0.9:5060", "z9hG4bK405");

        let res = method_not_allowed(&req, &registry, "siphon-test").unwrap();
        assert_eq!(res.code(), 405);
        assert_eq!(res.reason(), "Method Not Allowed");
        assert_eq!(res.headers().get("Allow").unwrap().as_str(), "INVITE, OPTIONS");
        assert_eq!(res.headers().get("Server").unwrap().as_str(), "siphon-test");
        assert!(res.headers().get("To").unwrap().contains(";tag="));
        assert_eq!(res.headers().top_via().unwrap().branch(), Some("z9hG4bK405"));
    }
}
