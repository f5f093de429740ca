// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use sip_core::{Method, Request, Response, SipMessage};
use sip_dns::{DnsResolver, Resolver};
use sip_transaction::{ClientTransaction, ServerTransaction, TransactionLayer};
use sip_transport::TransportLayer;
use smol_str::SmolStr;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, instrument::WithSubscriber, Instrument};

use crate::{
    config::{host_string, resolve_self_ip, ServerConfig, ServerOption},
    dispatch::{Dispatcher, RequestObserver},
    error::{Result, ServerError},
    listener::Listeners,
    registry::{HandlerRegistry, RequestHandler},
    rewrite::HeaderRewriter,
};

type ResponseObserver = Arc<dyn Fn(&Response) + Send + Sync>;

/// SIP server: handler registry, header policy and the transport and
/// transaction layers it owns.
///
/// ```no_run
/// use sip_server::{with_ip, Server};
/// use sip_core::{Request, Response};
/// use sip_transaction::ServerTransaction;
///
/// # async fn run() -> Result<(), sip_server::ServerError> {
/// let server = std::sync::Arc::new(Server::new([with_ip("127.0.0.1:5060")])?);
/// server.on_options(|req: Request, tx: ServerTransaction| async move {
///     if let Ok(res) = Response::from_request(&req, 200, "OK") {
///         let _ = tx.respond(res).await;
///     }
/// });
/// server.listen("udp", "127.0.0.1:5060");
/// server.serve().await
/// # }
/// ```
pub struct Server {
    ip: IpAddr,
    user_agent: SmolStr,
    resolver: Arc<dyn Resolver>,
    rewriter: HeaderRewriter,
    registry: Arc<HandlerRegistry>,
    listeners: Listeners,
    request_observer: Arc<OnceCell<RequestObserver>>,
    response_observer: OnceCell<ResponseObserver>,
    transport: TransportLayer,
    transactions: TransactionLayer,
    logger: tracing::Dispatch,
    serving: AtomicBool,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("ip", &self.ip)
            .field("host", &self.host())
            .field("port", &self.port())
            .field("user_agent", &self.user_agent)
            .field("handlers", &self.registry.len())
            .finish()
    }
}

impl Server {
    /// Builds a server from `options`, applied in order.
    ///
    /// Without `with_ip` the local address is taken from the host's
    /// interfaces.
    ///
    /// # Errors
    ///
    /// The first failing option, or no usable local address.
    pub fn new(options: impl IntoIterator<Item = ServerOption>) -> Result<Self> {
        let mut config = ServerConfig::default();
        for option in options {
            option(&mut config)?;
        }

        let ip = match config.ip {
            Some(ip) => ip,
            None => resolve_self_ip()?,
        };
        let logger = config
            .logger
            .unwrap_or_else(|| tracing::dispatcher::get_default(|d| d.clone()));
        let resolver = config
            .resolver
            .unwrap_or_else(|| Arc::new(DnsResolver::from_system()));
        let user_agent = SmolStr::new(&config.user_agent);

        let registry = Arc::new(HandlerRegistry::new());
        let request_observer = Arc::new(OnceCell::new());
        let transport = TransportLayer::new(resolver.clone());
        let dispatcher = Dispatcher {
            registry: registry.clone(),
            request_observer: request_observer.clone(),
            transport: transport.clone(),
            user_agent: user_agent.clone(),
            logger: logger.clone(),
        };
        let transactions =
            TransactionLayer::with_timers(transport.clone(), Arc::new(dispatcher), config.timers);

        Ok(Self {
            ip,
            user_agent,
            resolver,
            rewriter: HeaderRewriter::new(host_string(ip), config.port),
            registry,
            listeners: Listeners::default(),
            request_observer,
            response_observer: OnceCell::new(),
            transport,
            transactions,
            logger,
            serving: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Host used in Via and Record-Route; IPv6 addresses are bracketed.
    pub fn host(&self) -> &str {
        self.rewriter.host()
    }

    pub fn port(&self) -> Option<u16> {
        self.rewriter.port()
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn resolver(&self) -> Arc<dyn Resolver> {
        self.resolver.clone()
    }

    pub fn transport_layer(&self) -> &TransportLayer {
        &self.transport
    }

    pub fn transaction_layer(&self) -> &TransactionLayer {
        &self.transactions
    }

    pub fn add_via_header(&self) -> bool {
        self.rewriter.add_via()
    }

    pub fn set_add_via_header(&self, enabled: bool) {
        self.rewriter.set_add_via(enabled);
    }

    pub fn add_record_route(&self) -> bool {
        self.rewriter.add_record_route()
    }

    pub fn set_add_record_route(&self, enabled: bool) {
        self.rewriter.set_add_record_route(enabled);
    }

    /// Declares a listener. No socket is opened until [`Server::serve`].
    pub fn listen(&self, network: &str, addr: &str) {
        self.listeners.declare(network, addr);
    }

    /// Serves until the process ends.
    pub async fn serve(&self) -> Result<()> {
        self.serve_with_cancel(CancellationToken::new()).await
    }

    /// Starts every declared listener, waits for `cancel`, then shuts down:
    /// transaction layer first, transport layer second.
    ///
    /// Listener failures are logged and do not end the call. A server is
    /// served at most once.
    ///
    /// # Errors
    ///
    /// [`ServerError::ShutDown`] if the server was already shut down,
    /// [`ServerError::AlreadyServing`] while another call is serving.
    pub async fn serve_with_cancel(&self, cancel: CancellationToken) -> Result<()> {
        if self.is_shut_down() {
            return Err(ServerError::ShutDown);
        }
        if self.serving.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyServing);
        }
        async {
            let span = info_span!("sip_server", host = %self.host());
            async {
                let tasks = self.listeners.spawn_all(&self.transport, &cancel, &self.logger);
                info!(listeners = tasks.len(), "serving");
                cancel.cancelled().await;
                self.shutdown();
            }
            .instrument(span)
            .await
        }
        .with_subscriber(self.logger.clone())
        .await;
        Ok(())
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transactions.close();
        self.transport.close();
        info!("server shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Registers `handler` for `method`, replacing any earlier one.
    ///
    /// Meant to be called before serving; a registration made while serving
    /// races with requests being dispatched.
    pub fn on_request(&self, method: Method, handler: impl RequestHandler) {
        self.registry.insert(method, Arc::new(handler));
    }

    pub fn on_invite(&self, handler: impl RequestHandler) {
        self.on_request(Method::Invite, handler);
    }

    pub fn on_ack(&self, handler: impl RequestHandler) {
        self.on_request(Method::Ack, handler);
    }

    pub fn on_cancel(&self, handler: impl RequestHandler) {
        self.on_request(Method::Cancel, handler);
    }

    pub fn on_bye(&self, handler: impl RequestHandler) {
        self.on_request(Method::Bye, handler);
    }

    pub fn on_register(&self, handler: impl RequestHandler) {
        self.on_request(Method::Register, handler);
    }

    pub fn on_options(&self, handler: impl RequestHandler) {
        self.on_request(Method::Options, handler);
    }

    pub fn on_subscribe(&self, handler: impl RequestHandler) {
        self.on_request(Method::Subscribe, handler);
    }

    pub fn on_notify(&self, handler: impl RequestHandler) {
        self.on_request(Method::Notify, handler);
    }

    pub fn on_refer(&self, handler: impl RequestHandler) {
        self.on_request(Method::Refer, handler);
    }

    pub fn on_info(&self, handler: impl RequestHandler) {
        self.on_request(Method::Info, handler);
    }

    pub fn on_message(&self, handler: impl RequestHandler) {
        self.on_request(Method::Message, handler);
    }

    pub fn on_prack(&self, handler: impl RequestHandler) {
        self.on_request(Method::Prack, handler);
    }

    pub fn on_update(&self, handler: impl RequestHandler) {
        self.on_request(Method::Update, handler);
    }

    pub fn on_publish(&self, handler: impl RequestHandler) {
        self.on_request(Method::Publish, handler);
    }

    /// Methods with a registered handler.
    pub fn methods(&self) -> Vec<Method> {
        self.registry.methods()
    }

    /// Rewrites `req` and starts a client transaction for it.
    pub async fn transaction_request(&self, mut req: Request) -> Result<ClientTransaction> {
        self.rewriter.update_request(&mut req);
        self.transactions
            .request(req)
            .await
            .map_err(ServerError::Transaction)
    }

    /// Rewrites `res` and sends it through `tx`.
    pub async fn transaction_reply(&self, tx: &ServerTransaction, mut res: Response) -> Result<()> {
        self.rewriter.update_response(&mut res);
        tx.respond(res).await.map_err(ServerError::Transaction)
    }

    /// Rewrites `req` and hands it straight to the transport.
    pub async fn write_request(&self, mut req: Request) -> Result<()> {
        self.rewriter.update_request(&mut req);
        self.transport
            .write_msg(&SipMessage::Request(req))
            .await
            .map_err(ServerError::Write)
    }

    /// Sends `res` through the transport unchanged.
    pub async fn write_response(&self, res: Response) -> Result<()> {
        self.transport
            .write_msg(&SipMessage::Response(res))
            .await
            .map_err(ServerError::Write)
    }

    /// Removes the top Via when it names this server.
    pub fn remove_via(&self, res: &mut Response) {
        self.rewriter.remove_via(res);
    }

    /// Sets the observer called with every inbound request before its
    /// handler.
    ///
    /// # Errors
    ///
    /// [`ServerError::ObserverAlreadyRegistered`] on a second call.
    pub fn serve_request<F>(&self, observer: F) -> Result<()>
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.request_observer
            .set(Arc::new(observer))
            .map_err(|_| ServerError::ObserverAlreadyRegistered { observer: "request" })
    }

    /// Sets the observer called with every response the transport receives,
    /// whether or not a transaction matches it.
    ///
    /// # Errors
    ///
    /// [`ServerError::ObserverAlreadyRegistered`] on a second call.
    pub fn serve_response<F>(&self, observer: F) -> Result<()>
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        let observer: ResponseObserver = Arc::new(observer);
        self.response_observer
            .set(observer.clone())
            .map_err(|_| ServerError::ObserverAlreadyRegistered { observer: "response" })?;
        self.transport.on_message(move |msg| {
            if let SipMessage::Response(res) = msg {
                observer(&res);
            }
        });
        Ok(())
    }
}
