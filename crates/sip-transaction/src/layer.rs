// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Async runtime for live transactions.
//!
//! [`TransactionLayer`] subscribes to a [`TransportLayer`], matches inbound
//! messages to transactions, drives the state machines in [`crate::fsm`] and
//! runs their timers. New server transactions are handed to the
//! [`TransactionUser`]; client transactions are created with
//! [`TransactionLayer::request`].

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use sip_core::{Headers, Method, Request, RequestLine, Response, SipMessage};
use sip_transport::TransportLayer;
use smol_str::SmolStr;
use tokio::{
    sync::{mpsc, oneshot},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    fsm::{
        ClientAction, ClientInviteEvent, ClientInviteFsm, ClientNonInviteEvent, ClientNonInviteFsm,
        ServerAction, ServerInviteEvent, ServerInviteFsm, ServerNonInviteEvent, ServerNonInviteFsm,
    },
    generate_branch_id,
    timers::{TimerConfig, Transport, TransportAwareTimers},
    TransactionError, TransactionKey, TransactionTimer,
};

/// Receives requests that open a new server transaction.
///
/// Called inline from the transport receive path, so implementations must
/// hand long-running work off to a task.
pub trait TransactionUser: Send + Sync + 'static {
    fn on_request(&self, req: Request, tx: ServerTransaction);
}

/// Completion and error signals shared between a transaction and its handles.
struct TxShared {
    done: CancellationToken,
    errors_tx: Mutex<Option<mpsc::UnboundedSender<TransactionError>>>,
    errors_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransactionError>>,
}

impl TxShared {
    fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            done: CancellationToken::new(),
            errors_tx: Mutex::new(Some(tx)),
            errors_rx: tokio::sync::Mutex::new(rx),
        })
    }

    fn finish(&self, error: Option<TransactionError>) {
        if let Some(tx) = self.errors_tx.lock().take() {
            if let Some(error) = error {
                let _ = tx.send(error);
            }
        }
        self.done.cancel();
    }

    async fn next_error(&self) -> Option<TransactionError> {
        self.errors_rx.lock().await.recv().await
    }
}

enum ServerKind {
    Invite(ServerInviteFsm),
    NonInvite(ServerNonInviteFsm),
}

struct ServerEntry {
    kind: ServerKind,
    timers: HashMap<TransactionTimer, oneshot::Sender<()>>,
    shared: Arc<TxShared>,
}

enum ClientKind {
    Invite(ClientInviteFsm),
    NonInvite(ClientNonInviteFsm),
}

struct ClientEntry {
    kind: ClientKind,
    request: Request,
    timers: HashMap<TransactionTimer, oneshot::Sender<()>>,
    responses: mpsc::UnboundedSender<Response>,
    shared: Arc<TxShared>,
}

fn cancel_timer(timers: &mut HashMap<TransactionTimer, oneshot::Sender<()>>, timer: TransactionTimer) {
    if let Some(cancel) = timers.remove(&timer) {
        let _ = cancel.send(());
    }
}

fn cancel_all(timers: &mut HashMap<TransactionTimer, oneshot::Sender<()>>) {
    for (_, cancel) in timers.drain() {
        let _ = cancel.send(());
    }
}

struct LayerInner {
    transport: TransportLayer,
    user: Arc<dyn TransactionUser>,
    server: DashMap<TransactionKey, ServerEntry>,
    client: DashMap<TransactionKey, ClientEntry>,
    timers: TimerConfig,
    closed: AtomicBool,
}

/// Owns every live client and server transaction.
#[derive(Clone)]
pub struct TransactionLayer {
    inner: Arc<LayerInner>,
}

impl std::fmt::Debug for TransactionLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLayer")
            .field("server", &self.inner.server.len())
            .field("client", &self.inner.client.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TransactionLayer {
    pub fn new(transport: TransportLayer, user: Arc<dyn TransactionUser>) -> Self {
        Self::with_timers(transport, user, TimerConfig::default())
    }

    /// Creates a layer with custom base timers and subscribes it to
    /// `transport`.
    pub fn with_timers(
        transport: TransportLayer,
        user: Arc<dyn TransactionUser>,
        timers: TimerConfig,
    ) -> Self {
        let inner = Arc::new(LayerInner {
            transport: transport.clone(),
            user,
            server: DashMap::new(),
            client: DashMap::new(),
            timers,
            closed: AtomicBool::new(false),
        });
        let weak: Weak<LayerInner> = Arc::downgrade(&inner);
        transport.on_message(move |msg| {
            if let Some(inner) = weak.upgrade() {
                TransactionLayer { inner }.handle_message(msg);
            }
        });
        Self { inner }
    }

    pub fn transport(&self) -> &TransportLayer {
        &self.inner.transport
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn server_transaction_count(&self) -> usize {
        self.inner.server.len()
    }

    pub fn client_transaction_count(&self) -> usize {
        self.inner.client.len()
    }

    fn handle_message(&self, msg: SipMessage) {
        if self.is_closed() {
            debug!("transaction layer closed, dropping inbound message");
            return;
        }
        match msg {
            SipMessage::Request(req) => self.handle_request(req),
            SipMessage::Response(res) => self.handle_response(res),
        }
    }

    fn handle_request(&self, req: Request) {
        let key = TransactionKey::from_request(&req, true).unwrap_or_else(|| TransactionKey {
            branch: generate_branch_id(),
            method: req.method().clone(),
            is_server: true,
        });

        if req.method() == &Method::Ack {
            let invite = key.invite_sibling();
            if let Some(mut entry) = self.inner.server.get_mut(&invite) {
                if let ServerKind::Invite(fsm) = &mut entry.kind {
                    let actions = fsm.on_event(ServerInviteEvent::ReceiveAck);
                    drop(entry);
                    self.spawn_server_actions(invite, actions);
                    return;
                }
            }
            // 2xx ACKs are end-to-end and never match a server transaction.
            let shared = TxShared::new();
            shared.finish(None);
            let tx = ServerTransaction::new(self.clone(), key, req.clone(), shared);
            self.inner.user.on_request(req, tx);
            return;
        }

        if let Some(entry) = self.inner.server.get(&key) {
            let actions = match &entry.kind {
                ServerKind::Invite(fsm) => fsm.on_retransmit(),
                ServerKind::NonInvite(fsm) => fsm.on_retransmit(),
            };
            drop(entry);
            debug!(branch = %key.branch, method = %key.method, "request retransmission");
            self.spawn_server_actions(key, actions);
            return;
        }

        let timers = TransportAwareTimers::with_config(
            Transport::from_token(&req.transport()),
            self.inner.timers,
        );
        let (kind, actions) = if req.method() == &Method::Invite {
            let mut fsm = ServerInviteFsm::new(timers);
            let actions = fsm.on_event(ServerInviteEvent::ReceiveInvite);
            (ServerKind::Invite(fsm), actions)
        } else {
            let mut fsm = ServerNonInviteFsm::new(timers);
            let actions = fsm.on_event(ServerNonInviteEvent::ReceiveRequest);
            (ServerKind::NonInvite(fsm), actions)
        };

        let shared = TxShared::new();
        self.inner.server.insert(
            key.clone(),
            ServerEntry {
                kind,
                timers: HashMap::new(),
                shared: shared.clone(),
            },
        );
        for action in actions {
            self.apply_server_control(&key, action);
        }

        debug!(branch = %key.branch, method = %key.method, "server transaction created");
        let tx = ServerTransaction::new(self.clone(), key, req.clone(), shared);
        self.inner.user.on_request(req, tx);
    }

    fn handle_response(&self, res: Response) {
        let Some(key) = TransactionKey::from_response(&res) else {
            debug!(code = res.code(), "response without branch or CSeq dropped");
            return;
        };
        let Some(mut entry) = self.inner.client.get_mut(&key) else {
            debug!(code = res.code(), branch = %key.branch, "response matches no client transaction");
            return;
        };
        let provisional = res.is_provisional();
        let actions = match &mut entry.kind {
            ClientKind::Invite(fsm) if provisional => {
                fsm.on_event(ClientInviteEvent::ReceiveProvisional(res))
            }
            ClientKind::Invite(fsm) => fsm.on_event(ClientInviteEvent::ReceiveFinal(res)),
            ClientKind::NonInvite(fsm) if provisional => {
                fsm.on_event(ClientNonInviteEvent::ReceiveProvisional(res))
            }
            ClientKind::NonInvite(fsm) => fsm.on_event(ClientNonInviteEvent::ReceiveFinal(res)),
        };
        drop(entry);
        self.spawn_client_actions(key, actions);
    }

    fn spawn_server_actions(&self, key: TransactionKey, actions: Vec<ServerAction>) {
        if actions.is_empty() {
            return;
        }
        let layer = self.clone();
        tokio::spawn(async move {
            let _ = layer.apply_server_actions(&key, actions).await;
        });
    }

    fn spawn_client_actions(&self, key: TransactionKey, actions: Vec<ClientAction>) {
        if actions.is_empty() {
            return;
        }
        let layer = self.clone();
        tokio::spawn(async move {
            let _ = layer.apply_client_actions(&key, actions).await;
        });
    }

    async fn apply_server_actions(
        &self,
        key: &TransactionKey,
        actions: Vec<ServerAction>,
    ) -> Result<()> {
        for action in actions {
            match action {
                ServerAction::Transmit(response) => {
                    if let Err(e) = self
                        .inner
                        .transport
                        .write_msg(&SipMessage::Response(response))
                        .await
                    {
                        warn!(%e, branch = %key.branch, "server transaction transmit failed");
                        self.server_transport_error(key, e.to_string());
                        return Err(e);
                    }
                }
                other => self.apply_server_control(key, other),
            }
        }
        Ok(())
    }

    fn apply_server_control(&self, key: &TransactionKey, action: ServerAction) {
        match action {
            ServerAction::Schedule { timer, duration } => {
                self.schedule_server_timer(key.clone(), timer, duration)
            }
            ServerAction::Cancel(timer) => {
                if let Some(mut entry) = self.inner.server.get_mut(key) {
                    cancel_timer(&mut entry.timers, timer);
                }
            }
            ServerAction::Terminate { reason, error } => {
                if let Some((_, mut entry)) = self.inner.server.remove(key) {
                    cancel_all(&mut entry.timers);
                    debug!(branch = %key.branch, %reason, "server transaction terminated");
                    entry.shared.finish(error);
                }
            }
            ServerAction::Transmit(_) => {}
        }
    }

    fn server_transport_error(&self, key: &TransactionKey, error: String) {
        let Some(mut entry) = self.inner.server.get_mut(key) else {
            return;
        };
        let actions = match &mut entry.kind {
            ServerKind::Invite(fsm) => fsm.on_event(ServerInviteEvent::TransportError(error)),
            ServerKind::NonInvite(fsm) => fsm.on_event(ServerNonInviteEvent::TransportError(error)),
        };
        drop(entry);
        for action in actions {
            self.apply_server_control(key, action);
        }
    }

    fn schedule_server_timer(&self, key: TransactionKey, timer: TransactionTimer, duration: Duration) {
        let Some(mut entry) = self.inner.server.get_mut(&key) else {
            return;
        };
        cancel_timer(&mut entry.timers, timer);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        entry.timers.insert(timer, cancel_tx);
        drop(entry);

        let layer = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(duration) => layer.server_timer_fired(key, timer).await,
                _ = &mut cancel_rx => {}
            }
        });
    }

    async fn server_timer_fired(&self, key: TransactionKey, timer: TransactionTimer) {
        let Some(mut entry) = self.inner.server.get_mut(&key) else {
            return;
        };
        entry.timers.remove(&timer);
        let actions = match &mut entry.kind {
            ServerKind::Invite(fsm) => fsm.on_event(ServerInviteEvent::TimerFired(timer)),
            ServerKind::NonInvite(fsm) => fsm.on_event(ServerNonInviteEvent::TimerFired(timer)),
        };
        drop(entry);
        let _ = self.apply_server_actions(&key, actions).await;
    }

    async fn respond(&self, key: &TransactionKey, response: Response) -> Result<()> {
        let Some(mut entry) = self.inner.server.get_mut(key) else {
            bail!(TransactionError::Terminated);
        };
        let provisional = response.is_provisional();
        let actions = match &mut entry.kind {
            ServerKind::Invite(fsm) if provisional => {
                fsm.on_event(ServerInviteEvent::SendProvisional(response))
            }
            ServerKind::Invite(fsm) => fsm.on_event(ServerInviteEvent::SendFinal(response)),
            ServerKind::NonInvite(fsm) if provisional => {
                fsm.on_event(ServerNonInviteEvent::SendProvisional(response))
            }
            ServerKind::NonInvite(fsm) => fsm.on_event(ServerNonInviteEvent::SendFinal(response)),
        };
        drop(entry);
        if actions.is_empty() {
            bail!("response not allowed in the current transaction state");
        }
        self.apply_server_actions(key, actions).await
    }

    fn terminate_server(&self, key: &TransactionKey) {
        if let Some((_, mut entry)) = self.inner.server.remove(key) {
            cancel_all(&mut entry.timers);
            debug!(branch = %key.branch, "server transaction terminated by owner");
            entry.shared.finish(None);
        }
    }

    /// Starts a client transaction and transmits `req`.
    ///
    /// The key is the top Via branch plus the method, so callers must set a
    /// unique branch first.
    ///
    /// # Errors
    ///
    /// A closed layer, an ACK, a missing branch, a duplicate key or a failed
    /// first transmission.
    pub async fn request(&self, req: Request) -> Result<ClientTransaction> {
        if self.is_closed() {
            bail!("transaction layer closed");
        }
        if req.method() == &Method::Ack {
            bail!("ACK does not create a client transaction");
        }
        let key = TransactionKey::from_request(&req, false)
            .ok_or_else(|| anyhow!("request has no Via branch"))?;
        if self.inner.client.contains_key(&key) {
            bail!("client transaction {} already exists", key.branch);
        }

        let timers = TransportAwareTimers::with_config(
            Transport::from_token(&req.transport()),
            self.inner.timers,
        );
        let (kind, actions) = if req.method() == &Method::Invite {
            let mut fsm = ClientInviteFsm::new(timers);
            let actions = fsm.on_event(ClientInviteEvent::SendInvite(req.clone()));
            (ClientKind::Invite(fsm), actions)
        } else {
            let mut fsm = ClientNonInviteFsm::new(timers);
            let actions = fsm.on_event(ClientNonInviteEvent::SendRequest(req.clone()));
            (ClientKind::NonInvite(fsm), actions)
        };

        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let shared = TxShared::new();
        self.inner.client.insert(
            key.clone(),
            ClientEntry {
                kind,
                request: req,
                timers: HashMap::new(),
                responses: responses_tx,
                shared: shared.clone(),
            },
        );
        debug!(branch = %key.branch, method = %key.method, "client transaction created");

        self.apply_client_actions(&key, actions).await?;
        Ok(ClientTransaction {
            layer: self.clone(),
            key,
            responses: Arc::new(tokio::sync::Mutex::new(responses_rx)),
            shared,
        })
    }

    async fn apply_client_actions(
        &self,
        key: &TransactionKey,
        actions: Vec<ClientAction>,
    ) -> Result<()> {
        for action in actions {
            match action {
                ClientAction::Transmit(request) => {
                    if let Err(e) = self
                        .inner
                        .transport
                        .write_msg(&SipMessage::Request(request))
                        .await
                    {
                        warn!(%e, branch = %key.branch, "client transaction transmit failed");
                        self.client_transport_error(key, e.to_string());
                        return Err(e);
                    }
                }
                ClientAction::Deliver(response) => {
                    if let Some(entry) = self.inner.client.get(key) {
                        let _ = entry.responses.send(response);
                    }
                }
                ClientAction::GenerateAck(response) => {
                    let Some(ack) = self
                        .inner
                        .client
                        .get(key)
                        .and_then(|entry| build_ack(&entry.request, &response))
                    else {
                        continue;
                    };
                    if let Err(e) = self.inner.transport.write_msg(&SipMessage::Request(ack)).await {
                        warn!(%e, branch = %key.branch, "failed to send ACK");
                    }
                }
                other => self.apply_client_control(key, other),
            }
        }
        Ok(())
    }

    fn apply_client_control(&self, key: &TransactionKey, action: ClientAction) {
        match action {
            ClientAction::Schedule { timer, duration } => {
                self.schedule_client_timer(key.clone(), timer, duration)
            }
            ClientAction::Cancel(timer) => {
                if let Some(mut entry) = self.inner.client.get_mut(key) {
                    cancel_timer(&mut entry.timers, timer);
                }
            }
            ClientAction::Terminate { reason, error } => {
                if let Some((_, mut entry)) = self.inner.client.remove(key) {
                    cancel_all(&mut entry.timers);
                    debug!(branch = %key.branch, %reason, "client transaction terminated");
                    entry.shared.finish(error);
                }
            }
            ClientAction::Transmit(_) | ClientAction::Deliver(_) | ClientAction::GenerateAck(_) => {}
        }
    }

    fn client_transport_error(&self, key: &TransactionKey, error: String) {
        let Some(mut entry) = self.inner.client.get_mut(key) else {
            return;
        };
        let actions = match &mut entry.kind {
            ClientKind::Invite(fsm) => fsm.on_event(ClientInviteEvent::TransportError(error)),
            ClientKind::NonInvite(fsm) => fsm.on_event(ClientNonInviteEvent::TransportError(error)),
        };
        drop(entry);
        for action in actions {
            self.apply_client_control(key, action);
        }
    }

    fn schedule_client_timer(&self, key: TransactionKey, timer: TransactionTimer, duration: Duration) {
        let Some(mut entry) = self.inner.client.get_mut(&key) else {
            return;
        };
        cancel_timer(&mut entry.timers, timer);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        entry.timers.insert(timer, cancel_tx);
        drop(entry);

        let layer = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(duration) => layer.client_timer_fired(key, timer).await,
                _ = &mut cancel_rx => {}
            }
        });
    }

    async fn client_timer_fired(&self, key: TransactionKey, timer: TransactionTimer) {
        let Some(mut entry) = self.inner.client.get_mut(&key) else {
            return;
        };
        entry.timers.remove(&timer);
        let actions = match &mut entry.kind {
            ClientKind::Invite(fsm) => fsm.on_event(ClientInviteEvent::TimerFired(timer)),
            ClientKind::NonInvite(fsm) => fsm.on_event(ClientNonInviteEvent::TimerFired(timer)),
        };
        drop(entry);
        let _ = self.apply_client_actions(&key, actions).await;
    }

    fn terminate_client(&self, key: &TransactionKey) {
        if let Some((_, mut entry)) = self.inner.client.remove(key) {
            cancel_all(&mut entry.timers);
            debug!(branch = %key.branch, "client transaction terminated by owner");
            entry.shared.finish(None);
        }
    }

    /// Terminates every live transaction and stops accepting new ones.
    /// Calling it again has no effect.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let server_keys: Vec<_> = self.inner.server.iter().map(|e| e.key().clone()).collect();
        for key in server_keys {
            if let Some((_, mut entry)) = self.inner.server.remove(&key) {
                cancel_all(&mut entry.timers);
                entry.shared.finish(Some(TransactionError::Terminated));
            }
        }
        let client_keys: Vec<_> = self.inner.client.iter().map(|e| e.key().clone()).collect();
        for key in client_keys {
            if let Some((_, mut entry)) = self.inner.client.remove(&key) {
                cancel_all(&mut entry.timers);
                entry.shared.finish(Some(TransactionError::Terminated));
            }
        }
        debug!("transaction layer closed");
    }
}

/// ACK for a non-2xx final response (RFC 3261 §17.1.1.3): same Request-URI,
/// top Via, From, Call-ID and Route set as the INVITE, To from the response.
fn build_ack(invite: &Request, response: &Response) -> Option<Request> {
    let mut headers = Headers::new();
    let via = invite.headers().top_via()?;
    headers.push(SmolStr::new("Via"), SmolStr::new(via.to_string()));
    for value in invite.headers().get_all("Route") {
        headers.push(SmolStr::new("Route"), value.clone());
    }
    for name in ["From", "Call-ID"] {
        headers.push(SmolStr::new(name), invite.headers().get(name)?.clone());
    }
    let to = response
        .headers()
        .get("To")
        .or_else(|| invite.headers().get("To"))?;
    headers.push(SmolStr::new("To"), to.clone());
    let seq = invite.headers().get("CSeq")?.split_whitespace().next()?.to_owned();
    headers.push(SmolStr::new("CSeq"), SmolStr::new(format!("{seq} ACK")));
    headers.push(SmolStr::new("Max-Forwards"), SmolStr::new("70"));

    let mut ack = Request::new(
        RequestLine::new(Method::Ack, invite.uri().clone()),
        headers,
        Bytes::new(),
    )
    .ok()?;
    if let Some(dest) = invite.destination() {
        ack.set_destination(dest);
    }
    ack.set_transport(&invite.transport());
    Some(ack)
}

/// Handle to a server transaction, given to the transaction user.
#[derive(Clone)]
pub struct ServerTransaction {
    layer: TransactionLayer,
    key: TransactionKey,
    request: Arc<Request>,
    shared: Arc<TxShared>,
}

impl std::fmt::Debug for ServerTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransaction")
            .field("key", &self.key)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl ServerTransaction {
    fn new(layer: TransactionLayer, key: TransactionKey, request: Request, shared: Arc<TxShared>) -> Self {
        Self {
            layer,
            key,
            request: Arc::new(request),
            shared,
        }
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// The request that opened the transaction.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Sends `response` through the state machine.
    ///
    /// # Errors
    ///
    /// The transaction already terminated, the request was an ACK, or the
    /// transport failed (which also terminates the transaction).
    pub async fn respond(&self, response: Response) -> Result<()> {
        if self.request.method() == &Method::Ack {
            bail!("ACK cannot be answered");
        }
        if self.is_terminated() {
            bail!(TransactionError::Terminated);
        }
        self.layer.respond(&self.key, response).await
    }

    /// Cancelled once the transaction terminates.
    pub fn done(&self) -> CancellationToken {
        self.shared.done.clone()
    }

    /// Next error reported by the transaction. `None` once it terminated and
    /// every error was read.
    pub async fn next_error(&self) -> Option<TransactionError> {
        self.shared.next_error().await
    }

    /// Terminates the transaction now. Idempotent.
    pub fn terminate(&self) {
        self.layer.terminate_server(&self.key);
        self.shared.finish(None);
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.done.is_cancelled()
    }
}

/// Handle to a client transaction.
#[derive(Clone)]
pub struct ClientTransaction {
    layer: TransactionLayer,
    key: TransactionKey,
    responses: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Response>>>,
    shared: Arc<TxShared>,
}

impl std::fmt::Debug for ClientTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTransaction")
            .field("key", &self.key)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl ClientTransaction {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// Next provisional or final response. `None` after termination.
    pub async fn next_response(&self) -> Option<Response> {
        self.responses.lock().await.recv().await
    }

    pub fn done(&self) -> CancellationToken {
        self.shared.done.clone()
    }

    pub async fn next_error(&self) -> Option<TransactionError> {
        self.shared.next_error().await
    }

    pub fn terminate(&self) {
        self.layer.terminate_client(&self.key);
        self.shared.finish(None);
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.done.is_cancelled()
    }
}
