//! Network transport for the SIP server: UDP datagram loops, TCP accept loops
//! with `Content-Length` framing, outbound writes and fan-out of every parsed
//! inbound message to registered subscribers.

pub mod pool;
pub mod stream;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use sip_core::{RouteHeader, SipMessage};
use sip_dns::Resolver;
use sip_parse::{parse_message, serialize_message};
use smol_str::SmolStr;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::pool::ConnectionPool;
use crate::stream::run_stream_session;

/// Indicates which transport carried an inbound or outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
    Ws,
}

impl TransportKind {
    /// Lower-case name as used in URI `transport=` parameters and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
            TransportKind::Ws => "ws",
        }
    }

    /// Via header transport token.
    ///
    /// ```
    /// use sip_transport::TransportKind;
    ///
    /// assert_eq!(TransportKind::Udp.via_transport(), "UDP");
    /// assert_eq!(TransportKind::Ws.via_transport(), "WS");
    /// ```
    pub fn via_transport(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Ws => "WS",
        }
    }

    /// Parses a network name or Via transport token (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            "tls" => Some(TransportKind::Tls),
            "ws" => Some(TransportKind::Ws),
            _ => None,
        }
    }

    pub fn is_stream_based(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }
}

/// Lower-case form of a network name (`"UDP"` -> `"udp"`), as carried in a
/// Record-Route `transport` parameter.
pub fn network_to_lower(network: &str) -> SmolStr {
    SmolStr::new(network.to_ascii_lowercase())
}

/// Bytes received by a listener or an outbound connection.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub transport: TransportKind,
    pub peer: SocketAddr,
    pub payload: Bytes,
    pub stream: Option<mpsc::Sender<Bytes>>,
}

pub(crate) type InboundSink = Arc<dyn Fn(InboundPacket) + Send + Sync>;

/// Callback invoked with every parsed inbound message.
pub type MessageHandler = Arc<dyn Fn(SipMessage) + Send + Sync>;

/// Shared transport state. Cloning yields another handle to the same layer.
#[derive(Clone)]
pub struct TransportLayer {
    inner: Arc<Inner>,
}

struct Inner {
    resolver: Arc<dyn Resolver>,
    subscribers: RwLock<Vec<MessageHandler>>,
    udp: DashMap<SocketAddr, Arc<UdpSocket>>,
    tcp_listeners: DashMap<SocketAddr, ()>,
    pool: ConnectionPool,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Inner {
    fn deliver(&self, packet: InboundPacket) {
        let Some(mut msg) = parse_message(&packet.payload) else {
            debug!(peer = %packet.peer, bytes = packet.payload.len(), "discarding unparseable message");
            return;
        };
        msg.set_source(packet.peer);
        msg.set_transport(packet.transport.via_transport());

        let subscribers = self.subscribers.read().clone();
        if subscribers.is_empty() {
            debug!(peer = %packet.peer, "no message subscribers");
            return;
        }
        for subscriber in subscribers {
            subscriber(msg.clone());
        }
    }
}

impl std::fmt::Debug for TransportLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLayer")
            .field("closed", &self.is_closed())
            .field("local_addrs", &self.local_addrs())
            .finish()
    }
}

impl TransportLayer {
    /// Creates a layer that resolves destination names with `resolver`.
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        let cancel = CancellationToken::new();
        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<Inner>| {
            let weak = weak.clone();
            let sink: InboundSink = Arc::new(move |packet| {
                if let Some(inner) = weak.upgrade() {
                    inner.deliver(packet);
                }
            });
            Inner {
                resolver,
                subscribers: RwLock::new(Vec::new()),
                udp: DashMap::new(),
                tcp_listeners: DashMap::new(),
                pool: ConnectionPool::new(sink, cancel.clone()),
                cancel,
                closed: AtomicBool::new(false),
            }
        });
        Self { inner }
    }

    pub fn resolver(&self) -> Arc<dyn Resolver> {
        self.inner.resolver.clone()
    }

    /// Adds a subscriber for inbound messages. Subscriptions accumulate.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(SipMessage) + Send + Sync + 'static,
    {
        self.inner.subscribers.write().push(Arc::new(handler));
    }

    /// Runs a listener for `network` on `addr` until `cancel` fires or the
    /// layer is closed.
    ///
    /// # Errors
    ///
    /// Unsupported networks, bind failures and a closed layer.
    pub async fn serve(&self, cancel: CancellationToken, network: &str, addr: &str) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("transport layer closed"));
        }
        match TransportKind::parse(network) {
            Some(TransportKind::Udp) => self.serve_udp(cancel, addr).await,
            Some(TransportKind::Tcp) => self.serve_tcp(cancel, addr).await,
            _ => Err(anyhow!("unsupported network {:?}", network)),
        }
    }

    async fn serve_udp(&self, cancel: CancellationToken, addr: &str) -> Result<()> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        self.inner.udp.insert(local, socket.clone());
        info!(%local, "listening (udp)");

        let mut buf = vec![0u8; 65_535];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((n, peer)) => {
                    if n == buf.len() {
                        warn!(%peer, max = n, "udp datagram likely truncated (buffer full)");
                    }
                    self.inner.deliver(InboundPacket {
                        transport: TransportKind::Udp,
                        peer,
                        payload: Bytes::copy_from_slice(&buf[..n]),
                        stream: None,
                    });
                }
                Err(e) => debug!(%local, error = %e, "udp recv_from error"),
            }
        }

        self.inner.udp.remove(&local);
        debug!(%local, "udp listener stopped");
        Ok(())
    }

    async fn serve_tcp(&self, cancel: CancellationToken, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        self.inner.tcp_listeners.insert(local, ());
        info!(%local, "listening (tcp)");

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(%local, error = %e, "tcp accept error");
                    continue;
                }
            };

            let (tx, rx) = mpsc::channel::<Bytes>(64);
            self.inner.pool.register(peer, tx.clone());
            let inner = self.inner.clone();
            let session_cancel = self.inner.cancel.child_token();
            tokio::spawn(
                async move {
                    let sink: InboundSink = {
                        let inner = inner.clone();
                        Arc::new(move |packet| inner.deliver(packet))
                    };
                    run_stream_session(
                        peer,
                        stream,
                        TransportKind::Tcp,
                        sink,
                        tx.clone(),
                        rx,
                        session_cancel,
                    )
                    .await;
                    inner.pool.unregister(&peer, &tx);
                }
                .instrument(info_span!("tcp_session", %peer)),
            );
        }

        self.inner.tcp_listeners.remove(&local);
        debug!(%local, "tcp listener stopped");
        Ok(())
    }

    /// Serializes `msg` and sends it.
    ///
    /// Destination: the message's explicit destination; otherwise for
    /// requests the first Route URI or the Request-URI, for responses the top
    /// Via (`received` / `rport` before sent-by).
    pub async fn write_msg(&self, msg: &SipMessage) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("transport layer closed"));
        }
        let transport = msg.transport();
        let kind = TransportKind::parse(&transport)
            .ok_or_else(|| anyhow!("unknown transport {}", transport))?;
        let dest = self.resolve_destination(msg).await?;
        let data = serialize_message(msg);

        match kind {
            TransportKind::Udp => self.send_udp(dest, &data).await,
            TransportKind::Tcp => self.inner.pool.send_tcp(dest, data).await,
            other => Err(anyhow!("unsupported transport {}", other.as_str())),
        }
    }

    async fn resolve_destination(&self, msg: &SipMessage) -> Result<SocketAddr> {
        if let Some(dest) = msg.destination() {
            return Ok(dest);
        }
        match msg {
            SipMessage::Request(req) => {
                let uri = req
                    .headers()
                    .get("Route")
                    .and_then(|value| sip_core::split_list(value).first().copied())
                    .and_then(RouteHeader::parse)
                    .map(|route| route.uri)
                    .unwrap_or_else(|| req.uri().clone());
                let targets = self.inner.resolver.resolve(&uri).await?;
                let target = targets
                    .first()
                    .ok_or_else(|| anyhow!("no targets for {}", uri))?;
                if let Some(addr) = target.socket_addr() {
                    return Ok(addr);
                }
                self.lookup(&target.host, target.port).await
            }
            SipMessage::Response(res) => {
                let via = res
                    .headers()
                    .top_via()
                    .ok_or_else(|| anyhow!("response has no Via header"))?;
                let host = via.received().unwrap_or(via.host.as_str()).to_owned();
                let port = via.rport().or(via.port).unwrap_or(5060);
                self.lookup(&host, port).await
            }
        }
    }

    async fn lookup(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let ips = self.inner.resolver.lookup_ip(host).await?;
        let ip = ips
            .first()
            .ok_or_else(|| anyhow!("no addresses for {}", host))?;
        Ok(SocketAddr::new(*ip, port))
    }

    async fn send_udp(&self, dest: SocketAddr, data: &[u8]) -> Result<()> {
        let listening = self
            .inner
            .udp
            .iter()
            .find(|entry| entry.key().is_ipv4() == dest.is_ipv4())
            .map(|entry| entry.value().clone());
        let socket = match listening {
            Some(socket) => socket,
            None => {
                let bind = if dest.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                Arc::new(UdpSocket::bind(bind).await?)
            }
        };
        socket.send_to(data, dest).await?;
        debug!(%dest, bytes = data.len(), "udp sent");
        Ok(())
    }

    /// Stops every listener and drops pooled connections. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.pool.clear();
        self.inner.udp.clear();
        self.inner.tcp_listeners.clear();
        debug!("transport layer closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Addresses of the listeners currently running.
    pub fn local_addrs(&self) -> Vec<(TransportKind, SocketAddr)> {
        let mut addrs: Vec<_> = self
            .inner
            .udp
            .iter()
            .map(|entry| (TransportKind::Udp, *entry.key()))
            .chain(
                self.inner
                    .tcp_listeners
                    .iter()
                    .map(|entry| (TransportKind::Tcp, *entry.key())),
            )
            .collect();
        addrs.sort_by_key(|(_, addr)| *addr);
        addrs
    }

    /// Number of live stream connections.
    pub fn connection_count(&self) -> usize {
        self.inner.pool.len()
    }
}
