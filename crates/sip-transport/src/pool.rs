// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, Sender},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{stream::run_stream_session, InboundSink, TransportKind};

/// Maximum number of pooled TCP connections.
const MAX_POOL_SIZE: usize = 1000;

/// Idle timeout for pooled connections.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct PoolEntry {
    sender: Sender<Bytes>,
    last_used: Instant,
}

impl PoolEntry {
    fn new(sender: Sender<Bytes>) -> Self {
        Self {
            sender,
            last_used: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    fn is_idle(&self, timeout: Duration) -> bool {
        self.last_used.elapsed() > timeout
    }
}

/// Live stream connections keyed by peer address.
///
/// Holds both connections accepted by a listener and connections opened for
/// outbound writes, so a response to a peer reuses whichever one exists.
pub(crate) struct ConnectionPool {
    tcp: Arc<DashMap<SocketAddr, PoolEntry>>,
    max_size: usize,
    idle_timeout: Duration,
    sink: InboundSink,
    cancel: CancellationToken,
}

impl ConnectionPool {
    pub(crate) fn new(sink: InboundSink, cancel: CancellationToken) -> Self {
        Self::with_limits(sink, cancel, MAX_POOL_SIZE, IDLE_TIMEOUT)
    }

    pub(crate) fn with_limits(
        sink: InboundSink,
        cancel: CancellationToken,
        max_size: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            tcp: Arc::new(DashMap::new()),
            max_size,
            idle_timeout,
            sink,
            cancel,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tcp.len()
    }

    /// Tracks a connection accepted by a listener.
    pub(crate) fn register(&self, peer: SocketAddr, sender: Sender<Bytes>) {
        self.make_room();
        self.tcp.insert(peer, PoolEntry::new(sender));
    }

    /// Forgets `peer` if it is still bound to `sender`.
    pub(crate) fn unregister(&self, peer: &SocketAddr, sender: &Sender<Bytes>) {
        self.tcp
            .remove_if(peer, |_, entry| entry.sender.same_channel(sender));
    }

    pub(crate) fn clear(&self) {
        self.tcp.clear();
    }

    /// Removes idle connections that exceed the idle timeout.
    pub(crate) fn cleanup_idle(&self) -> usize {
        let mut removed = 0;
        self.tcp.retain(|addr, entry| {
            if entry.is_idle(self.idle_timeout) {
                debug!(peer = %addr, "removing idle connection");
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Evicts roughly 10% of capacity, oldest first.
    fn evict_lru(&self) {
        let evict_count = (self.max_size / 10).max(1);

        let mut entries: Vec<_> = self
            .tcp
            .iter()
            .map(|entry| (*entry.key(), entry.value().last_used))
            .collect();
        entries.sort_by_key(|(_, last_used)| *last_used);

        for (addr, _) in entries.iter().take(evict_count) {
            debug!(peer = %addr, "evicting LRU connection");
            self.tcp.remove(addr);
        }
    }

    fn make_room(&self) {
        if self.tcp.len() >= self.max_size {
            self.cleanup_idle();
            if self.tcp.len() >= self.max_size {
                self.evict_lru();
            }
        }
    }

    /// Sends bytes over a pooled TCP connection; opens one if missing.
    pub(crate) async fn send_tcp(&self, addr: SocketAddr, payload: Bytes) -> Result<()> {
        let existing = self.tcp.get_mut(&addr).map(|mut entry| {
            entry.touch();
            entry.sender.clone()
        });
        if let Some(sender) = existing {
            if sender.send(payload.clone()).await.is_ok() {
                return Ok(());
            }
            self.unregister(&addr, &sender);
        }

        self.make_room();

        let stream = TcpStream::connect(addr).await?;
        let (tx, rx) = mpsc::channel::<Bytes>(64);
        self.tcp.insert(addr, PoolEntry::new(tx.clone()));
        debug!(peer = %addr, "opened outbound tcp connection");

        let map = self.tcp.clone();
        let sink = self.sink.clone();
        let cancel = self.cancel.clone();
        let session_tx = tx.clone();
        tokio::spawn(async move {
            run_stream_session(
                addr,
                stream,
                TransportKind::Tcp,
                sink,
                session_tx.clone(),
                rx,
                cancel,
            )
            .await;
            map.remove_if(&addr, |_, entry| entry.sender.same_channel(&session_tx));
        });

        let result = tx
            .send(payload)
            .await
            .map_err(|_| anyhow!("connection writer closed"));
        if result.is_err() {
            self.unregister(&addr, &tx);
        }
        result
    }
}
