//! Method → handler table.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use sip_core::{Method, Request};
use sip_transaction::ServerTransaction;

/// Handles one inbound request.
///
/// The handler owns the transaction for as long as it runs; the server
/// terminates the transaction once `handle` returns. Closures of the form
/// `|req, tx| async move { .. }` implement this trait.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request, tx: ServerTransaction);
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Request, ServerTransaction) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, req: Request, tx: ServerTransaction) {
        (self)(req, tx).await
    }
}

/// Last registration for a method wins; lookups of unregistered methods
/// return `None`.
///
/// Registering while requests are being dispatched races with lookups: a
/// concurrent request may see the table before or after the insertion.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<Method, Arc<dyn RequestHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, method: Method, handler: Arc<dyn RequestHandler>) {
        self.handlers.write().insert(method, handler);
    }

    pub fn get(&self, method: &Method) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.read().get(method).cloned()
    }

    /// Registered methods in a stable order, for `Allow` headers.
    pub fn methods(&self) -> Vec<Method> {
        let mut methods: Vec<Method> = self.handlers.read().keys().cloned().collect();
        methods.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        methods
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
