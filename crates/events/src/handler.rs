//! Handlers that receive dead-lettered events during reprocessing.
//!
//! A handler is any async-capable callable taking a record and reporting
//! success or failure. Synchronous code is adapted with [`sync_handler`];
//! async closures with [`handler_fn`].
//!
//! Registration is explicit: [`HandlerRegistry::add`] returns a token that
//! [`HandlerRegistry::remove`] accepts. Handlers run in registration order.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use uno_core::HandlerId;

use crate::record::DeadLetterRecord;

/// Reprocesses one dead-lettered event.
///
/// Returning `Err` (or exceeding the caller's timeout) counts as a failed
/// attempt. Handlers must tolerate seeing the same record more than once.
#[async_trait]
pub trait DeadLetterHandler: Send + Sync {
    async fn handle(&self, record: &DeadLetterRecord) -> anyhow::Result<()>;
}

#[async_trait]
impl<H> DeadLetterHandler for Arc<H>
where
    H: DeadLetterHandler + ?Sized,
{
    async fn handle(&self, record: &DeadLetterRecord) -> anyhow::Result<()> {
        (**self).handle(record).await
    }
}

/// Adapter for async closures receiving an owned snapshot of the record.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> DeadLetterHandler for FnHandler<F>
where
    F: Fn(DeadLetterRecord) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, record: &DeadLetterRecord) -> anyhow::Result<()> {
        (self.0)(record.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(DeadLetterRecord) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(f)
}

/// Adapter for synchronous closures (a handler that never suspends).
pub struct SyncHandler<F>(F);

#[async_trait]
impl<F> DeadLetterHandler for SyncHandler<F>
where
    F: Fn(&DeadLetterRecord) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, record: &DeadLetterRecord) -> anyhow::Result<()> {
        (self.0)(record)
    }
}

/// Wrap a synchronous closure as a handler.
pub fn sync_handler<F>(f: F) -> SyncHandler<F>
where
    F: Fn(&DeadLetterRecord) -> anyhow::Result<()> + Send + Sync,
{
    SyncHandler(f)
}

type Entry = (HandlerId, Arc<dyn DeadLetterHandler>);

/// Ordered set of registered handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: RwLock<Vec<Entry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; it runs after every handler registered before it.
    pub fn add(&self, handler: Arc<dyn DeadLetterHandler>) -> HandlerId {
        let id = HandlerId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers.push((id, handler));
        id
    }

    /// Unregister a handler. Returns `false` if the token is unknown.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    /// Handlers in invocation order.
    ///
    /// A copy is returned so no lock is held while handlers run.
    pub fn snapshot(&self) -> Vec<Entry> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<HandlerId> = self.snapshot().into_iter().map(|(id, _)| id).collect();
        f.debug_struct("HandlerRegistry").field("handlers", &ids).finish()
    }
}
