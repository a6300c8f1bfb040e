//! Active stores: the authoritative replica for one storage key.
//!
//! ```text
//!   StorageProxy ─┐                       ┌─► Driver ─► backend
//!   StorageProxy ─┼─► ActiveStore (model) ─┤
//!   StorageProxy ─┘     listeners table    └─◄ receiver (pushes)
//! ```
//!
//! Listener callbacks are awaited in order. A store never holds its own lock
//! while a callback or a driver call is running.

pub mod direct;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use particle_crdt::CrdtModel;

use crate::driver::{DriverFactory, Exists};
use crate::error::StorageError;
use crate::protocol::{ListenerId, ModelMessage};
use crate::storage_key::StorageKey;

pub use direct::{DirectStore, DirectStoreState};

/// Listener registered on a store.
pub type ProxyCallback<M> = Arc<dyn Fn(ModelMessage<M>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`ProxyCallback`].
pub fn proxy_callback<M, F, Fut>(f: F) -> ProxyCallback<M>
where
    M: CrdtModel,
    F: Fn(ModelMessage<M>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Everything needed to activate a store.
#[derive(Clone)]
pub struct StoreOptions {
    pub storage_key: StorageKey,
    pub exists: Exists,
    pub driver_factory: Arc<DriverFactory>,
}

impl StoreOptions {
    pub fn new(storage_key: StorageKey, exists: Exists, driver_factory: Arc<DriverFactory>) -> Self {
        Self { storage_key, exists, driver_factory }
    }

    /// Same options for another key.
    pub fn for_key(&self, storage_key: StorageKey) -> Self {
        Self { storage_key, ..self.clone() }
    }
}

/// How a key is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// One model, one driver.
    Direct,
    /// Many per-entity direct stores behind one address.
    Backing,
    /// Container of references plus a backing store.
    ReferenceMode,
}

impl StorageMode {
    pub fn for_key(key: &StorageKey) -> Self {
        match key {
            StorageKey::ReferenceMode(_) => StorageMode::ReferenceMode,
            _ => StorageMode::Direct,
        }
    }
}

/// A store that owns a replica of `M` and mediates between proxies and a driver.
#[async_trait]
pub trait ActiveStore<M: CrdtModel>: Send + Sync {
    fn storage_key(&self) -> &StorageKey;

    /// Register a listener. Ids are never reused.
    async fn on(&self, callback: ProxyCallback<M>) -> ListenerId;

    async fn off(&self, id: ListenerId);

    /// `Ok(false)` when the message was rejected and the sender must resync.
    async fn on_proxy_message(&self, message: ModelMessage<M>) -> Result<bool, StorageError>;

    /// Resolves once every effect triggered so far has settled.
    async fn idle(&self) -> Result<(), StorageError>;

    /// Current data, after `idle`.
    async fn serialize_contents(&self) -> Result<M::Data, StorageError>;

    /// Record an error raised on the far side of a listener.
    async fn report_exception_in_host(&self, error: StorageError);
}
