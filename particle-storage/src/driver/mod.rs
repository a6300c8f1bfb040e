//! Persistence adapters and the registry that resolves them.
//!
//! ```text
//!   StorageKey ──► DriverFactory ──► DriverProvider::will_support?
//!                                         │ yes
//!                                         ▼
//!                                   Arc<dyn Driver>  (one key)
//! ```
//!
//! Drivers move opaque bytes. Stores encode their model data before
//! writing and decode what a receiver hands them.

pub mod volatile;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_key::StorageKey;

pub use volatile::{RamDiskDriverProvider, VolatileDriver, VolatileDriverProvider, VolatileMemory};

/// Activation policy for the resource behind a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Exists {
    /// Fail if the resource already exists.
    ShouldCreate,
    /// Fail if the resource does not exist.
    ShouldExist,
    /// Create if missing.
    #[default]
    MayExist,
}

/// Callback for data pushed by the backend: `(bytes, version)`.
pub type DriverReceiver = Arc<dyn Fn(Vec<u8>, u64) -> BoxFuture<'static, ()> + Send + Sync>;

/// Adapter bound to exactly one storage key.
#[async_trait]
pub trait Driver: Send + Sync {
    fn storage_key(&self) -> &StorageKey;

    fn exists(&self) -> Exists;

    /// Token of the data this driver last wrote or delivered.
    fn token(&self) -> Option<String>;

    async fn read(&self) -> Option<(Vec<u8>, u64)>;

    /// Persist `data` as `version`. `false` means someone else wrote first.
    async fn write(&self, data: Vec<u8>, version: u64) -> bool;

    /// Deliver future pushes to `receiver`. Existing data whose token differs
    /// from `token` is delivered right away.
    async fn register_receiver(&self, token: Option<String>, receiver: DriverReceiver);
}

/// Creates drivers for the keys it supports.
#[async_trait]
pub trait DriverProvider: Send + Sync {
    fn will_support(&self, key: &StorageKey) -> bool;

    async fn driver(&self, key: &StorageKey, exists: Exists) -> Result<Arc<dyn Driver>, StorageError>;
}

/// Injectable registry of driver providers.
#[derive(Clone, Default)]
pub struct DriverFactory {
    providers: Vec<Arc<dyn DriverProvider>>,
}

impl DriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn DriverProvider>) {
        self.providers.push(provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn DriverProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn will_support(&self, key: &StorageKey) -> bool {
        self.providers.iter().any(|p| p.will_support(key))
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Driver for `key` from the first provider that supports it.
    pub async fn driver_for(&self, key: &StorageKey, exists: Exists) -> Result<Arc<dyn Driver>, StorageError> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.will_support(key))
            .ok_or_else(|| StorageError::NoDriver(key.to_string()))?;
        log::debug!("activating driver for {key} ({exists:?})");
        provider.driver(key, exists).await
    }
}
