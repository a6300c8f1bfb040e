//! # particle-storage — Replicated storage core for particle arcs
//!
//! Stores hold the authoritative CRDT replica for a storage key; proxies hold
//! client-side replicas and talk to stores with [`ProxyMessage`]s.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ProxyMessage    ┌─────────────────────┐
//! │ StorageProxy │ ◄───────────────► │ ActiveStore         │
//! │ (per handle  │  Sync/Model/Ops   │  DirectStore        │
//! │  group)      │                   │  ReferenceModeStore │
//! └──────────────┘                   └──────────┬──────────┘
//!                                               │
//!                         ┌─────────────────────┼──────────────────┐
//!                         ▼                     ▼                  ▼
//!                  ┌─────────────┐    ┌──────────────────┐  ┌────────────┐
//!                  │ Driver      │    │ DirectStoreMuxer │  │ StorageKey │
//!                  │ (bytes+ver) │    │ (per-entity)     │  │ parser     │
//!                  └─────────────┘    └──────────────────┘  └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — proxy ⇄ store messages (bincode-encoded)
//! - [`storage_key`] — storage addresses and the injectable key parser
//! - [`driver`] — persistence adapters, the driver registry, in-memory drivers
//! - [`store`] — the `ActiveStore` contract and `DirectStore`
//! - [`muxer`] — lazily activated per-entity stores
//! - [`reference_mode`] — containers of references over a backing store
//! - [`proxy`] — client-side replica and handle fan-out
//! - [`config`] — arc-level wiring

pub mod error;
pub mod protocol;
pub mod storage_key;
pub mod driver;
pub mod store;
pub mod muxer;
pub mod reference_mode;
pub mod proxy;
pub mod config;

// Re-exports for convenience
pub use error::{HandleError, StorageError};
pub use protocol::{
    ListenerId, MessageKind, ModelMessage, MuxedModelMessage, MuxedProxyMessage, ProtocolError, ProxyMessage,
    NO_LISTENER,
};
pub use storage_key::{
    Capabilities, Capability, CreatableStorageKey, FirebaseStorageKey, ReferenceModeStorageKey, StorageKey,
    StorageKeyParser,
};
pub use driver::{
    Driver, DriverFactory, DriverProvider, DriverReceiver, Exists, RamDiskDriverProvider, VolatileDriver,
    VolatileDriverProvider, VolatileMemory,
};
pub use store::{
    proxy_callback, ActiveStore, DirectStore, DirectStoreState, ProxyCallback, StorageMode, StoreOptions,
};
pub use muxer::{muxed_callback, DirectStoreMuxer, MuxedProxyCallback, StoreRecord};
pub use reference_mode::{CollectionMode, ContainerKind, Reference, ReferenceModeStore, SingletonMode};
pub use proxy::{HandleOptions, ProxyHandle, ProxyState, StorageProxy};
pub use config::StorageConfig;
