//! Error types shared by stores, drivers and proxies.

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors that cross a component boundary.
///
/// Write conflicts and causally out-of-order operations are not errors:
/// they are retried or reported as a `false` return.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("No driver exists for {0}")]
    NoDriver(String),

    #[error("invalid storage key {key}: {reason}")]
    InvalidStorageKey { key: String, reason: String },

    #[error("Capability not recognized: {0}.")]
    UnknownCapability(String),

    #[error("driver for {key} refused activation: {reason}")]
    DriverActivation { key: String, reason: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("handle {handle} failed in {dispatch}: {source}")]
    HandleCallback {
        handle: String,
        dispatch: &'static str,
        #[source]
        source: HandleError,
    },

    #[error("Callback id is not registered to the Direct Store Muxer")]
    UnknownListener(u32),

    #[error("storage proxy for {0} is closed")]
    ProxyClosed(String),

    #[error("store for {0} is gone")]
    StoreDropped(String),

    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        StorageError::InvalidStorageKey { key: key.into(), reason: reason.into() }
    }
}

/// Failure raised by a particle's handle callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandleError(pub String);

impl HandleError {
    pub fn new(message: impl Into<String>) -> Self {
        HandleError(message.into())
    }
}
