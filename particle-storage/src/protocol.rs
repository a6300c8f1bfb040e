//! Messages exchanged between proxies and stores.
//!
//! Wire format (bincode-encoded, serde tagged by variant index):
//! ```text
//! ┌─────────┬──────────────┬──────────────────────────────┐
//! │ variant │ listener id  │ payload                      │
//! │ varint  │ varint (u32) │ model / operations / nothing │
//! └─────────┴──────────────┴──────────────────────────────┘
//! ```
//!
//! Muxed traffic wraps a message with the id of the entity it addresses.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use particle_crdt::{CrdtModel, ReferenceId};

/// Identifies one registered listener on a store.
pub type ListenerId = u32;

/// Reserved id for messages that do not come from any listener.
pub const NO_LISTENER: ListenerId = 0;

/// The three messages a proxy and a store exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProxyMessage<D, O> {
    /// Ask the other side for its full model.
    SyncRequest { id: ListenerId },
    /// A full model, to be merged.
    ModelUpdate { model: D, id: ListenerId },
    /// Operations to apply in order.
    Operations { operations: Vec<O>, id: ListenerId },
}

/// Proxy message typed by model.
pub type ModelMessage<M> = ProxyMessage<<M as CrdtModel>::Data, <M as CrdtModel>::Operation>;

/// Proxy message routed to one entity of a muxer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuxedProxyMessage<D, O> {
    pub mux_id: ReferenceId,
    pub message: ProxyMessage<D, O>,
}

pub type MuxedModelMessage<M> = MuxedProxyMessage<<M as CrdtModel>::Data, <M as CrdtModel>::Operation>;

/// Short message tag for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    SyncRequest,
    ModelUpdate,
    Operations,
}

impl<D, O> ProxyMessage<D, O> {
    pub fn sync_request(id: ListenerId) -> Self {
        ProxyMessage::SyncRequest { id }
    }

    pub fn model_update(model: D, id: ListenerId) -> Self {
        ProxyMessage::ModelUpdate { model, id }
    }

    pub fn operations(operations: Vec<O>, id: ListenerId) -> Self {
        ProxyMessage::Operations { operations, id }
    }

    pub fn id(&self) -> ListenerId {
        match self {
            ProxyMessage::SyncRequest { id }
            | ProxyMessage::ModelUpdate { id, .. }
            | ProxyMessage::Operations { id, .. } => *id,
        }
    }

    /// Same message addressed from/to another listener.
    pub fn with_id(self, id: ListenerId) -> Self {
        match self {
            ProxyMessage::SyncRequest { .. } => ProxyMessage::SyncRequest { id },
            ProxyMessage::ModelUpdate { model, .. } => ProxyMessage::ModelUpdate { model, id },
            ProxyMessage::Operations { operations, .. } => ProxyMessage::Operations { operations, id },
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            ProxyMessage::SyncRequest { .. } => MessageKind::SyncRequest,
            ProxyMessage::ModelUpdate { .. } => MessageKind::ModelUpdate,
            ProxyMessage::Operations { .. } => MessageKind::Operations,
        }
    }

    pub fn muxed(self, mux_id: impl Into<ReferenceId>) -> MuxedProxyMessage<D, O> {
        MuxedProxyMessage { mux_id: mux_id.into(), message: self }
    }
}

impl<D: Serialize + DeserializeOwned, O: Serialize + DeserializeOwned> ProxyMessage<D, O> {
    /// Encode to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Decode from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl<D: Serialize + DeserializeOwned, O: Serialize + DeserializeOwned> MuxedProxyMessage<D, O> {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// bincode with the standard config, used for messages and persisted models.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use particle_crdt::{CountData, CountOp, CrdtCount, CrdtModel};

    type CountMessage = ModelMessage<CrdtCount>;

    #[test]
    fn test_operations_encode_decode() {
        let msg: CountMessage = ProxyMessage::operations(vec![CountOp::increment("me", 0)], 3);
        let bytes = msg.encode().unwrap();
        let decoded = CountMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_model_update_encode_decode() {
        let mut count = CrdtCount::new();
        count.apply_operation(&CountOp::multi_increment("me", 0, 27, 42)).unwrap();
        let msg: CountMessage = ProxyMessage::model_update(count.data(), 1);
        let decoded = CountMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            ProxyMessage::ModelUpdate { model, id } => {
                assert_eq!(id, 1);
                assert_eq!(model.values.get("me"), Some(&42));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_muxed_message_keeps_mux_id() {
        let msg: MuxedProxyMessage<CountData, CountOp> = ProxyMessage::sync_request(9).muxed("entity-1");
        let decoded = MuxedProxyMessage::<CountData, CountOp>::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.mux_id, "entity-1");
        assert_eq!(decoded.message.id(), 9);
    }

    #[test]
    fn test_with_id_rewrites_listener() {
        let msg: CountMessage = ProxyMessage::operations(vec![], 1);
        let moved = msg.with_id(7);
        assert_eq!(moved.id(), 7);
        assert_eq!(moved.kind(), MessageKind::Operations);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = CountMessage::decode(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(ProtocolError::DeserializationError(_))));
    }

    #[test]
    fn test_protocol_error_converts_to_storage_error() {
        let err = CountMessage::decode(&[0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(err.to_string().starts_with("Deserialization error: "));

        let storage: crate::error::StorageError = err.clone().into();
        assert_eq!(storage.to_string(), err.to_string());
        assert_eq!(
            ProtocolError::SerializationError("too deep".into()).to_string(),
            "Serialization error: too deep"
        );
    }
}
