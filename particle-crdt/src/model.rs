//! The contract every replicated data type satisfies.
//!
//! Stores and proxies are generic over [`CrdtModel`]; they never look inside
//! a payload beyond `apply_operation`, `merge` and `data`.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version::{Actor, VersionMap};

/// Identifier of a value stored in a set-like CRDT.
pub type ReferenceId = String;

/// Errors raised while applying an operation.
///
/// A failed apply never changes model state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrdtError {
    #[error("operation from {actor} is out of order: expected clock {expected}, got {got}")]
    OutOfOrder { actor: Actor, expected: u64, got: u64 },

    #[error("operation clock {clock} does not dominate version {version} of {id}")]
    NotDominated { id: ReferenceId, clock: String, version: String },

    #[error("no value with id {0}")]
    MissingValue(ReferenceId),

    #[error("invalid version range {from}..{to} for {actor}")]
    InvalidRange { actor: Actor, from: u64, to: u64 },
}

/// Snapshot of a model. Copied out, never shared.
pub trait CrdtData:
    Clone + Debug + PartialEq + Default + Send + Sync + Serialize + DeserializeOwned + 'static
{
    fn version_map(&self) -> &VersionMap;
}

/// A single causally scoped mutation.
pub trait CrdtOperation:
    Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    fn actor(&self) -> &str;

    /// Version map the operation was issued at.
    fn clock(&self) -> VersionMap;
}

/// Either a list of operations or a full model.
///
/// An empty operations list means "nothing changed".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CrdtChange<D, O> {
    Operations(Vec<O>),
    Model(D),
}

impl<D, O> CrdtChange<D, O> {
    pub fn empty() -> Self {
        CrdtChange::Operations(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CrdtChange::Operations(ops) if ops.is_empty())
    }
}

/// Result of merging a remote snapshot into a local model.
///
/// `model_change` brings the old local model up to the merged state,
/// `other_change` brings the remote snapshot up to it.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeChanges<D, O> {
    pub model_change: CrdtChange<D, O>,
    pub other_change: CrdtChange<D, O>,
}

impl<D, O> MergeChanges<D, O> {
    pub fn unchanged() -> Self {
        Self { model_change: CrdtChange::empty(), other_change: CrdtChange::empty() }
    }
}

pub type ModelChanges<M> = MergeChanges<<M as CrdtModel>::Data, <M as CrdtModel>::Operation>;

/// A conflict-free replicated data type.
///
/// `merge` must be commutative, associative and idempotent with respect to
/// `data()`. Re-applying an already applied operation fails without
/// touching state.
pub trait CrdtModel: Clone + Default + Debug + Send + Sync + 'static {
    type Data: CrdtData;
    type Operation: CrdtOperation;
    type ConsumerView: Clone + Debug + Send + Sync + 'static;

    fn from_data(data: Self::Data) -> Self;

    fn data(&self) -> Self::Data;

    fn version_map(&self) -> VersionMap;

    fn apply_operation(&mut self, op: &Self::Operation) -> Result<(), CrdtError>;

    fn merge(&mut self, other: Self::Data) -> ModelChanges<Self>;

    fn consumer_view(&self) -> Self::ConsumerView;

    /// Apply every op or none of them.
    fn apply_all(&mut self, ops: &[Self::Operation]) -> Result<(), CrdtError> {
        let mut candidate = self.clone();
        for op in ops {
            candidate.apply_operation(op)?;
        }
        *self = candidate;
        Ok(())
    }
}
