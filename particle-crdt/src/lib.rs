//! # particle-crdt — Replicated data types for particle storage
//!
//! Every type here satisfies the [`CrdtModel`] contract that stores and
//! proxies in `particle-storage` are written against.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!                 │  CrdtModel   │  apply_operation · merge · data
//!                 └──────┬───────┘
//!        ┌───────────┬───┴────────┬──────────────┐
//!        ▼           ▼            ▼              ▼
//!  ┌──────────┐ ┌─────────┐ ┌─────────────┐ ┌────────────┐
//!  │CrdtCount │ │ CrdtSet │ │CrdtSingleton│ │ CrdtEntity │
//!  └──────────┘ └────┬────┘ └──────┬──────┘ └─────┬──────┘
//!                    └─────────────┴──────────────┘
//!                         keyed by VersionMap
//! ```
//!
//! ## Modules
//!
//! - [`version`] — per-actor logical clocks
//! - [`model`] — the `CrdtModel` contract and change descriptions
//! - [`count`] — grow-only counter
//! - [`set`] — observed-remove set
//! - [`singleton`] — single-value register
//! - [`entity`] — schema-free entity of singleton and collection fields

pub mod version;
pub mod model;
pub mod count;
pub mod set;
pub mod singleton;
pub mod entity;

pub use version::{Actor, VersionMap};
pub use model::{
    CrdtChange, CrdtData, CrdtError, CrdtModel, CrdtOperation, MergeChanges, ModelChanges, ReferenceId,
};
pub use count::{CountData, CountOp, CrdtCount, VersionRange};
pub use set::{CrdtSet, DataValue, Referencable, SetData, SetOp};
pub use singleton::{CrdtSingleton, SingletonData, SingletonOp};
pub use entity::{CrdtEntity, EntityData, EntityOp, FieldName, FieldValue, RawEntity};
