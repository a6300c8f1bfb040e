//! References and the two container shapes a reference-mode store can hold.
//!
//! ```text
//!   proxy side                      store side
//!   CrdtSet<RawEntity>        ◄──►  CrdtSet<Reference>         (CollectionMode)
//!   CrdtSingleton<RawEntity>  ◄──►  CrdtSingleton<Reference>   (SingletonMode)
//! ```

use serde::{Deserialize, Serialize};

use particle_crdt::{
    CrdtModel, CrdtSet, CrdtSingleton, RawEntity, Referencable, ReferenceId, SetData, SetOp, SingletonOp, VersionMap,
};

use crate::storage_key::StorageKey;

/// Pointer from a container to an entity in a backing store.
///
/// `version` is the backing entity version the reference was issued at; the
/// reference only resolves once the backing store has caught up to it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub id: ReferenceId,
    pub storage_key: StorageKey,
    pub version: VersionMap,
}

impl Reference {
    pub fn new(id: impl Into<ReferenceId>, storage_key: StorageKey, version: VersionMap) -> Self {
        Self { id: id.into(), storage_key, version }
    }
}

impl Referencable for Reference {
    fn id(&self) -> ReferenceId {
        self.id.clone()
    }
}

/// What an operation does to the value it names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Touched<'a, T> {
    Written(&'a T),
    Removed(&'a T),
    Nothing,
}

pub type EntityContainerOp<K> = <<K as ContainerKind>::EntityContainer as CrdtModel>::Operation;
pub type RefContainerOp<K> = <<K as ContainerKind>::RefContainer as CrdtModel>::Operation;

/// Pairs an entity container with its reference twin and converts ops
/// between them.
pub trait ContainerKind: Sized + Send + Sync + 'static {
    type EntityContainer: CrdtModel<Data = SetData<RawEntity>>;
    type RefContainer: CrdtModel<Data = SetData<Reference>>;

    fn entity_target(op: &EntityContainerOp<Self>) -> Touched<'_, RawEntity>;

    fn reference_target(op: &RefContainerOp<Self>) -> Touched<'_, Reference>;

    /// `None` when the op names a value but no reference was supplied.
    fn to_reference_op(op: &EntityContainerOp<Self>, reference: Option<Reference>) -> Option<RefContainerOp<Self>>;

    /// `None` when the op names a value but no entity was supplied.
    fn to_entity_op(op: &RefContainerOp<Self>, entity: Option<RawEntity>) -> Option<EntityContainerOp<Self>>;
}

/// Collection of entities.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionMode;

impl ContainerKind for CollectionMode {
    type EntityContainer = CrdtSet<RawEntity>;
    type RefContainer = CrdtSet<Reference>;

    fn entity_target(op: &SetOp<RawEntity>) -> Touched<'_, RawEntity> {
        match op {
            SetOp::Add { added, .. } => Touched::Written(added),
            SetOp::Remove { removed, .. } => Touched::Removed(removed),
        }
    }

    fn reference_target(op: &SetOp<Reference>) -> Touched<'_, Reference> {
        match op {
            SetOp::Add { added, .. } => Touched::Written(added),
            SetOp::Remove { removed, .. } => Touched::Removed(removed),
        }
    }

    fn to_reference_op(op: &SetOp<RawEntity>, reference: Option<Reference>) -> Option<SetOp<Reference>> {
        let reference = reference?;
        Some(match op {
            SetOp::Add { actor, clock, .. } => SetOp::Add { actor: actor.clone(), clock: clock.clone(), added: reference },
            SetOp::Remove { actor, clock, .. } => {
                SetOp::Remove { actor: actor.clone(), clock: clock.clone(), removed: reference }
            }
        })
    }

    fn to_entity_op(op: &SetOp<Reference>, entity: Option<RawEntity>) -> Option<SetOp<RawEntity>> {
        let entity = entity?;
        Some(match op {
            SetOp::Add { actor, clock, .. } => SetOp::Add { actor: actor.clone(), clock: clock.clone(), added: entity },
            SetOp::Remove { actor, clock, .. } => {
                SetOp::Remove { actor: actor.clone(), clock: clock.clone(), removed: entity }
            }
        })
    }
}

/// Single entity slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingletonMode;

impl ContainerKind for SingletonMode {
    type EntityContainer = CrdtSingleton<RawEntity>;
    type RefContainer = CrdtSingleton<Reference>;

    fn entity_target(op: &SingletonOp<RawEntity>) -> Touched<'_, RawEntity> {
        match op {
            SingletonOp::Update { value, .. } => Touched::Written(value),
            SingletonOp::Clear { .. } => Touched::Nothing,
        }
    }

    fn reference_target(op: &SingletonOp<Reference>) -> Touched<'_, Reference> {
        match op {
            SingletonOp::Update { value, .. } => Touched::Written(value),
            SingletonOp::Clear { .. } => Touched::Nothing,
        }
    }

    fn to_reference_op(op: &SingletonOp<RawEntity>, reference: Option<Reference>) -> Option<SingletonOp<Reference>> {
        match op {
            SingletonOp::Update { actor, clock, .. } => {
                Some(SingletonOp::Update { actor: actor.clone(), clock: clock.clone(), value: reference? })
            }
            SingletonOp::Clear { actor, clock } => Some(SingletonOp::Clear { actor: actor.clone(), clock: clock.clone() }),
        }
    }

    fn to_entity_op(op: &SingletonOp<Reference>, entity: Option<RawEntity>) -> Option<SingletonOp<RawEntity>> {
        match op {
            SingletonOp::Update { actor, clock, .. } => {
                Some(SingletonOp::Update { actor: actor.clone(), clock: clock.clone(), value: entity? })
            }
            SingletonOp::Clear { actor, clock } => Some(SingletonOp::Clear { actor: actor.clone(), clock: clock.clone() }),
        }
    }
}
