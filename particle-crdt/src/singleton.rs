//! Single-value register built on [`CrdtSet`].
//!
//! Concurrent updates from different actors can leave more than one value
//! alive; the view resolves them by smallest id so every replica agrees.

use serde::{Deserialize, Serialize};

use crate::model::{CrdtChange, CrdtError, CrdtModel, CrdtOperation, MergeChanges};
use crate::set::{CrdtSet, Referencable, SetData, SetOp};
use crate::version::{Actor, VersionMap};

pub type SingletonData<T> = SetData<T>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SingletonOp<T> {
    Update { actor: Actor, clock: VersionMap, value: T },
    Clear { actor: Actor, clock: VersionMap },
}

impl<T: Referencable> CrdtOperation for SingletonOp<T> {
    fn actor(&self) -> &str {
        match self {
            SingletonOp::Update { actor, .. } | SingletonOp::Clear { actor, .. } => actor,
        }
    }

    fn clock(&self) -> VersionMap {
        match self {
            SingletonOp::Update { clock, .. } | SingletonOp::Clear { clock, .. } => clock.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrdtSingleton<T> {
    set: CrdtSet<T>,
}

impl<T> Default for CrdtSingleton<T> {
    fn default() -> Self {
        Self { set: CrdtSet::default() }
    }
}

impl<T: Referencable> CrdtSingleton<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&mut self, actor: &str, clock: &VersionMap, value: &T) -> Result<(), CrdtError> {
        // The writer's own previous value was issued one tick earlier.
        let mut observed = clock.clone();
        observed.set(actor, clock.get(actor).saturating_sub(1));
        let mut candidate = self.set.clone();
        candidate.remove_dominated(&observed);
        candidate.add(actor, clock, value)?;
        self.set = candidate;
        Ok(())
    }

    fn clear(&mut self, actor: &str, clock: &VersionMap) -> Result<(), CrdtError> {
        let current = self.set.raw().version.get(actor);
        let got = clock.get(actor);
        if got != current {
            return Err(CrdtError::OutOfOrder { actor: actor.to_string(), expected: current, got });
        }
        self.set.remove_dominated(clock);
        self.set.bump_version(clock);
        Ok(())
    }
}

impl<T: Referencable> CrdtModel for CrdtSingleton<T> {
    type Data = SingletonData<T>;
    type Operation = SingletonOp<T>;
    type ConsumerView = Option<T>;

    fn from_data(data: SingletonData<T>) -> Self {
        Self { set: CrdtSet::from_data(data) }
    }

    fn data(&self) -> SingletonData<T> {
        self.set.data()
    }

    fn version_map(&self) -> VersionMap {
        self.set.version_map()
    }

    fn apply_operation(&mut self, op: &SingletonOp<T>) -> Result<(), CrdtError> {
        match op {
            SingletonOp::Update { actor, clock, value } => self.update(actor, clock, value),
            SingletonOp::Clear { actor, clock } => self.clear(actor, clock),
        }
    }

    fn merge(&mut self, other: SingletonData<T>) -> MergeChanges<SingletonData<T>, SingletonOp<T>> {
        let changes = self.set.merge(other);
        MergeChanges {
            model_change: retag(changes.model_change),
            other_change: retag(changes.other_change),
        }
    }

    fn consumer_view(&self) -> Option<T> {
        self.set.raw().values.values().next().map(|v| v.value.clone())
    }
}

/// Set merges only ever report models, which carry over unchanged.
fn retag<T>(change: CrdtChange<SetData<T>, SetOp<T>>) -> CrdtChange<SetData<T>, SingletonOp<T>> {
    match change {
        CrdtChange::Model(data) => CrdtChange::Model(data),
        CrdtChange::Operations(_) => CrdtChange::empty(),
    }
}
