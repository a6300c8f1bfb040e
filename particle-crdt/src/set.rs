//! Observed-remove set keyed by value id.
//!
//! Each value carries the version map it was added at. A value missing on one
//! side of a merge survives only if that side's clock has not yet observed
//! it; otherwise the absence is a removal.
//!
//! ```text
//!   add(x)   requires clock[actor] == version[actor] + 1
//!   remove   requires clock[actor] == version[actor]
//!            and clock dominates the value's version
//! ```

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::model::{CrdtChange, CrdtData, CrdtError, CrdtModel, CrdtOperation, MergeChanges, ReferenceId};
use crate::version::{Actor, VersionMap};

/// Anything that can live in a set: it has a stable id.
pub trait Referencable:
    Clone + Debug + PartialEq + Ord + Send + Sync + Serialize + DeserializeOwned + 'static
{
    fn id(&self) -> ReferenceId;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValue<T> {
    pub value: T,
    pub version: VersionMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetData<T> {
    pub values: BTreeMap<ReferenceId, DataValue<T>>,
    pub version: VersionMap,
}

impl<T> Default for SetData<T> {
    fn default() -> Self {
        Self { values: BTreeMap::new(), version: VersionMap::new() }
    }
}

impl<T: Referencable> CrdtData for SetData<T> {
    fn version_map(&self) -> &VersionMap {
        &self.version
    }
}

impl<T: Referencable> SetData<T> {
    /// Values ordered by id.
    pub fn items(&self) -> Vec<T> {
        self.values.values().map(|v| v.value.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SetOp<T> {
    Add { actor: Actor, clock: VersionMap, added: T },
    Remove { actor: Actor, clock: VersionMap, removed: T },
}

impl<T: Referencable> CrdtOperation for SetOp<T> {
    fn actor(&self) -> &str {
        match self {
            SetOp::Add { actor, .. } | SetOp::Remove { actor, .. } => actor,
        }
    }

    fn clock(&self) -> VersionMap {
        match self {
            SetOp::Add { clock, .. } | SetOp::Remove { clock, .. } => clock.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrdtSet<T> {
    data: SetData<T>,
}

impl<T> Default for CrdtSet<T> {
    fn default() -> Self {
        Self { data: SetData::default() }
    }
}

impl<T: Referencable> CrdtSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.data.values.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.data.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.values.is_empty()
    }

    pub(crate) fn raw(&self) -> &SetData<T> {
        &self.data
    }

    pub(crate) fn add(&mut self, actor: &str, clock: &VersionMap, added: &T) -> Result<(), CrdtError> {
        let current = self.data.version.get(actor);
        let got = clock.get(actor);
        if got != current + 1 {
            return Err(CrdtError::OutOfOrder { actor: actor.to_string(), expected: current + 1, got });
        }
        self.data.version.set(actor, got);
        let id = added.id();
        let version = match self.data.values.get(&id) {
            Some(existing) => existing.version.merged(clock),
            None => clock.clone(),
        };
        self.data.values.insert(id, DataValue { value: added.clone(), version });
        Ok(())
    }

    pub(crate) fn remove(&mut self, actor: &str, clock: &VersionMap, removed_id: &str) -> Result<(), CrdtError> {
        let existing = self
            .data
            .values
            .get(removed_id)
            .ok_or_else(|| CrdtError::MissingValue(removed_id.to_string()))?;
        let current = self.data.version.get(actor);
        let got = clock.get(actor);
        if got != current {
            return Err(CrdtError::OutOfOrder { actor: actor.to_string(), expected: current, got });
        }
        if !clock.dominates(&existing.version) {
            return Err(CrdtError::NotDominated {
                id: removed_id.to_string(),
                clock: clock.to_string(),
                version: existing.version.to_string(),
            });
        }
        self.data.values.remove(removed_id);
        self.data.version.merge(clock);
        Ok(())
    }

    /// Removes every value `clock` dominates. Returns how many went.
    pub(crate) fn remove_dominated(&mut self, clock: &VersionMap) -> usize {
        let before = self.data.values.len();
        self.data.values.retain(|_, v| !clock.dominates(&v.version));
        before - self.data.values.len()
    }

    pub(crate) fn bump_version(&mut self, clock: &VersionMap) {
        self.data.version.merge(clock);
    }

    fn merged_data(ours: &SetData<T>, theirs: &SetData<T>) -> SetData<T> {
        let mut values = BTreeMap::new();
        for (id, their_value) in &theirs.values {
            match ours.values.get(id) {
                Some(our_value) => {
                    let value = pick_value(our_value, their_value);
                    let version = our_value.version.merged(&their_value.version);
                    values.insert(id.clone(), DataValue { value, version });
                }
                None if !ours.version.dominates(&their_value.version) => {
                    values.insert(id.clone(), their_value.clone());
                }
                None => {}
            }
        }
        for (id, our_value) in &ours.values {
            if !theirs.values.contains_key(id) && !theirs.version.dominates(&our_value.version) {
                values.insert(id.clone(), our_value.clone());
            }
        }
        SetData { values, version: ours.version.merged(&theirs.version) }
    }
}

/// Same id on both sides: the causally newer value wins, ties go to the larger.
fn pick_value<T: Referencable>(a: &DataValue<T>, b: &DataValue<T>) -> T {
    if a.version.dominates(&b.version) && a.version != b.version {
        a.value.clone()
    } else if b.version.dominates(&a.version) && a.version != b.version {
        b.value.clone()
    } else if a.value >= b.value {
        a.value.clone()
    } else {
        b.value.clone()
    }
}

impl<T: Referencable> CrdtModel for CrdtSet<T> {
    type Data = SetData<T>;
    type Operation = SetOp<T>;
    type ConsumerView = Vec<T>;

    fn from_data(data: SetData<T>) -> Self {
        Self { data }
    }

    fn data(&self) -> SetData<T> {
        self.data.clone()
    }

    fn version_map(&self) -> VersionMap {
        self.data.version.clone()
    }

    fn apply_operation(&mut self, op: &SetOp<T>) -> Result<(), CrdtError> {
        match op {
            SetOp::Add { actor, clock, added } => self.add(actor, clock, added),
            SetOp::Remove { actor, clock, removed } => self.remove(actor, clock, &removed.id()),
        }
    }

    fn merge(&mut self, other: SetData<T>) -> MergeChanges<SetData<T>, SetOp<T>> {
        let merged = Self::merged_data(&self.data, &other);
        let model_change = if merged == self.data {
            CrdtChange::empty()
        } else {
            CrdtChange::Model(merged.clone())
        };
        let other_change = if merged == other {
            CrdtChange::empty()
        } else {
            CrdtChange::Model(merged.clone())
        };
        self.data = merged;
        MergeChanges { model_change, other_change }
    }

    fn consumer_view(&self) -> Vec<T> {
        self.data.items()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
    struct Item(String);

    impl Referencable for Item {
        fn id(&self) -> ReferenceId {
            self.0.clone()
        }
    }

    fn clock(entries: &[(&str, u64)]) -> VersionMap {
        VersionMap::from_entries(entries.iter().map(|(a, v)| (a.to_string(), *v)))
    }

    fn add(actor: &str, c: &[(&str, u64)], id: &str) -> SetOp<Item> {
        SetOp::Add { actor: actor.into(), clock: clock(c), added: Item(id.into()) }
    }

    fn remove(actor: &str, c: &[(&str, u64)], id: &str) -> SetOp<Item> {
        SetOp::Remove { actor: actor.into(), clock: clock(c), removed: Item(id.into()) }
    }

    #[test]
    fn test_add_and_remove() {
        let mut set = CrdtSet::new();
        set.apply_operation(&add("me", &[("me", 1)], "a")).unwrap();
        set.apply_operation(&add("me", &[("me", 2)], "b")).unwrap();
        assert_eq!(set.consumer_view(), vec![Item("a".into()), Item("b".into())]);

        set.apply_operation(&remove("me", &[("me", 2)], "a")).unwrap();
        assert_eq!(set.consumer_view(), vec![Item("b".into())]);
    }

    #[test]
    fn test_add_requires_next_clock() {
        let mut set = CrdtSet::new();
        assert!(set.apply_operation(&add("me", &[("me", 2)], "a")).is_err());
        set.apply_operation(&add("me", &[("me", 1)], "a")).unwrap();
        assert!(set.apply_operation(&add("me", &[("me", 1)], "a")).is_err());
    }

    #[test]
    fn test_remove_missing_value_fails() {
        let mut set: CrdtSet<Item> = CrdtSet::new();
        assert_eq!(
            set.apply_operation(&remove("me", &[], "a")),
            Err(CrdtError::MissingValue("a".into()))
        );
    }

    #[test]
    fn test_remove_requires_observed_add() {
        let mut set = CrdtSet::new();
        set.apply_operation(&add("them", &[("them", 1)], "a")).unwrap();
        let err = set.apply_operation(&remove("me", &[], "a")).unwrap_err();
        assert!(matches!(err, CrdtError::NotDominated { .. }));
    }

    #[test]
    fn test_merge_concurrent_adds() {
        let mut a = CrdtSet::new();
        a.apply_operation(&add("me", &[("me", 1)], "x")).unwrap();
        let mut b = CrdtSet::new();
        b.apply_operation(&add("them", &[("them", 1)], "y")).unwrap();

        let changes = a.merge(b.data());
        assert!(matches!(changes.model_change, CrdtChange::Model(_)));
        assert!(matches!(changes.other_change, CrdtChange::Model(_)));
        assert_eq!(a.len(), 2);
        assert_eq!(a.version_map(), clock(&[("me", 1), ("them", 1)]));
    }

    #[test]
    fn test_merge_observes_removal() {
        let mut a = CrdtSet::new();
        a.apply_operation(&add("me", &[("me", 1)], "x")).unwrap();
        let mut b = CrdtSet::from_data(a.data());
        b.apply_operation(&remove("me", &[("me", 1)], "x")).unwrap();

        a.merge(b.data());
        assert!(a.is_empty());
    }

    #[test]
    fn test_merge_with_superset_reports_no_other_change() {
        let mut a = CrdtSet::new();
        a.apply_operation(&add("me", &[("me", 1)], "x")).unwrap();
        let snapshot = a.data();
        let mut fresh = CrdtSet::new();
        let changes = fresh.merge(snapshot);
        assert!(changes.other_change.is_empty());
        assert!(!changes.model_change.is_empty());
    }
}
