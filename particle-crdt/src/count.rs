//! Grow-only counter, one slot per actor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{CrdtChange, CrdtData, CrdtError, CrdtModel, CrdtOperation, MergeChanges};
use crate::version::{Actor, VersionMap};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountData {
    pub values: BTreeMap<Actor, u64>,
    pub version: VersionMap,
}

impl CrdtData for CountData {
    fn version_map(&self) -> &VersionMap {
        &self.version
    }
}

/// Actor version transition carried by a count operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CountOp {
    Increment { actor: Actor, version: VersionRange },
    MultiIncrement { actor: Actor, version: VersionRange, value: u64 },
}

impl CountOp {
    pub fn increment(actor: impl Into<Actor>, from: u64) -> Self {
        CountOp::Increment { actor: actor.into(), version: VersionRange { from, to: from + 1 } }
    }

    pub fn multi_increment(actor: impl Into<Actor>, from: u64, to: u64, value: u64) -> Self {
        CountOp::MultiIncrement { actor: actor.into(), version: VersionRange { from, to }, value }
    }

    fn range(&self) -> VersionRange {
        match self {
            CountOp::Increment { version, .. } | CountOp::MultiIncrement { version, .. } => *version,
        }
    }

    fn amount(&self) -> u64 {
        match self {
            CountOp::Increment { .. } => 1,
            CountOp::MultiIncrement { value, .. } => *value,
        }
    }
}

impl CrdtOperation for CountOp {
    fn actor(&self) -> &str {
        match self {
            CountOp::Increment { actor, .. } | CountOp::MultiIncrement { actor, .. } => actor,
        }
    }

    fn clock(&self) -> VersionMap {
        VersionMap::from_entries([(self.actor().to_string(), self.range().to)])
    }
}

#[derive(Debug, Clone, Default)]
pub struct CrdtCount {
    data: CountData,
}

impl CrdtCount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ops that move `from` up to `to` for every actor where `to` is ahead.
    fn catch_up_ops(from: &CountData, to: &CountData) -> Vec<CountOp> {
        to.version
            .iter()
            .filter(|(actor, v)| *v > from.version.get(actor))
            .map(|(actor, v)| {
                let have = from.values.get(actor).copied().unwrap_or(0);
                let want = to.values.get(actor).copied().unwrap_or(0);
                CountOp::multi_increment(actor.clone(), from.version.get(actor), v, want.saturating_sub(have))
            })
            .collect()
    }
}

impl CrdtModel for CrdtCount {
    type Data = CountData;
    type Operation = CountOp;
    type ConsumerView = u64;

    fn from_data(data: CountData) -> Self {
        Self { data }
    }

    fn data(&self) -> CountData {
        self.data.clone()
    }

    fn version_map(&self) -> VersionMap {
        self.data.version.clone()
    }

    fn apply_operation(&mut self, op: &CountOp) -> Result<(), CrdtError> {
        let actor = op.actor();
        let VersionRange { from, to } = op.range();
        let current = self.data.version.get(actor);
        if from != current {
            return Err(CrdtError::OutOfOrder { actor: actor.to_string(), expected: current, got: from });
        }
        let valid = match op {
            CountOp::Increment { .. } => to == from + 1,
            CountOp::MultiIncrement { .. } => to > from,
        };
        if !valid {
            return Err(CrdtError::InvalidRange { actor: actor.to_string(), from, to });
        }
        *self.data.values.entry(actor.to_string()).or_insert(0) += op.amount();
        self.data.version.set(actor, to);
        Ok(())
    }

    fn merge(&mut self, other: CountData) -> MergeChanges<CountData, CountOp> {
        let model_ops = Self::catch_up_ops(&self.data, &other);
        let other_ops = Self::catch_up_ops(&other, &self.data);

        for (actor, v) in other.version.iter() {
            if v > self.data.version.get(actor) {
                let value = other.values.get(actor).copied().unwrap_or(0);
                self.data.values.insert(actor.clone(), value);
                self.data.version.set(actor.clone(), v);
            }
        }

        MergeChanges {
            model_change: CrdtChange::Operations(model_ops),
            other_change: CrdtChange::Operations(other_ops),
        }
    }

    fn consumer_view(&self) -> u64 {
        self.data.values.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_in_order() {
        let mut count = CrdtCount::new();
        count.apply_operation(&CountOp::increment("me", 0)).unwrap();
        count.apply_operation(&CountOp::increment("me", 1)).unwrap();
        assert_eq!(count.consumer_view(), 2);
        assert_eq!(count.version_map().get("me"), 2);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut count = CrdtCount::new();
        let err = count.apply_operation(&CountOp::increment("me", 1)).unwrap_err();
        assert!(matches!(err, CrdtError::OutOfOrder { expected: 0, got: 1, .. }));
        assert_eq!(count.data(), CountData::default());
    }

    #[test]
    fn test_reapply_is_rejected_without_change() {
        let mut count = CrdtCount::new();
        let op = CountOp::multi_increment("me", 0, 27, 42);
        count.apply_operation(&op).unwrap();
        let before = count.data();
        assert!(count.apply_operation(&op).is_err());
        assert_eq!(count.data(), before);
    }

    #[test]
    fn test_invalid_range() {
        let mut count = CrdtCount::new();
        let op = CountOp::Increment { actor: "me".into(), version: VersionRange { from: 0, to: 3 } };
        assert!(matches!(count.apply_operation(&op), Err(CrdtError::InvalidRange { .. })));
    }

    #[test]
    fn test_merge_produces_catch_up_ops() {
        let mut a = CrdtCount::new();
        a.apply_operation(&CountOp::multi_increment("me", 0, 27, 42)).unwrap();
        let mut b = CrdtCount::new();
        b.apply_operation(&CountOp::increment("them", 0)).unwrap();

        let changes = a.merge(b.data());
        assert_eq!(
            changes.model_change,
            CrdtChange::Operations(vec![CountOp::multi_increment("them", 0, 1, 1)])
        );
        assert_eq!(
            changes.other_change,
            CrdtChange::Operations(vec![CountOp::multi_increment("me", 0, 27, 42)])
        );
        assert_eq!(a.consumer_view(), 43);
    }

    #[test]
    fn test_merge_of_subset_is_unchanged() {
        let mut a = CrdtCount::new();
        a.apply_operation(&CountOp::increment("me", 0)).unwrap();
        let snapshot = a.data();
        let changes = a.merge(snapshot);
        assert!(changes.model_change.is_empty());
        assert!(changes.other_change.is_empty());
    }

    #[test]
    fn test_apply_all_is_transactional() {
        let mut count = CrdtCount::new();
        let ops = vec![CountOp::increment("me", 0), CountOp::increment("me", 5)];
        assert!(count.apply_all(&ops).is_err());
        assert_eq!(count.consumer_view(), 0);
    }
}
