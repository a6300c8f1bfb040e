//! Merge convergence properties.
//!
//! Two replicas apply independent operation streams, then exchange
//! snapshots in either order. Both must end up with identical data.

use particle_crdt::{
    CountOp, CrdtCount, CrdtModel, CrdtSet, CrdtSingleton, FieldValue, Referencable, SetOp, SingletonOp,
    VersionMap,
};
use proptest::prelude::*;

fn run_counts(actor: &str, amounts: &[u64]) -> CrdtCount {
    let mut count = CrdtCount::new();
    let mut version = 0;
    for &amount in amounts {
        let op = CountOp::multi_increment(actor, version, version + 1, amount);
        count.apply_operation(&op).unwrap();
        version += 1;
    }
    count
}

/// Adds every value, then removes the ones flagged.
fn run_set(actor: &str, values: &[(i64, bool)]) -> CrdtSet<FieldValue> {
    let mut set = CrdtSet::new();
    let mut clock = VersionMap::new();
    for (n, _) in values {
        clock.increment(actor);
        let _ = set.apply_operation(&SetOp::Add { actor: actor.into(), clock: clock.clone(), added: FieldValue::Number(*n) });
    }
    for (n, remove) in values {
        if *remove && set.contains(&FieldValue::Number(*n).id()) {
            let op = SetOp::Remove { actor: actor.into(), clock: set.version_map(), removed: FieldValue::Number(*n) };
            set.apply_operation(&op).unwrap();
        }
    }
    set
}

proptest! {
    #[test]
    fn test_count_merge_converges(a in prop::collection::vec(0u64..100, 0..8), b in prop::collection::vec(0u64..100, 0..8)) {
        let mut left = run_counts("me", &a);
        let mut right = run_counts("them", &b);
        let left_data = left.data();
        left.merge(right.data());
        right.merge(left_data);
        prop_assert_eq!(left.data(), right.data());
        prop_assert_eq!(left.consumer_view(), a.iter().sum::<u64>() + b.iter().sum::<u64>());
    }

    #[test]
    fn test_set_merge_converges(a in prop::collection::vec((0i64..20, any::<bool>()), 0..10), b in prop::collection::vec((0i64..20, any::<bool>()), 0..10)) {
        let mut left = run_set("me", &a);
        let mut right = run_set("them", &b);
        let left_data = left.data();
        left.merge(right.data());
        right.merge(left_data);
        prop_assert_eq!(left.data(), right.data());
    }

    #[test]
    fn test_set_merge_is_idempotent(a in prop::collection::vec((0i64..20, any::<bool>()), 0..10)) {
        let mut set = run_set("me", &a);
        let snapshot = set.data();
        let changes = set.merge(snapshot.clone());
        prop_assert!(changes.model_change.is_empty());
        prop_assert_eq!(set.data(), snapshot);
    }

    #[test]
    fn test_singleton_merge_converges(x in 0i64..50, y in 0i64..50) {
        let mut left = CrdtSingleton::new();
        left.apply_operation(&SingletonOp::Update {
            actor: "me".into(),
            clock: VersionMap::from_entries([("me", 1)]),
            value: FieldValue::Number(x),
        }).unwrap();
        let mut right = CrdtSingleton::new();
        right.apply_operation(&SingletonOp::Update {
            actor: "them".into(),
            clock: VersionMap::from_entries([("them", 1)]),
            value: FieldValue::Number(y),
        }).unwrap();
        let left_data = left.data();
        left.merge(right.data());
        right.merge(left_data);
        prop_assert_eq!(left.consumer_view(), right.consumer_view());
    }
}
