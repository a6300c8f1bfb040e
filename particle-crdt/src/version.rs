//! Per-actor logical clocks.
//!
//! A [`VersionMap`] maps actor ids to monotonically increasing counters.
//! It doubles as the causal clock attached to every operation and as the
//! conflict detector used when two replicas merge.
//!
//! ```text
//!   local   {me: 3, them: 1}
//!   remote  {me: 2, them: 4}
//!   merged  {me: 3, them: 4}     pointwise max
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Actor identifier (one per writing replica).
pub type Actor = String;

/// Ordered actor → counter map. Missing actors read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionMap(BTreeMap<Actor, u64>);

impl VersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(actor, counter)` pairs.
    pub fn from_entries<I, A>(entries: I) -> Self
    where
        I: IntoIterator<Item = (A, u64)>,
        A: Into<Actor>,
    {
        Self(entries.into_iter().map(|(a, v)| (a.into(), v)).collect())
    }

    pub fn get(&self, actor: &str) -> u64 {
        self.0.get(actor).copied().unwrap_or(0)
    }

    pub fn set(&mut self, actor: impl Into<Actor>, value: u64) {
        self.0.insert(actor.into(), value);
    }

    /// Bump `actor` by one and return the new counter.
    pub fn increment(&mut self, actor: &str) -> u64 {
        let entry = self.0.entry(actor.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Pointwise max with `other`, in place.
    pub fn merge(&mut self, other: &VersionMap) {
        for (actor, &theirs) in &other.0 {
            let ours = self.0.entry(actor.clone()).or_insert(0);
            if theirs > *ours {
                *ours = theirs;
            }
        }
    }

    pub fn merged(&self, other: &VersionMap) -> VersionMap {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// True when every counter in `other` is at most the matching counter here.
    pub fn dominates(&self, other: &VersionMap) -> bool {
        other.0.iter().all(|(actor, &v)| self.get(actor) >= v)
    }

    /// True when neither map dominates the other.
    pub fn is_concurrent_with(&self, other: &VersionMap) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|&v| v == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Actor, u64)> {
        self.0.iter().map(|(a, &v)| (a, v))
    }

    /// Sum of all counters.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

impl fmt::Display for VersionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (actor, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{actor}: {v}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_actor_reads_zero() {
        let v = VersionMap::new();
        assert_eq!(v.get("me"), 0);
        assert!(v.is_empty());
    }

    #[test]
    fn test_increment() {
        let mut v = VersionMap::new();
        assert_eq!(v.increment("me"), 1);
        assert_eq!(v.increment("me"), 2);
        assert_eq!(v.get("me"), 2);
    }

    #[test]
    fn test_merge_is_pointwise_max() {
        let mut a = VersionMap::from_entries([("me", 3), ("them", 1)]);
        let b = VersionMap::from_entries([("me", 2), ("them", 4), ("other", 1)]);
        a.merge(&b);
        assert_eq!(a, VersionMap::from_entries([("me", 3), ("them", 4), ("other", 1)]));
    }

    #[test]
    fn test_dominates() {
        let a = VersionMap::from_entries([("me", 3), ("them", 1)]);
        let b = VersionMap::from_entries([("me", 2)]);
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
        assert!(a.dominates(&VersionMap::new()));
        assert!(a.dominates(&a));
    }

    #[test]
    fn test_concurrent() {
        let a = VersionMap::from_entries([("me", 1)]);
        let b = VersionMap::from_entries([("them", 1)]);
        assert!(a.is_concurrent_with(&b));
        assert!(!a.is_concurrent_with(&a.merged(&b)));
    }

    #[test]
    fn test_display() {
        let v = VersionMap::from_entries([("b", 2), ("a", 1)]);
        assert_eq!(v.to_string(), "{a: 1, b: 2}");
    }
}
