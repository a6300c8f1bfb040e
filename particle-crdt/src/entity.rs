//! Schema-free entity made of named singleton and collection fields.
//!
//! ```text
//!   CrdtEntity ─┬─ singletons:  field → CrdtSingleton<FieldValue>
//!               └─ collections: field → CrdtSet<FieldValue>
//! ```
//!
//! Operation clocks are per field: each field tracks its own version map and
//! the entity version is the merge of every clock it has accepted.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::{CrdtChange, CrdtData, CrdtError, CrdtModel, CrdtOperation, MergeChanges, ReferenceId};
use crate::set::{CrdtSet, Referencable, SetData, SetOp};
use crate::singleton::{CrdtSingleton, SingletonData, SingletonOp};
use crate::version::{Actor, VersionMap};

pub type FieldName = String;

/// Primitive field value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Number(i64),
    Boolean(bool),
}

impl Referencable for FieldValue {
    fn id(&self) -> ReferenceId {
        match self {
            FieldValue::Text(s) => format!("text:{s}"),
            FieldValue::Number(n) => format!("number:{n}"),
            FieldValue::Boolean(b) => format!("boolean:{b}"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Boolean(b)
    }
}

/// Materialized entity as seen by particles.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RawEntity {
    pub id: ReferenceId,
    pub singletons: BTreeMap<FieldName, Option<FieldValue>>,
    pub collections: BTreeMap<FieldName, BTreeSet<FieldValue>>,
}

impl RawEntity {
    pub fn new(id: impl Into<ReferenceId>) -> Self {
        Self { id: id.into(), ..Default::default() }
    }

    pub fn with_singleton(mut self, field: impl Into<FieldName>, value: impl Into<FieldValue>) -> Self {
        self.singletons.insert(field.into(), Some(value.into()));
        self
    }

    pub fn with_collection<I, V>(mut self, field: impl Into<FieldName>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FieldValue>,
    {
        self.collections.insert(field.into(), values.into_iter().map(Into::into).collect());
        self
    }
}

impl Referencable for RawEntity {
    fn id(&self) -> ReferenceId {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    pub id: ReferenceId,
    pub version: VersionMap,
    pub singletons: BTreeMap<FieldName, SingletonData<FieldValue>>,
    pub collections: BTreeMap<FieldName, SetData<FieldValue>>,
}

impl CrdtData for EntityData {
    fn version_map(&self) -> &VersionMap {
        &self.version
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityOp {
    SetSingleton { actor: Actor, clock: VersionMap, field: FieldName, value: FieldValue },
    ClearSingleton { actor: Actor, clock: VersionMap, field: FieldName },
    AddToSet { actor: Actor, clock: VersionMap, field: FieldName, added: FieldValue },
    RemoveFromSet { actor: Actor, clock: VersionMap, field: FieldName, removed: FieldValue },
}

impl CrdtOperation for EntityOp {
    fn actor(&self) -> &str {
        match self {
            EntityOp::SetSingleton { actor, .. }
            | EntityOp::ClearSingleton { actor, .. }
            | EntityOp::AddToSet { actor, .. }
            | EntityOp::RemoveFromSet { actor, .. } => actor,
        }
    }

    fn clock(&self) -> VersionMap {
        match self {
            EntityOp::SetSingleton { clock, .. }
            | EntityOp::ClearSingleton { clock, .. }
            | EntityOp::AddToSet { clock, .. }
            | EntityOp::RemoveFromSet { clock, .. } => clock.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CrdtEntity {
    id: ReferenceId,
    version: VersionMap,
    singletons: BTreeMap<FieldName, CrdtSingleton<FieldValue>>,
    collections: BTreeMap<FieldName, CrdtSet<FieldValue>>,
}

impl CrdtEntity {
    pub fn new(id: impl Into<ReferenceId>) -> Self {
        Self { id: id.into(), ..Default::default() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Fields are only created once an op on them succeeds.
fn apply_to_field<M: CrdtModel>(
    fields: &mut BTreeMap<FieldName, M>,
    field: &str,
    op: &M::Operation,
) -> Result<(), CrdtError> {
    let mut model = fields.get(field).cloned().unwrap_or_default();
    model.apply_operation(op)?;
    fields.insert(field.to_string(), model);
    Ok(())
}

fn merge_fields<M: CrdtModel>(ours: &mut BTreeMap<FieldName, M>, theirs: BTreeMap<FieldName, M::Data>) {
    for (field, data) in theirs {
        ours.entry(field).or_default().merge(data);
    }
}

impl CrdtModel for CrdtEntity {
    type Data = EntityData;
    type Operation = EntityOp;
    type ConsumerView = RawEntity;

    fn from_data(data: EntityData) -> Self {
        Self {
            id: data.id,
            version: data.version,
            singletons: data.singletons.into_iter().map(|(f, d)| (f, CrdtSingleton::from_data(d))).collect(),
            collections: data.collections.into_iter().map(|(f, d)| (f, CrdtSet::from_data(d))).collect(),
        }
    }

    fn data(&self) -> EntityData {
        EntityData {
            id: self.id.clone(),
            version: self.version.clone(),
            singletons: self.singletons.iter().map(|(f, s)| (f.clone(), s.data())).collect(),
            collections: self.collections.iter().map(|(f, c)| (f.clone(), c.data())).collect(),
        }
    }

    fn version_map(&self) -> VersionMap {
        self.version.clone()
    }

    fn apply_operation(&mut self, op: &EntityOp) -> Result<(), CrdtError> {
        match op {
            EntityOp::SetSingleton { actor, clock, field, value } => {
                let update = SingletonOp::Update { actor: actor.clone(), clock: clock.clone(), value: value.clone() };
                apply_to_field(&mut self.singletons, field, &update)?;
            }
            EntityOp::ClearSingleton { actor, clock, field } => {
                let clear = SingletonOp::Clear { actor: actor.clone(), clock: clock.clone() };
                apply_to_field(&mut self.singletons, field, &clear)?;
            }
            EntityOp::AddToSet { actor, clock, field, added } => {
                let add = SetOp::Add { actor: actor.clone(), clock: clock.clone(), added: added.clone() };
                apply_to_field(&mut self.collections, field, &add)?;
            }
            EntityOp::RemoveFromSet { actor, clock, field, removed } => {
                let remove = SetOp::Remove { actor: actor.clone(), clock: clock.clone(), removed: removed.clone() };
                apply_to_field(&mut self.collections, field, &remove)?;
            }
        }
        self.version.merge(&op.clock());
        Ok(())
    }

    fn merge(&mut self, other: EntityData) -> MergeChanges<EntityData, EntityOp> {
        let before = self.data();
        let other_snapshot = other.clone();

        if self.id.is_empty() {
            self.id = other.id;
        }
        self.version.merge(&other.version);
        merge_fields(&mut self.singletons, other.singletons);
        merge_fields(&mut self.collections, other.collections);

        let merged = self.data();
        let model_change = if merged == before { CrdtChange::empty() } else { CrdtChange::Model(merged.clone()) };
        let other_change = if merged == other_snapshot { CrdtChange::empty() } else { CrdtChange::Model(merged) };
        MergeChanges { model_change, other_change }
    }

    fn consumer_view(&self) -> RawEntity {
        RawEntity {
            id: self.id.clone(),
            singletons: self.singletons.iter().map(|(f, s)| (f.clone(), s.consumer_view())).collect(),
            collections: self
                .collections
                .iter()
                .map(|(f, c)| (f.clone(), c.consumer_view().into_iter().collect()))
                .collect(),
        }
    }
}
