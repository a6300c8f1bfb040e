//! Reference-mode store: a container of references plus a muxed backing
//! store holding the entities they point to.
//!
//! ```text
//!                 ┌────────────── ReferenceModeStore ──────────────┐
//!   proxies ────► │ inbox ──► process (one at a time) ──► outbox   │ ────► proxies
//!                 │             │            │          (ordered, │
//!                 │             ▼            ▼           blocking) │
//!                 └─────── container ─── backing ──────────────────┘
//!                     DirectStore<Ref>   DirectStoreMuxer<CrdtEntity>
//! ```
//!
//! Writes split each entity into its backing store and replace it with a
//! [`Reference`] in the container. Inbound container updates are only
//! passed on once every reference they carry resolves against the backing
//! store; until then they sit in the outbox and hold back everything queued
//! after them.
//!
//! Per referenced id: `Unresolved → Fetching → Resolved`. The first sighting
//! of an unresolved id starts one fetch; later sightings wait on it.

pub mod hold_queue;
pub mod reference;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError};

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use particle_crdt::{CrdtEntity, CrdtModel, DataValue, EntityData, RawEntity, Referencable, SetData, VersionMap};

use crate::driver::Exists;
use crate::error::StorageError;
use crate::muxer::{muxed_callback, DirectStoreMuxer};
use crate::protocol::{ListenerId, ModelMessage, MuxedModelMessage, MuxedProxyMessage, ProxyMessage, NO_LISTENER};
use crate::store::{proxy_callback, ActiveStore, DirectStore, ProxyCallback, StorageMode, StoreOptions};
use crate::storage_key::StorageKey;

pub use hold_queue::{BlockId, HoldQueue};
pub use reference::{CollectionMode, ContainerKind, EntityContainerOp, RefContainerOp, Reference, SingletonMode, Touched};

type EntityMessage<K> = ModelMessage<<K as ContainerKind>::EntityContainer>;
type RefMessage<K> = ModelMessage<<K as ContainerKind>::RefContainer>;

enum Job<K: ContainerKind> {
    Proxy { message: EntityMessage<K>, reply: oneshot::Sender<Result<bool, StorageError>> },
    Container(RefMessage<K>),
    Backing(MuxedModelMessage<CrdtEntity>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recipient {
    All,
    Except(ListenerId),
    Only(ListenerId),
}

impl Recipient {
    fn includes(self, id: ListenerId) -> bool {
        match self {
            Recipient::All => true,
            Recipient::Except(sender) => id != sender,
            Recipient::Only(target) => id == target,
        }
    }
}

/// Reference payloads are turned into entities when sent, not when queued.
enum Outgoing<K: ContainerKind> {
    References(SetData<Reference>),
    ReferenceOps(Vec<RefContainerOp<K>>),
    Entities(SetData<RawEntity>),
    EntityOps(Vec<EntityContainerOp<K>>),
    SyncRequest,
}

struct PendingSend<K: ContainerKind> {
    block: Option<BlockId>,
    recipient: Recipient,
    outgoing: Outgoing<K>,
}

struct RefModeState<K: ContainerKind> {
    callbacks: BTreeMap<ListenerId, ProxyCallback<K::EntityContainer>>,
    next_listener_id: ListenerId,
    holds: HoldQueue,
    fetching: HashSet<String>,
    outbox: VecDeque<PendingSend<K>>,
    pending_error: Option<StorageError>,
}

impl<K: ContainerKind> RefModeState<K> {
    /// Front of the outbox if it may go out now.
    fn next_ready_send(&mut self) -> Option<PendingSend<K>> {
        let ready = match self.outbox.front()?.block {
            None => true,
            Some(block) => self.holds.is_released(block),
        };
        if !ready {
            return None;
        }
        let send = self.outbox.pop_front()?;
        if let Some(block) = send.block {
            self.holds.retire(block);
        }
        Some(send)
    }

    /// Ids no block waits on any more are done fetching.
    fn settle_fetches(&mut self) {
        let waiting = self.holds.waiting_ids();
        self.fetching.retain(|id| waiting.contains(id));
    }
}

/// Serves an entity container (collection or singleton) of `K` in reference mode.
pub struct ReferenceModeStore<K: ContainerKind> {
    storage_key: StorageKey,
    backing_key: StorageKey,
    container_store: Arc<DirectStore<K::RefContainer>>,
    backing_store: Arc<DirectStoreMuxer<CrdtEntity>>,
    container_listener: OnceLock<ListenerId>,
    backing_listener: OnceLock<ListenerId>,
    crdt_key: String,
    state: Mutex<RefModeState<K>>,
    inbox: StdMutex<VecDeque<Job<K>>>,
    processing: Mutex<()>,
    sending: Mutex<()>,
    fetches: AtomicUsize,
}

impl<K: ContainerKind> ReferenceModeStore<K> {
    /// Activate the container store and attach to both halves.
    pub async fn create(options: StoreOptions) -> Result<Arc<Self>, StorageError> {
        let key = options.storage_key.as_reference_mode().cloned().ok_or_else(|| {
            StorageError::invalid_key(options.storage_key.to_string(), "reference mode needs a reference-mode key")
        })?;

        let container_store = DirectStore::create(options.for_key(key.storage_key.clone())).await?;
        let mut backing_options = options.for_key(key.backing_key.clone());
        backing_options.exists = Exists::MayExist;
        let backing_store = DirectStoreMuxer::new(backing_options);

        let store = Arc::new(Self {
            storage_key: options.storage_key.clone(),
            backing_key: key.backing_key.clone(),
            container_store,
            backing_store,
            container_listener: OnceLock::new(),
            backing_listener: OnceLock::new(),
            crdt_key: Uuid::new_v4().to_string(),
            state: Mutex::new(RefModeState {
                callbacks: BTreeMap::new(),
                next_listener_id: NO_LISTENER + 1,
                holds: HoldQueue::new(),
                fetching: HashSet::new(),
                outbox: VecDeque::new(),
                pending_error: None,
            }),
            inbox: StdMutex::new(VecDeque::new()),
            processing: Mutex::new(()),
            sending: Mutex::new(()),
            fetches: AtomicUsize::new(0),
        });

        let weak = Arc::downgrade(&store);
        let container_listener = store
            .container_store
            .on(proxy_callback::<K::RefContainer, _, _>(move |message| {
                let weak = weak.clone();
                async move {
                    if let Some(store) = weak.upgrade() {
                        store.push_job(Job::Container(message));
                        store.drive().await;
                    }
                }
            }))
            .await;
        let weak = Arc::downgrade(&store);
        let backing_listener = store
            .backing_store
            .on(muxed_callback::<CrdtEntity, _, _>(move |message| {
                let weak = weak.clone();
                async move {
                    if let Some(store) = weak.upgrade() {
                        store.push_job(Job::Backing(message));
                        store.drive().await;
                    }
                }
            }))
            .await;
        // Both cells are fresh.
        let _ = store.container_listener.set(container_listener);
        let _ = store.backing_listener.set(backing_listener);

        log::debug!("reference mode store active on {} (crdt key {})", store.storage_key, store.crdt_key);
        Ok(store)
    }

    pub fn mode(&self) -> StorageMode {
        StorageMode::ReferenceMode
    }

    pub fn container_store(&self) -> &Arc<DirectStore<K::RefContainer>> {
        &self.container_store
    }

    pub fn backing_store(&self) -> &Arc<DirectStoreMuxer<CrdtEntity>> {
        &self.backing_store
    }

    /// Actor under which this store versions the entities it writes.
    pub fn crdt_key(&self) -> &str {
        &self.crdt_key
    }

    /// Backing fetches started so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Sends waiting on unresolved references.
    pub async fn blocked_sends(&self) -> usize {
        self.state.lock().await.outbox.iter().filter(|s| s.block.is_some()).count()
    }

    fn container_listener(&self) -> ListenerId {
        self.container_listener.get().copied().unwrap_or(NO_LISTENER)
    }

    fn backing_listener(&self) -> ListenerId {
        self.backing_listener.get().copied().unwrap_or(NO_LISTENER)
    }

    fn inbox(&self) -> MutexGuard<'_, VecDeque<Job<K>>> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_job(&self, job: Job<K>) {
        self.inbox().push_back(job);
    }

    fn next_job(&self) -> Option<Job<K>> {
        self.inbox().pop_front()
    }

    /// Drain the inbox, then flush the outbox. A caller that finds the inbox
    /// already being drained leaves its job to the drainer.
    async fn drive(&self) {
        loop {
            let Ok(guard) = self.processing.try_lock() else {
                return;
            };
            while let Some(job) = self.next_job() {
                self.handle_job(job).await;
            }
            drop(guard);
            self.flush().await;
            if self.inbox().is_empty() {
                return;
            }
        }
    }

    async fn flush(&self) {
        loop {
            {
                let Ok(_guard) = self.sending.try_lock() else {
                    return;
                };
                loop {
                    let next = self.state.lock().await.next_ready_send();
                    match next {
                        Some(send) => self.deliver(send).await,
                        None => break,
                    }
                }
            }
            let more = {
                let state = self.state.lock().await;
                match state.outbox.front() {
                    Some(send) => send.block.is_none_or(|block| state.holds.is_released(block)),
                    None => false,
                }
            };
            if !more {
                return;
            }
        }
    }

    async fn deliver(&self, send: PendingSend<K>) {
        let message = self.materialize(send.outgoing).await;
        let targets: Vec<(ListenerId, ProxyCallback<K::EntityContainer>)> = {
            let state = self.state.lock().await;
            state
                .callbacks
                .iter()
                .filter(|(id, _)| send.recipient.includes(**id))
                .map(|(id, cb)| (*id, cb.clone()))
                .collect()
        };
        for (id, callback) in targets {
            callback(message.clone().with_id(id)).await;
        }
    }

    async fn handle_job(&self, job: Job<K>) {
        match job {
            Job::Proxy { message, reply } => {
                let result = self.handle_proxy_message(message).await;
                let _ = reply.send(result);
            }
            Job::Container(message) => {
                if let Err(e) = self.handle_container_message(message).await {
                    log::error!("container update on {} failed: {e}", self.storage_key);
                    self.state.lock().await.pending_error = Some(e);
                }
            }
            Job::Backing(message) => self.handle_backing_message(message).await,
        }
    }

    async fn handle_proxy_message(&self, message: EntityMessage<K>) -> Result<bool, StorageError> {
        match message {
            ProxyMessage::Operations { operations, id } => {
                // Entities are written before the container sees the reference
                // ops. A rejected container op leaves those writes in place.
                let mut ref_ops = Vec::with_capacity(operations.len());
                for op in &operations {
                    let reference = match K::entity_target(op) {
                        Touched::Written(entity) => match self.write_entity(entity).await? {
                            Some(reference) => Some(reference),
                            None => return Ok(false),
                        },
                        Touched::Removed(entity) => Some(self.current_reference(&entity.id).await),
                        Touched::Nothing => None,
                    };
                    match K::to_reference_op(op, reference) {
                        Some(ref_op) => ref_ops.push(ref_op),
                        None => return Ok(false),
                    }
                }
                let accepted = self
                    .container_store
                    .on_proxy_message(ProxyMessage::operations(ref_ops, self.container_listener()))
                    .await?;
                if accepted {
                    self.queue_send(None, Recipient::Except(id), Outgoing::EntityOps(operations)).await;
                }
                Ok(accepted)
            }
            ProxyMessage::ModelUpdate { model, id } => {
                let mut values = BTreeMap::new();
                for (entity_id, DataValue { value, version }) in &model.values {
                    let Some(reference) = self.write_entity(value).await? else {
                        return Ok(false);
                    };
                    values.insert(entity_id.clone(), DataValue { value: reference, version: version.clone() });
                }
                let references = SetData { values, version: model.version.clone() };
                let accepted = self
                    .container_store
                    .on_proxy_message(ProxyMessage::model_update(references, self.container_listener()))
                    .await?;
                if accepted {
                    self.queue_send(None, Recipient::Except(id), Outgoing::Entities(model)).await;
                }
                Ok(accepted)
            }
            ProxyMessage::SyncRequest { id } => {
                let data = self.container_store.local_data().await;
                let references = data.values.values().map(|v| v.value.clone()).collect();
                self.send_when_resolved(references, Recipient::Only(id), Outgoing::References(data)).await?;
                Ok(true)
            }
        }
    }

    async fn handle_container_message(&self, message: RefMessage<K>) -> Result<(), StorageError> {
        match message {
            ProxyMessage::ModelUpdate { model, .. } => {
                let references = model.values.values().map(|v| v.value.clone()).collect();
                self.send_when_resolved(references, Recipient::All, Outgoing::References(model)).await
            }
            ProxyMessage::Operations { operations, .. } => {
                let references = operations
                    .iter()
                    .filter_map(|op| match K::reference_target(op) {
                        Touched::Written(reference) => Some(reference.clone()),
                        Touched::Removed(_) | Touched::Nothing => None,
                    })
                    .collect();
                self.send_when_resolved(references, Recipient::All, Outgoing::ReferenceOps(operations)).await
            }
            ProxyMessage::SyncRequest { .. } => {
                self.queue_send(None, Recipient::All, Outgoing::SyncRequest).await;
                Ok(())
            }
        }
    }

    async fn handle_backing_message(&self, muxed: MuxedModelMessage<CrdtEntity>) {
        let MuxedProxyMessage { mux_id, message } = muxed;
        if let ProxyMessage::SyncRequest { .. } = message {
            log::warn!("ignoring sync request from backing entity {mux_id} on {}", self.storage_key);
            return;
        }
        if let Some(data) = self.backing_store.peek_local_data(&mux_id).await {
            let mut state = self.state.lock().await;
            let released = state.holds.process(&mux_id, &data.version);
            state.settle_fetches();
            if released > 0 {
                log::trace!("{mux_id} at {} released {released} held sends", data.version);
            }
        }
    }

    async fn queue_send(&self, block: Option<BlockId>, recipient: Recipient, outgoing: Outgoing<K>) {
        self.state.lock().await.outbox.push_back(PendingSend { block, recipient, outgoing });
    }

    /// Queue `outgoing`, held back until every reference resolves.
    async fn send_when_resolved(
        &self,
        references: Vec<Reference>,
        recipient: Recipient,
        outgoing: Outgoing<K>,
    ) -> Result<(), StorageError> {
        let mut requirements: BTreeMap<String, VersionMap> = BTreeMap::new();
        for reference in &references {
            if !self.is_resolved(reference).await {
                requirements.entry(reference.id.clone()).or_default().merge(&reference.version);
            }
        }
        if requirements.is_empty() {
            self.queue_send(None, recipient, outgoing).await;
            return Ok(());
        }

        let to_fetch: Vec<String> = {
            let mut state = self.state.lock().await;
            let ids: Vec<String> = requirements.keys().filter(|id| !state.fetching.contains(*id)).cloned().collect();
            state.fetching.extend(ids.iter().cloned());
            let block = state.holds.enqueue(requirements);
            state.outbox.push_back(PendingSend { block: Some(block), recipient, outgoing });
            ids
        };
        log::debug!("holding update on {} for {} unresolved entities", self.storage_key, to_fetch.len());

        for id in to_fetch {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let data = match self.backing_store.get_local_data(&id, self.backing_listener()).await {
                Ok(data) => data,
                Err(e) => {
                    self.state.lock().await.fetching.remove(&id);
                    return Err(e);
                }
            };
            let mut state = self.state.lock().await;
            state.holds.process(&id, &data.version);
            state.settle_fetches();
        }
        Ok(())
    }

    async fn is_resolved(&self, reference: &Reference) -> bool {
        if reference.version.is_empty() {
            return true;
        }
        match self.backing_store.peek_local_data(&reference.id).await {
            Some(data) => data.version.dominates(&reference.version),
            None => false,
        }
    }

    async fn current_reference(&self, id: &str) -> Reference {
        let version = self.backing_store.peek_local_data(id).await.map(|d| d.version).unwrap_or_default();
        Reference::new(id, self.backing_key.clone(), version)
    }

    /// Write `entity` to its backing store. `None` if the backing store refused.
    async fn write_entity(&self, entity: &RawEntity) -> Result<Option<Reference>, StorageError> {
        let listener = self.backing_listener();
        let existing = self.backing_store.get_local_data(&entity.id, listener).await?;
        let current = CrdtEntity::from_data(existing.clone()).consumer_view();
        if !existing.version.is_empty()
            && current.singletons == entity.singletons
            && current.collections == entity.collections
        {
            return Ok(Some(Reference::new(entity.id.clone(), self.backing_key.clone(), existing.version)));
        }

        let model = self.entity_to_model(entity, &existing);
        let accepted = self
            .backing_store
            .on_proxy_message(ProxyMessage::model_update(model, listener).muxed(entity.id.clone()))
            .await?;
        if !accepted {
            return Ok(None);
        }
        Ok(Some(self.current_reference(&entity.id).await))
    }

    /// Entity data whose every field dominates what `existing` holds for it.
    pub fn entity_to_model(&self, entity: &RawEntity, existing: &EntityData) -> EntityData {
        let key = self.crdt_key.as_str();
        let stamp = |base: &VersionMap| {
            let mut version = base.clone();
            version.set(key, base.get(key) + 1);
            version
        };

        let mut data = EntityData { id: entity.id.clone(), version: stamp(&existing.version), ..Default::default() };
        for (field, value) in &entity.singletons {
            let version = stamp(existing.singletons.get(field).map(|s| &s.version).unwrap_or(&VersionMap::new()));
            let values = value
                .iter()
                .map(|v| (v.id(), DataValue { value: v.clone(), version: version.clone() }))
                .collect();
            data.version.merge(&version);
            data.singletons.insert(field.clone(), SetData { values, version });
        }
        for (field, items) in &entity.collections {
            let version = stamp(existing.collections.get(field).map(|s| &s.version).unwrap_or(&VersionMap::new()));
            let values = items
                .iter()
                .map(|v| (v.id(), DataValue { value: v.clone(), version: version.clone() }))
                .collect();
            data.version.merge(&version);
            data.collections.insert(field.clone(), SetData { values, version });
        }
        data
    }

    async fn entity_for(&self, reference: &Reference) -> RawEntity {
        match self.backing_store.peek_local_data(&reference.id).await {
            Some(data) => {
                let mut entity = CrdtEntity::from_data(data).consumer_view();
                if entity.id.is_empty() {
                    entity.id = reference.id.clone();
                }
                entity
            }
            None => RawEntity::new(reference.id.clone()),
        }
    }

    async fn materialize_references(&self, data: SetData<Reference>) -> SetData<RawEntity> {
        let mut values = BTreeMap::new();
        for (id, DataValue { value, version }) in data.values {
            values.insert(id, DataValue { value: self.entity_for(&value).await, version });
        }
        SetData { values, version: data.version }
    }

    async fn materialize(&self, outgoing: Outgoing<K>) -> EntityMessage<K> {
        match outgoing {
            Outgoing::References(data) => ProxyMessage::model_update(self.materialize_references(data).await, NO_LISTENER),
            Outgoing::ReferenceOps(ops) => {
                let mut operations = Vec::with_capacity(ops.len());
                for op in &ops {
                    let entity = match K::reference_target(op) {
                        Touched::Written(reference) | Touched::Removed(reference) => {
                            Some(self.entity_for(reference).await)
                        }
                        Touched::Nothing => None,
                    };
                    match K::to_entity_op(op, entity) {
                        Some(op) => operations.push(op),
                        None => log::warn!("dropping reference op with no entity on {}", self.storage_key),
                    }
                }
                ProxyMessage::operations(operations, NO_LISTENER)
            }
            Outgoing::Entities(data) => ProxyMessage::model_update(data, NO_LISTENER),
            Outgoing::EntityOps(ops) => ProxyMessage::operations(ops, NO_LISTENER),
            Outgoing::SyncRequest => ProxyMessage::sync_request(NO_LISTENER),
        }
    }

    /// Copy both halves of `other` into this store.
    pub async fn clone_store_from(&self, other: &ReferenceModeStore<K>) -> Result<(), StorageError> {
        other.idle().await?;
        let container = other.container_store.local_data().await;
        for id in container.values.keys() {
            let entity = other.backing_store.get_local_data(id, other.backing_listener()).await?;
            self.backing_store
                .on_proxy_message(ProxyMessage::model_update(entity, NO_LISTENER).muxed(id.clone()))
                .await?;
        }
        self.container_store.on_proxy_message(ProxyMessage::model_update(container, NO_LISTENER)).await?;
        self.drive().await;
        Ok(())
    }
}

#[async_trait]
impl<K: ContainerKind> ActiveStore<K::EntityContainer> for ReferenceModeStore<K> {
    fn storage_key(&self) -> &StorageKey {
        &self.storage_key
    }

    async fn on(&self, callback: ProxyCallback<K::EntityContainer>) -> ListenerId {
        let mut state = self.state.lock().await;
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state.callbacks.insert(id, callback);
        id
    }

    async fn off(&self, id: ListenerId) {
        self.state.lock().await.callbacks.remove(&id);
    }

    async fn on_proxy_message(&self, message: EntityMessage<K>) -> Result<bool, StorageError> {
        if let Some(error) = self.state.lock().await.pending_error.clone() {
            return Err(error);
        }
        let (reply, result) = oneshot::channel();
        self.push_job(Job::Proxy { message, reply });
        self.drive().await;
        result.await.map_err(|_| StorageError::StoreDropped(self.storage_key.to_string()))?
    }

    async fn idle(&self) -> Result<(), StorageError> {
        self.drive().await;
        self.container_store.idle().await?;
        self.backing_store.idle().await?;
        self.flush().await;
        match self.state.lock().await.pending_error.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn serialize_contents(&self) -> Result<SetData<RawEntity>, StorageError> {
        self.idle().await?;
        let data = self.container_store.local_data().await;
        Ok(self.materialize_references(data).await)
    }

    async fn report_exception_in_host(&self, error: StorageError) {
        log::error!("exception reported to {}: {error}", self.storage_key);
        self.state.lock().await.pending_error = Some(error);
    }
}
