//! Many per-entity direct stores behind one backing address.
//!
//! ```text
//!                   ┌───────────────── DirectStoreMuxer ─────────────────┐
//!   listener A ───► │ stores: id → Pending(shared activation) | Ready    │
//!   listener B ───► │ id_map: (id, muxer listener) → store listener      │
//!                   └────────┬───────────────────┬───────────────────────┘
//!                            ▼                   ▼
//!                  DirectStore(backing/e1)  DirectStore(backing/e2)
//! ```
//!
//! Every entity id gets at most one activation. Concurrent callers for an id
//! that is still activating await the same shared future.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use particle_crdt::{CrdtModel, ReferenceId};

use crate::error::StorageError;
use crate::protocol::{ListenerId, MuxedModelMessage, MuxedProxyMessage, NO_LISTENER};
use crate::store::{proxy_callback, ActiveStore, DirectStore, StorageMode, StoreOptions};
use crate::storage_key::StorageKey;

/// Listener registered on a muxer. Messages carry the entity id.
pub type MuxedProxyCallback<M> = Arc<dyn Fn(MuxedModelMessage<M>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`MuxedProxyCallback`].
pub fn muxed_callback<M, F, Fut>(f: F) -> MuxedProxyCallback<M>
where
    M: CrdtModel,
    F: Fn(MuxedModelMessage<M>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// An activated per-entity store.
#[derive(Clone)]
pub struct StoreRecord<M: CrdtModel> {
    pub id: ReferenceId,
    pub store: Arc<DirectStore<M>>,
}

type PendingStore<M> = Shared<BoxFuture<'static, Result<StoreRecord<M>, StorageError>>>;

enum StoreSlot<M: CrdtModel> {
    Pending(PendingStore<M>),
    Ready(StoreRecord<M>),
}

struct MuxerState<M: CrdtModel> {
    stores: HashMap<ReferenceId, StoreSlot<M>>,
    callbacks: BTreeMap<ListenerId, MuxedProxyCallback<M>>,
    next_listener_id: ListenerId,
    id_map: HashMap<(ReferenceId, ListenerId), ListenerId>,
}

/// Lazily activates one [`DirectStore`] per entity id under a backing key.
pub struct DirectStoreMuxer<M: CrdtModel> {
    options: StoreOptions,
    this: Weak<Self>,
    state: Mutex<MuxerState<M>>,
    activations: Arc<AtomicUsize>,
}

impl<M: CrdtModel> DirectStoreMuxer<M> {
    pub fn new(options: StoreOptions) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            options,
            this: this.clone(),
            state: Mutex::new(MuxerState {
                stores: HashMap::new(),
                callbacks: BTreeMap::new(),
                next_listener_id: NO_LISTENER + 1,
                id_map: HashMap::new(),
            }),
            activations: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn storage_key(&self) -> &StorageKey {
        &self.options.storage_key
    }

    pub fn mode(&self) -> StorageMode {
        StorageMode::Backing
    }

    /// Number of direct store activations started so far.
    pub fn activation_count(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub async fn store_count(&self) -> usize {
        self.state.lock().await.stores.len()
    }

    pub async fn on(&self, callback: MuxedProxyCallback<M>) -> ListenerId {
        let mut state = self.state.lock().await;
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state.callbacks.insert(id, callback);
        id
    }

    pub async fn off(&self, listener_id: ListenerId) {
        let detached: Vec<(Arc<DirectStore<M>>, ListenerId)> = {
            let mut state = self.state.lock().await;
            state.callbacks.remove(&listener_id);
            let keys: Vec<(ReferenceId, ListenerId)> =
                state.id_map.keys().filter(|(_, l)| *l == listener_id).cloned().collect();
            let mut detached = Vec::new();
            for key in keys {
                if let Some(local) = state.id_map.remove(&key) {
                    if let Some(StoreSlot::Ready(record)) = state.stores.get(&key.0) {
                        detached.push((record.store.clone(), local));
                    }
                }
            }
            detached
        };
        for (store, local) in detached {
            store.off(local).await;
        }
    }

    fn activate(&self, id: &str) -> BoxFuture<'static, Result<StoreRecord<M>, StorageError>> {
        let options = self.options.for_key(self.options.storage_key.child_key_with_component(id));
        let activations = self.activations.clone();
        let id = id.to_string();
        async move {
            activations.fetch_add(1, Ordering::SeqCst);
            log::debug!("activating backing store for {id}");
            let store = DirectStore::create(options).await?;
            Ok(StoreRecord { id, store })
        }
        .boxed()
    }

    /// Store for `id`, activating it on first use.
    pub async fn setup_store(&self, id: &str) -> Result<StoreRecord<M>, StorageError> {
        let pending = {
            let mut state = self.state.lock().await;
            match state.stores.get(id) {
                Some(StoreSlot::Ready(record)) => return Ok(record.clone()),
                Some(StoreSlot::Pending(pending)) => pending.clone(),
                None => {
                    let pending = self.activate(id).shared();
                    state.stores.insert(id.to_string(), StoreSlot::Pending(pending.clone()));
                    pending
                }
            }
        };

        let result = pending.await;

        let mut state = self.state.lock().await;
        let still_pending = matches!(state.stores.get(id), Some(StoreSlot::Pending(_)));
        match &result {
            Ok(record) if still_pending => {
                state.stores.insert(id.to_string(), StoreSlot::Ready(record.clone()));
            }
            Err(e) if still_pending => {
                log::warn!("backing store activation for {id} failed: {e}");
                state.stores.remove(id);
            }
            _ => {}
        }
        result
    }

    /// Attach muxer listener `listener_id` to `record`'s store. Returns the
    /// listener id on the store.
    pub async fn create_listener_for_store(
        &self,
        record: &StoreRecord<M>,
        listener_id: ListenerId,
    ) -> Result<ListenerId, StorageError> {
        let key = (record.id.clone(), listener_id);
        {
            let state = self.state.lock().await;
            if !state.callbacks.contains_key(&listener_id) {
                return Err(StorageError::UnknownListener(listener_id));
            }
            if let Some(local) = state.id_map.get(&key) {
                return Ok(*local);
            }
        }

        let this = self.this.clone();
        let mux_id = record.id.clone();
        let callback = proxy_callback::<M, _, _>(move |message| {
            let this = this.clone();
            let mux_id = mux_id.clone();
            async move {
                if let Some(muxer) = this.upgrade() {
                    muxer.dispatch(listener_id, message.with_id(listener_id).muxed(mux_id)).await;
                }
            }
        });
        let local = record.store.on(callback).await;

        let mut state = self.state.lock().await;
        if let Some(existing) = state.id_map.get(&key).copied() {
            drop(state);
            record.store.off(local).await;
            return Ok(existing);
        }
        state.id_map.insert(key, local);
        Ok(local)
    }

    async fn dispatch(&self, listener_id: ListenerId, message: MuxedModelMessage<M>) {
        let callback = self.state.lock().await.callbacks.get(&listener_id).cloned();
        if let Some(callback) = callback {
            callback(message).await;
        }
    }

    /// Route a muxed message to its entity store.
    pub async fn on_proxy_message(&self, muxed: MuxedModelMessage<M>) -> Result<bool, StorageError> {
        let MuxedProxyMessage { mux_id, message } = muxed;
        let record = self.setup_store(&mux_id).await?;
        let local = match message.id() {
            NO_LISTENER => NO_LISTENER,
            listener_id => self.create_listener_for_store(&record, listener_id).await?,
        };
        record.store.on_proxy_message(message.with_id(local)).await
    }

    /// Local data of `id` as seen by `listener_id`, activating if needed.
    pub async fn get_local_data(&self, id: &str, listener_id: ListenerId) -> Result<M::Data, StorageError> {
        if !self.state.lock().await.callbacks.contains_key(&listener_id) {
            return Err(StorageError::UnknownListener(listener_id));
        }
        let record = self.setup_store(id).await?;
        self.create_listener_for_store(&record, listener_id).await?;
        Ok(record.store.local_data().await)
    }

    /// Local data of `id` if its store is already active.
    pub async fn peek_local_data(&self, id: &str) -> Option<M::Data> {
        let store = match self.state.lock().await.stores.get(id) {
            Some(StoreSlot::Ready(record)) => record.store.clone(),
            _ => return None,
        };
        Some(store.local_data().await)
    }

    /// Snapshot of every active entity.
    pub async fn ready_records(&self) -> Vec<StoreRecord<M>> {
        let state = self.state.lock().await;
        let mut records: Vec<StoreRecord<M>> = state
            .stores
            .values()
            .filter_map(|slot| match slot {
                StoreSlot::Ready(record) => Some(record.clone()),
                StoreSlot::Pending(_) => None,
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub async fn idle(&self) -> Result<(), StorageError> {
        for record in self.ready_records().await {
            record.store.idle().await?;
        }
        Ok(())
    }

    /// Drop every active store and its listeners. The next access reactivates.
    pub async fn clear_stores_cache(&self) {
        let detached: Vec<(Arc<DirectStore<M>>, ListenerId)> = {
            let mut state = self.state.lock().await;
            let id_map = std::mem::take(&mut state.id_map);
            let stores = std::mem::take(&mut state.stores);
            id_map
                .into_iter()
                .filter_map(|((id, _), local)| match stores.get(&id) {
                    Some(StoreSlot::Ready(record)) => Some((record.store.clone(), local)),
                    _ => None,
                })
                .collect()
        };
        for (store, local) in detached {
            store.off(local).await;
        }
    }
}
