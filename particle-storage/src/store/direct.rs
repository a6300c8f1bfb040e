//! A store backed by exactly one driver.
//!
//! State machine for driver writes:
//!
//! ```text
//!              local change                      write ok
//!   ┌──────┐ ───────────────► ┌──────────────────┐ ──────────► Idle
//!   │ Idle │                  │ AwaitingResponse │
//!   └──────┘ ◄─── no change ─ └────────┬─────────┘ ── write rejected ──┐
//!      ▲                 local change  │                               ▼
//!      │                               ▼                   ┌─────────────────────┐
//!      │                  ┌───────────────────────┐        │ AwaitingDriverModel │
//!      │                  │ AwaitingResponseDirty │        └──────────┬──────────┘
//!      │                  └───────────┬───────────┘                   │
//!      │                   write ok:  │ resend merged model           │ driver push:
//!      │                              ▼                               │ merge, resend
//!      └──────────────────────── AwaitingResponse ◄───────────────────┘
//! ```
//!
//! Driver pushes that arrive while a write is in flight are queued and
//! merged once the write settles. A rejected write is retried only when the
//! driver next pushes data; there is no timer.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::{watch, Mutex};

use particle_crdt::{CrdtChange, CrdtModel};

use super::{ActiveStore, ProxyCallback, StorageMode, StoreOptions};
use crate::driver::{Driver, DriverReceiver};
use crate::error::StorageError;
use crate::protocol::{self, ListenerId, ModelMessage, ProxyMessage, NO_LISTENER};
use crate::storage_key::StorageKey;

/// Where a direct store is in its write cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectStoreState {
    Idle,
    AwaitingResponse,
    AwaitingResponseDirty,
    AwaitingDriverModel,
}

type Delivery<M> = (ProxyCallback<M>, ModelMessage<M>);

struct Inner<M: CrdtModel> {
    local_model: M,
    /// Last version known to the driver.
    version: u64,
    state: DirectStoreState,
    pending_driver_models: Vec<(M::Data, u64)>,
    callbacks: BTreeMap<ListenerId, ProxyCallback<M>>,
    next_listener_id: ListenerId,
    pending_error: Option<StorageError>,
}

impl<M: CrdtModel> Inner<M> {
    /// Messages announcing `change`. Driver changes go to everyone, proxy
    /// changes to everyone but the sender.
    fn callback_messages(
        &self,
        change: &CrdtChange<M::Data, M::Operation>,
        from_driver: bool,
        channel: ListenerId,
    ) -> Vec<Delivery<M>> {
        if change.is_empty() {
            return Vec::new();
        }
        self.callbacks
            .iter()
            .filter(|(id, _)| from_driver || **id != channel)
            .map(|(id, callback)| {
                let message = match change {
                    CrdtChange::Operations(ops) => ProxyMessage::operations(ops.clone(), *id),
                    CrdtChange::Model(model) => ProxyMessage::model_update(model.clone(), *id),
                };
                (callback.clone(), message)
            })
            .collect()
    }
}

async fn deliver<M: CrdtModel>(deliveries: Vec<Delivery<M>>) {
    for (callback, message) in deliveries {
        callback(message).await;
    }
}

/// Authoritative replica of `M` persisted through one [`Driver`].
pub struct DirectStore<M: CrdtModel> {
    storage_key: StorageKey,
    driver: Arc<dyn Driver>,
    inner: Mutex<Inner<M>>,
    state_tx: watch::Sender<DirectStoreState>,
}

impl<M: CrdtModel> DirectStore<M> {
    /// Resolve a driver for `options.storage_key` and activate a store on it.
    pub async fn create(options: StoreOptions) -> Result<Arc<Self>, StorageError> {
        let driver = options.driver_factory.driver_for(&options.storage_key, options.exists).await?;
        Ok(Self::with_driver(options.storage_key, driver).await)
    }

    /// Activate a store on an existing driver.
    pub async fn with_driver(storage_key: StorageKey, driver: Arc<dyn Driver>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(DirectStoreState::Idle);
        let store = Arc::new(Self {
            storage_key,
            driver,
            inner: Mutex::new(Inner {
                local_model: M::default(),
                version: 0,
                state: DirectStoreState::Idle,
                pending_driver_models: Vec::new(),
                callbacks: BTreeMap::new(),
                next_listener_id: NO_LISTENER + 1,
                pending_error: None,
            }),
            state_tx,
        });

        let weak = Arc::downgrade(&store);
        let receiver: DriverReceiver = Arc::new(move |data, version| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(store) = weak.upgrade() {
                    store.on_receive(data, version).await;
                }
            })
        });
        store.driver.register_receiver(store.driver.token(), receiver).await;
        log::debug!("direct store active on {}", store.storage_key);
        store
    }

    pub fn mode(&self) -> StorageMode {
        StorageMode::Direct
    }

    pub fn state(&self) -> DirectStoreState {
        *self.state_tx.borrow()
    }

    /// Last version persisted through the driver.
    pub async fn version(&self) -> u64 {
        self.inner.lock().await.version
    }

    /// Copy of the local model's data, without waiting for idle.
    pub async fn local_data(&self) -> M::Data {
        self.inner.lock().await.local_model.data()
    }

    pub async fn listener_count(&self) -> usize {
        self.inner.lock().await.callbacks.len()
    }

    /// Merge another store's contents into this one.
    pub async fn clone_store_from(&self, other: &dyn ActiveStore<M>) -> Result<(), StorageError> {
        let data = other.serialize_contents().await?;
        self.on_proxy_message(ProxyMessage::model_update(data, NO_LISTENER)).await?;
        Ok(())
    }

    fn set_state(&self, inner: &mut Inner<M>, state: DirectStoreState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    async fn set_pending_error(&self, error: StorageError) {
        let mut inner = self.inner.lock().await;
        inner.pending_error = Some(error);
        let state = inner.state;
        self.state_tx.send_replace(state);
    }

    async fn on_receive(&self, bytes: Vec<u8>, version: u64) {
        let model: M::Data = match protocol::decode(&bytes) {
            Ok(model) => model,
            Err(e) => {
                log::error!("undecodable driver data on {}: {e}", self.storage_key);
                self.set_pending_error(e.into()).await;
                return;
            }
        };
        {
            let mut inner = self.inner.lock().await;
            inner.pending_driver_models.push((model, version));
            if matches!(inner.state, DirectStoreState::AwaitingResponse | DirectStoreState::AwaitingResponseDirty) {
                log::trace!("queued driver model v{version} on {}", self.storage_key);
                return;
            }
        }
        self.apply_pending_driver_models().await;
    }

    async fn apply_pending_driver_models(&self) {
        let (deliveries, no_driver_side_changes) = {
            let mut inner = self.inner.lock().await;
            if inner.pending_driver_models.is_empty() {
                return;
            }
            let models = std::mem::take(&mut inner.pending_driver_models);
            let mut deliveries = Vec::new();
            let mut no_changes = true;
            for (model, model_version) in models {
                let changes = inner.local_model.merge(model);
                deliveries.extend(inner.callback_messages(&changes.model_change, true, NO_LISTENER));
                no_changes &= changes.other_change.is_empty();
                inner.version = inner.version.max(model_version);
            }
            (deliveries, no_changes)
        };
        deliver::<M>(deliveries).await;
        self.update_state_and_act(no_driver_side_changes, true).await;
    }

    /// Decide whether the driver needs the local model, and send it if so.
    ///
    /// Listeners may write back into the store while their messages are
    /// delivered, so the version for each write is read when it is sent.
    fn update_state_and_act(&self, no_driver_side_changes: bool, from_driver: bool) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            {
                let mut inner = self.inner.lock().await;
                if no_driver_side_changes {
                    if from_driver && matches!(inner.state, DirectStoreState::AwaitingDriverModel | DirectStoreState::Idle) {
                        self.set_state(&mut inner, DirectStoreState::Idle);
                    }
                    return;
                }
                match inner.state {
                    DirectStoreState::AwaitingDriverModel if !from_driver => return,
                    DirectStoreState::AwaitingDriverModel | DirectStoreState::Idle => {}
                    DirectStoreState::AwaitingResponse => {
                        self.set_state(&mut inner, DirectStoreState::AwaitingResponseDirty);
                        return;
                    }
                    DirectStoreState::AwaitingResponseDirty => return,
                }
            }

            loop {
                let (bytes, version) = {
                    let mut inner = self.inner.lock().await;
                    self.set_state(&mut inner, DirectStoreState::AwaitingResponse);
                    inner.version += 1;
                    (protocol::encode(&inner.local_model.data()), inner.version)
                };
                let bytes = match bytes {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("cannot encode model for {}: {e}", self.storage_key);
                        self.set_pending_error(e.into()).await;
                        return;
                    }
                };

                let accepted = self.driver.write(bytes, version).await;

                let mut inner = self.inner.lock().await;
                if !accepted {
                    log::debug!("driver rejected v{version} on {}, waiting for its model", self.storage_key);
                    // The driver still holds the previous version.
                    if inner.version == version {
                        inner.version -= 1;
                    }
                    self.set_state(&mut inner, DirectStoreState::AwaitingDriverModel);
                    drop(inner);
                    self.apply_pending_driver_models().await;
                    return;
                }
                match inner.state {
                    DirectStoreState::AwaitingResponseDirty => continue,
                    DirectStoreState::AwaitingResponse => {
                        self.set_state(&mut inner, DirectStoreState::Idle);
                        drop(inner);
                        self.apply_pending_driver_models().await;
                        return;
                    }
                    state => {
                        log::warn!("write on {} settled in unexpected state {state:?}", self.storage_key);
                        return;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl<M: CrdtModel> ActiveStore<M> for DirectStore<M> {
    fn storage_key(&self) -> &StorageKey {
        &self.storage_key
    }

    async fn on(&self, callback: ProxyCallback<M>) -> ListenerId {
        let mut inner = self.inner.lock().await;
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.callbacks.insert(id, callback);
        id
    }

    async fn off(&self, id: ListenerId) {
        self.inner.lock().await.callbacks.remove(&id);
    }

    async fn on_proxy_message(&self, message: ModelMessage<M>) -> Result<bool, StorageError> {
        if let Some(error) = self.inner.lock().await.pending_error.clone() {
            return Err(error);
        }
        match message {
            ProxyMessage::SyncRequest { id } => {
                let reply = {
                    let inner = self.inner.lock().await;
                    inner.callbacks.get(&id).cloned().map(|cb| (cb, inner.local_model.data()))
                };
                match reply {
                    Some((callback, model)) => callback(ProxyMessage::model_update(model, id)).await,
                    None => log::warn!("sync request from unknown listener {id} on {}", self.storage_key),
                }
                Ok(true)
            }
            ProxyMessage::Operations { operations, id } => {
                let outcome = {
                    let mut inner = self.inner.lock().await;
                    match inner.local_model.apply_all(&operations) {
                        Ok(()) => {
                            let change = CrdtChange::Operations(operations.clone());
                            Ok(inner.callback_messages(&change, false, id))
                        }
                        Err(e) => Err((e, inner.callbacks.get(&id).cloned())),
                    }
                };
                match outcome {
                    Ok(deliveries) => {
                        deliver::<M>(deliveries).await;
                        self.update_state_and_act(operations.is_empty(), false).await;
                        Ok(true)
                    }
                    Err((e, sender)) => {
                        log::debug!("rejected operations from {id} on {}: {e}", self.storage_key);
                        if let Some(callback) = sender {
                            callback(ProxyMessage::sync_request(id)).await;
                        }
                        Ok(false)
                    }
                }
            }
            ProxyMessage::ModelUpdate { model, id } => {
                let (deliveries, no_changes) = {
                    let mut inner = self.inner.lock().await;
                    let changes = inner.local_model.merge(model);
                    (inner.callback_messages(&changes.model_change, false, id), changes.model_change.is_empty())
                };
                deliver::<M>(deliveries).await;
                self.update_state_and_act(no_changes, false).await;
                Ok(true)
            }
        }
    }

    async fn idle(&self) -> Result<(), StorageError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            {
                let inner = self.inner.lock().await;
                if let Some(error) = &inner.pending_error {
                    return Err(error.clone());
                }
                if inner.state == DirectStoreState::Idle {
                    return Ok(());
                }
            }
            if rx.changed().await.is_err() {
                return Err(StorageError::StoreDropped(self.storage_key.to_string()));
            }
        }
    }

    async fn serialize_contents(&self) -> Result<M::Data, StorageError> {
        self.idle().await?;
        Ok(self.local_data().await)
    }

    async fn report_exception_in_host(&self, error: StorageError) {
        log::error!("exception reported to {}: {error}", self.storage_key);
        self.set_pending_error(error).await;
    }
}
