//! Client-side replica between particle handles and an active store.
//!
//! ```text
//!   handle ──┐                               ┌──► ActiveStore
//!   handle ──┼──► StorageProxy (local model) ┤
//!   handle ──┘     AwaitingSync/Synchronized └──◄ listener callback
//!                  /Desynced/Closed
//! ```
//!
//! A proxy asks for a full model as soon as it is built. Handle callbacks
//! run with no proxy lock held; a failing handle is reported to the store
//! and does not stop the rest of the fan-out.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};

use particle_crdt::{CrdtChange, CrdtModel, VersionMap};

use crate::error::{HandleError, StorageError};
use crate::protocol::{ListenerId, ModelMessage, ProxyMessage};
use crate::store::{proxy_callback, ActiveStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Built, first sync requested.
    AwaitingSync,
    Synchronized,
    /// Lost sync; a new request is in flight.
    Desynced,
    Closed,
}

/// How eagerly a handle wants to be kept consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleOptions {
    pub keep_synced: bool,
    pub notify_sync: bool,
    pub notify_update: bool,
    pub notify_desync: bool,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self { keep_synced: true, notify_sync: true, notify_update: true, notify_desync: true }
    }
}

impl HandleOptions {
    /// Update-only handle that does not need a consistent base.
    pub fn updates_only() -> Self {
        Self { keep_synced: false, notify_sync: false, notify_update: true, notify_desync: false }
    }
}

/// Receiver side of a particle handle.
#[async_trait]
pub trait ProxyHandle<M: CrdtModel>: Send + Sync {
    async fn on_sync(&self, view: M::ConsumerView) -> Result<(), HandleError>;

    async fn on_update(&self, op: M::Operation) -> Result<(), HandleError>;

    async fn on_desync(&self) -> Result<(), HandleError>;
}

struct HandleEntry<M: CrdtModel> {
    name: String,
    options: HandleOptions,
    handle: Arc<dyn ProxyHandle<M>>,
}

enum Dispatch<M: CrdtModel> {
    Sync(M::ConsumerView),
    Update(M::Operation),
    Desync,
}

impl<M: CrdtModel> Dispatch<M> {
    fn name(&self) -> &'static str {
        match self {
            Dispatch::Sync(_) => "on_sync",
            Dispatch::Update(_) => "on_update",
            Dispatch::Desync => "on_desync",
        }
    }
}

type Notification<M> = (String, Arc<dyn ProxyHandle<M>>, Dispatch<M>);

struct ProxyInner<M: CrdtModel> {
    model: M,
    state: ProxyState,
    handles: Vec<HandleEntry<M>>,
}

impl<M: CrdtModel> ProxyInner<M> {
    fn notify(
        &self,
        out: &mut Vec<Notification<M>>,
        wants: impl Fn(&HandleOptions) -> bool,
        dispatch: impl Fn() -> Dispatch<M>,
    ) {
        for entry in self.handles.iter().filter(|h| wants(&h.options)) {
            out.push((entry.name.clone(), entry.handle.clone(), dispatch()));
        }
    }

    fn notify_sync(&self, out: &mut Vec<Notification<M>>, view: &M::ConsumerView) {
        self.notify(out, |o| o.notify_sync, || Dispatch::Sync(view.clone()));
    }

    fn notify_desync(&self, out: &mut Vec<Notification<M>>) {
        self.notify(out, |o| o.notify_desync, || Dispatch::Desync);
    }
}

/// Local replica of one store's model, shared by the handles registered on it.
pub struct StorageProxy<M: CrdtModel> {
    store: Arc<dyn ActiveStore<M>>,
    listener_id: OnceLock<ListenerId>,
    inner: Mutex<ProxyInner<M>>,
    state_tx: watch::Sender<ProxyState>,
}

impl<M: CrdtModel> StorageProxy<M> {
    /// Attach to `store` and request its model.
    pub async fn new(store: Arc<dyn ActiveStore<M>>) -> Result<Arc<Self>, StorageError> {
        let (state_tx, _) = watch::channel(ProxyState::AwaitingSync);
        let proxy = Arc::new(Self {
            store,
            listener_id: OnceLock::new(),
            inner: Mutex::new(ProxyInner { model: M::default(), state: ProxyState::AwaitingSync, handles: Vec::new() }),
            state_tx,
        });

        let weak = Arc::downgrade(&proxy);
        let id = proxy
            .store
            .on(proxy_callback::<M, _, _>(move |message| {
                let weak = weak.clone();
                async move {
                    if let Some(proxy) = weak.upgrade() {
                        if let Err(e) = proxy.on_message(message).await {
                            log::warn!("storage proxy on {} dropped a message: {e}", proxy.store.storage_key());
                        }
                    }
                }
            }))
            .await;
        let _ = proxy.listener_id.set(id);

        proxy.store.on_proxy_message(ProxyMessage::sync_request(id)).await?;
        Ok(proxy)
    }

    pub fn state(&self) -> ProxyState {
        *self.state_tx.borrow()
    }

    pub fn listener_id(&self) -> Option<ListenerId> {
        self.listener_id.get().copied()
    }

    fn open_listener(&self, inner: &ProxyInner<M>) -> Result<ListenerId, StorageError> {
        match (inner.state, self.listener_id()) {
            (ProxyState::Closed, _) | (_, None) => Err(StorageError::ProxyClosed(self.store.storage_key().to_string())),
            (_, Some(id)) => Ok(id),
        }
    }

    fn set_state(&self, inner: &mut ProxyInner<M>, state: ProxyState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Register a handle. A keep-synced handle joining a synchronized proxy
    /// gets its sync right away.
    pub async fn register_handle(
        &self,
        name: impl Into<String>,
        options: HandleOptions,
        handle: Arc<dyn ProxyHandle<M>>,
    ) -> Result<(), StorageError> {
        let name = name.into();
        let notifications = {
            let mut inner = self.inner.lock().await;
            self.open_listener(&inner)?;
            let mut out = Vec::new();
            if options.keep_synced && options.notify_sync && inner.state == ProxyState::Synchronized {
                out.push((name.clone(), handle.clone(), Dispatch::Sync(inner.model.consumer_view())));
            }
            inner.handles.push(HandleEntry { name, options, handle });
            out
        };
        self.dispatch(notifications).await;
        Ok(())
    }

    pub async fn deregister_handle(&self, name: &str) {
        self.inner.lock().await.handles.retain(|h| h.name != name);
    }

    pub async fn handle_count(&self) -> usize {
        self.inner.lock().await.handles.len()
    }

    /// Apply `op` locally, forward it to the store and tell the handles.
    /// `Ok(false)` if the op does not apply to the local model.
    pub async fn apply_op(&self, op: M::Operation) -> Result<bool, StorageError> {
        let id = {
            let mut inner = self.inner.lock().await;
            let id = self.open_listener(&inner)?;
            if let Err(e) = inner.model.apply_operation(&op) {
                log::debug!("local op rejected on {}: {e}", self.store.storage_key());
                return Ok(false);
            }
            id
        };

        self.store.on_proxy_message(ProxyMessage::operations(vec![op.clone()], id)).await?;

        let notifications = {
            let inner = self.inner.lock().await;
            let mut out = Vec::new();
            inner.notify(&mut out, |o| o.notify_update, || Dispatch::Update(op.clone()));
            out
        };
        self.dispatch(notifications).await;
        Ok(true)
    }

    /// Consumer view once synchronized. Waits while a sync is outstanding,
    /// and asks the store again if the proxy is desynced.
    pub async fn get_particle_view(&self) -> Result<M::ConsumerView, StorageError> {
        let mut rx = self.state_tx.subscribe();
        let mut requested = false;
        loop {
            let desynced = {
                let inner = self.inner.lock().await;
                match inner.state {
                    ProxyState::Synchronized => return Ok(inner.model.consumer_view()),
                    ProxyState::Closed => return Err(StorageError::ProxyClosed(self.store.storage_key().to_string())),
                    ProxyState::AwaitingSync => false,
                    ProxyState::Desynced => true,
                }
            };
            if desynced && !requested {
                requested = true;
                self.request_sync().await?;
                continue;
            }
            if rx.changed().await.is_err() {
                return Err(StorageError::ProxyClosed(self.store.storage_key().to_string()));
            }
        }
    }

    pub async fn get_version_map(&self) -> VersionMap {
        self.inner.lock().await.model.version_map()
    }

    /// Detach from the store. Later calls fail with `ProxyClosed`.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == ProxyState::Closed {
                return;
            }
            self.set_state(&mut inner, ProxyState::Closed);
            inner.handles.clear();
        }
        if let Some(id) = self.listener_id() {
            self.store.off(id).await;
        }
    }

    async fn request_sync(&self) -> Result<(), StorageError> {
        let id = {
            let inner = self.inner.lock().await;
            self.open_listener(&inner)?
        };
        self.store.on_proxy_message(ProxyMessage::sync_request(id)).await?;
        Ok(())
    }

    async fn on_message(&self, message: ModelMessage<M>) -> Result<(), StorageError> {
        match message {
            ProxyMessage::ModelUpdate { model, .. } => {
                let notifications = {
                    let mut inner = self.inner.lock().await;
                    if inner.state == ProxyState::Closed {
                        return Ok(());
                    }
                    let changes = inner.model.merge(model);
                    let mut out = Vec::new();
                    let synced = inner.state == ProxyState::Synchronized;
                    match changes.model_change {
                        CrdtChange::Operations(ops) if synced => {
                            for op in ops {
                                inner.notify(&mut out, |o| !o.keep_synced && o.notify_update, || Dispatch::Update(op.clone()));
                            }
                        }
                        _ => {
                            if synced {
                                inner.notify_desync(&mut out);
                            }
                            self.set_state(&mut inner, ProxyState::Synchronized);
                            let view = inner.model.consumer_view();
                            inner.notify_sync(&mut out, &view);
                        }
                    }
                    out
                };
                self.dispatch(notifications).await;
                Ok(())
            }
            ProxyMessage::Operations { operations, .. } => {
                let (notifications, failed) = {
                    let mut inner = self.inner.lock().await;
                    if inner.state == ProxyState::Closed {
                        return Ok(());
                    }
                    let mut out = Vec::new();
                    // Handles that don't need a consistent base hear about every op.
                    for op in &operations {
                        inner.notify(&mut out, |o| !o.keep_synced && o.notify_update, || Dispatch::Update(op.clone()));
                    }
                    let mut failed = false;
                    for op in &operations {
                        if let Err(e) = inner.model.apply_operation(op) {
                            log::debug!("store op does not apply on {}: {e}", self.store.storage_key());
                            if inner.state == ProxyState::Synchronized {
                                inner.notify_desync(&mut out);
                            }
                            self.set_state(&mut inner, ProxyState::Desynced);
                            failed = true;
                            break;
                        }
                        if inner.state == ProxyState::Synchronized {
                            inner.notify(&mut out, |o| o.keep_synced && o.notify_update, || Dispatch::Update(op.clone()));
                        }
                    }
                    (out, failed)
                };
                self.dispatch(notifications).await;
                if failed {
                    self.request_sync().await?;
                }
                Ok(())
            }
            ProxyMessage::SyncRequest { id } => {
                let model = {
                    let inner = self.inner.lock().await;
                    if inner.state == ProxyState::Closed {
                        return Ok(());
                    }
                    inner.model.data()
                };
                self.store.on_proxy_message(ProxyMessage::model_update(model, id)).await?;
                Ok(())
            }
        }
    }

    async fn dispatch(&self, notifications: Vec<Notification<M>>) {
        for (name, handle, dispatch) in notifications {
            let context = dispatch.name();
            let result = match dispatch {
                Dispatch::Sync(view) => handle.on_sync(view).await,
                Dispatch::Update(op) => handle.on_update(op).await,
                Dispatch::Desync => handle.on_desync().await,
            };
            if let Err(source) = result {
                log::warn!("handle {name} failed in {context}: {source}");
                self.store
                    .report_exception_in_host(StorageError::HandleCallback { handle: name, dispatch: context, source })
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverFactory, Exists, VolatileDriverProvider, VolatileMemory};
    use crate::store::{DirectStore, ProxyCallback, StoreOptions};
    use crate::storage_key::StorageKey;
    use particle_crdt::{CountData, CountOp, CrdtCount};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
        fail: bool,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, event: String) -> Result<(), HandleError> {
            self.events.lock().unwrap().push(event);
            if self.fail {
                Err(HandleError::new("boom"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ProxyHandle<CrdtCount> for Recorder {
        async fn on_sync(&self, view: u64) -> Result<(), HandleError> {
            self.record(format!("sync {view}"))
        }

        async fn on_update(&self, _op: CountOp) -> Result<(), HandleError> {
            self.record("update".to_string())
        }

        async fn on_desync(&self) -> Result<(), HandleError> {
            self.record("desync".to_string())
        }
    }

    async fn store(memory: &Arc<VolatileMemory>) -> Arc<DirectStore<CrdtCount>> {
        let factory = DriverFactory::new().with_provider(Arc::new(VolatileDriverProvider::new("!arc", memory.clone())));
        let options = StoreOptions::new(StorageKey::volatile("!arc", "count"), Exists::MayExist, Arc::new(factory));
        DirectStore::create(options).await.unwrap()
    }

    /// Store that answers sync requests only when it has a reply set.
    struct ScriptedStore {
        key: StorageKey,
        callback: StdMutex<Option<ProxyCallback<CrdtCount>>>,
        reply: StdMutex<Option<CountData>>,
        offline: AtomicBool,
        sync_requests: AtomicUsize,
    }

    impl ScriptedStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                key: StorageKey::volatile("!arc", "scripted"),
                callback: StdMutex::new(None),
                reply: StdMutex::new(Some(CountData::default())),
                offline: AtomicBool::new(false),
                sync_requests: AtomicUsize::new(0),
            })
        }

        fn set_reply(&self, reply: Option<CountData>) {
            *self.reply.lock().unwrap() = reply;
        }

        fn sync_requests(&self) -> usize {
            self.sync_requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ActiveStore<CrdtCount> for ScriptedStore {
        fn storage_key(&self) -> &StorageKey {
            &self.key
        }

        async fn on(&self, callback: ProxyCallback<CrdtCount>) -> ListenerId {
            *self.callback.lock().unwrap() = Some(callback);
            1
        }

        async fn off(&self, _id: ListenerId) {
            *self.callback.lock().unwrap() = None;
        }

        async fn on_proxy_message(&self, message: ModelMessage<CrdtCount>) -> Result<bool, StorageError> {
            if let ProxyMessage::SyncRequest { id } = message {
                self.sync_requests.fetch_add(1, Ordering::SeqCst);
                if self.offline.load(Ordering::SeqCst) {
                    return Err(StorageError::Other("offline".into()));
                }
                let reply = self.reply.lock().unwrap().clone();
                let callback = self.callback.lock().unwrap().clone();
                if let (Some(model), Some(callback)) = (reply, callback) {
                    callback(ProxyMessage::model_update(model, id)).await;
                }
            }
            Ok(true)
        }

        async fn idle(&self) -> Result<(), StorageError> {
            Ok(())
        }

        async fn serialize_contents(&self) -> Result<CountData, StorageError> {
            Ok(CountData::default())
        }

        async fn report_exception_in_host(&self, _error: StorageError) {}
    }

    #[tokio::test]
    async fn test_new_proxy_syncs_immediately() {
        let memory = Arc::new(VolatileMemory::new());
        let store = store(&memory).await;
        let proxy = StorageProxy::<CrdtCount>::new(store).await.unwrap();
        assert_eq!(proxy.state(), ProxyState::Synchronized);
        assert_eq!(proxy.get_particle_view().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_apply_op_reaches_other_proxy() {
        let memory = Arc::new(VolatileMemory::new());
        let store = store(&memory).await;
        let writer = StorageProxy::<CrdtCount>::new(store.clone()).await.unwrap();
        let reader = StorageProxy::<CrdtCount>::new(store.clone()).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        reader.register_handle("reader", HandleOptions::default(), recorder.clone()).await.unwrap();

        assert!(writer.apply_op(CountOp::increment("me", 0)).await.unwrap());
        store.idle().await.unwrap();

        assert_eq!(reader.get_particle_view().await.unwrap(), 1);
        assert_eq!(recorder.events(), vec!["sync 0", "update"]);
        assert_eq!(writer.get_version_map().await, VersionMap::from_entries([("me", 1)]));
    }

    #[tokio::test]
    async fn test_out_of_order_local_op_is_rejected() {
        let memory = Arc::new(VolatileMemory::new());
        let proxy = StorageProxy::<CrdtCount>::new(store(&memory).await).await.unwrap();
        assert!(!proxy.apply_op(CountOp::increment("me", 3)).await.unwrap());
        assert_eq!(proxy.get_particle_view().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_store_op_desyncs_then_resyncs() {
        let memory = Arc::new(VolatileMemory::new());
        let store = store(&memory).await;
        let proxy = StorageProxy::<CrdtCount>::new(store).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        proxy.register_handle("h", HandleOptions::default(), recorder.clone()).await.unwrap();

        // An op the local model can't take yet.
        proxy.on_message(ProxyMessage::operations(vec![CountOp::increment("them", 5)], 1)).await.unwrap();

        assert_eq!(recorder.events(), vec!["sync 0", "desync", "sync 0"]);
        assert_eq!(proxy.state(), ProxyState::Synchronized);
    }

    #[tokio::test]
    async fn test_handle_error_is_reported_to_store() {
        let memory = Arc::new(VolatileMemory::new());
        let store = store(&memory).await;
        let proxy = StorageProxy::<CrdtCount>::new(store.clone()).await.unwrap();
        let failing = Arc::new(Recorder { fail: true, ..Default::default() });
        proxy.register_handle("bad", HandleOptions::default(), failing).await.unwrap();

        match store.idle().await {
            Err(StorageError::HandleCallback { handle, dispatch, .. }) => {
                assert_eq!(handle, "bad");
                assert_eq!(dispatch, "on_sync");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_detaches() {
        let memory = Arc::new(VolatileMemory::new());
        let store = store(&memory).await;
        let proxy = StorageProxy::<CrdtCount>::new(store.clone()).await.unwrap();
        assert_eq!(store.listener_count().await, 1);

        proxy.close().await;
        assert_eq!(store.listener_count().await, 0);
        assert!(matches!(
            proxy.apply_op(CountOp::increment("me", 0)).await,
            Err(StorageError::ProxyClosed(_))
        ));
        assert!(proxy.get_particle_view().await.is_err());
    }
    #[tokio::test]
    async fn test_updates_only_handle_hears_ops_while_desynced() {
        let store = ScriptedStore::new();
        let proxy = StorageProxy::<CrdtCount>::new(store.clone()).await.unwrap();
        let updates = Arc::new(Recorder::default());
        let synced = Arc::new(Recorder::default());
        proxy.register_handle("updates", HandleOptions::updates_only(), updates.clone()).await.unwrap();
        proxy.register_handle("synced", HandleOptions::default(), synced.clone()).await.unwrap();

        // The store stops answering, so the proxy stays desynced.
        store.set_reply(None);
        proxy.on_message(ProxyMessage::operations(vec![CountOp::increment("them", 5)], 1)).await.unwrap();
        assert_eq!(proxy.state(), ProxyState::Desynced);

        proxy.on_message(ProxyMessage::operations(vec![CountOp::increment("me", 0)], 1)).await.unwrap();

        assert_eq!(proxy.state(), ProxyState::Desynced);
        assert_eq!(updates.events(), vec!["update", "update"]);
        assert_eq!(synced.events(), vec!["sync 0", "desync"]);
    }

    #[tokio::test]
    async fn test_disabled_sync_and_desync_notifications() {
        let memory = Arc::new(VolatileMemory::new());
        let proxy = StorageProxy::<CrdtCount>::new(store(&memory).await).await.unwrap();
        let quiet = Arc::new(Recorder::default());
        let loud = Arc::new(Recorder::default());
        let options = HandleOptions { notify_sync: false, notify_desync: false, ..HandleOptions::default() };
        proxy.register_handle("quiet", options, quiet.clone()).await.unwrap();
        proxy.register_handle("loud", HandleOptions::default(), loud.clone()).await.unwrap();

        proxy.on_message(ProxyMessage::operations(vec![CountOp::increment("them", 5)], 1)).await.unwrap();
        assert_eq!(proxy.state(), ProxyState::Synchronized);
        assert!(quiet.events().is_empty());
        assert_eq!(loud.events(), vec!["sync 0", "desync", "sync 0"]);

        proxy.on_message(ProxyMessage::operations(vec![CountOp::increment("them", 0)], 1)).await.unwrap();
        assert_eq!(quiet.events(), vec!["update"]);
    }

    #[tokio::test]
    async fn test_view_requests_sync_when_desynced() {
        let store = ScriptedStore::new();
        let proxy = StorageProxy::<CrdtCount>::new(store.clone()).await.unwrap();
        store.set_reply(None);
        proxy.on_message(ProxyMessage::operations(vec![CountOp::increment("them", 5)], 1)).await.unwrap();
        assert_eq!(proxy.state(), ProxyState::Desynced);
        assert_eq!(store.sync_requests(), 2);

        store.offline.store(true, Ordering::SeqCst);
        assert_eq!(proxy.get_particle_view().await, Err(StorageError::Other("offline".into())));
        assert_eq!(store.sync_requests(), 3);

        store.offline.store(false, Ordering::SeqCst);
        store.set_reply(Some(CountData::default()));
        assert_eq!(proxy.get_particle_view().await.unwrap(), 0);
        assert_eq!(proxy.state(), ProxyState::Synchronized);
        assert_eq!(store.sync_requests(), 4);
    }
}
