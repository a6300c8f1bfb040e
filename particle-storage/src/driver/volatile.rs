//! In-memory drivers for `volatile://` and `ramdisk://` keys.
//!
//! All drivers created over one [`VolatileMemory`] share its entries, so two
//! stores on the same key see each other's writes as driver pushes.
//!
//! ```text
//!  DirectStore A ── write(v+1) ──► VolatileMemory[key] ── push ──► DirectStore B
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use super::{Driver, DriverProvider, DriverReceiver, Exists};
use crate::error::StorageError;
use crate::storage_key::StorageKey;

#[derive(Debug, Clone, Default)]
struct VolatileEntry {
    data: Option<Vec<u8>>,
    version: u64,
    token: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<StorageKey, VolatileEntry>,
    receivers: HashMap<StorageKey, BTreeMap<Uuid, DriverReceiver>>,
}

/// Shared backing memory. Never locked across an await.
#[derive(Default)]
pub struct VolatileMemory {
    state: Mutex<MemoryState>,
}

impl VolatileMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Version of the entry at `key`, if any.
    pub fn version(&self, key: &StorageKey) -> Option<u64> {
        self.lock().entries.get(key).map(|e| e.version)
    }

    /// Receivers registered on `key` by live drivers.
    pub fn receiver_count(&self, key: &StorageKey) -> usize {
        self.lock().receivers.get(key).map_or(0, BTreeMap::len)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Driver over one entry of a [`VolatileMemory`].
pub struct VolatileDriver {
    id: Uuid,
    storage_key: StorageKey,
    exists: Exists,
    memory: Arc<VolatileMemory>,
    last_token: Mutex<Option<String>>,
}

impl VolatileDriver {
    pub fn new(storage_key: StorageKey, exists: Exists, memory: Arc<VolatileMemory>) -> Result<Self, StorageError> {
        {
            let mut state = memory.lock();
            let present = state.entries.contains_key(&storage_key);
            match exists {
                Exists::ShouldCreate if present => {
                    return Err(StorageError::DriverActivation {
                        key: storage_key.to_string(),
                        reason: "requested creation of memory location that already exists".into(),
                    });
                }
                Exists::ShouldExist if !present => {
                    return Err(StorageError::DriverActivation {
                        key: storage_key.to_string(),
                        reason: "requested existing memory location that doesn't exist".into(),
                    });
                }
                _ => {
                    state.entries.entry(storage_key.clone()).or_default();
                }
            }
        }
        Ok(Self { id: Uuid::new_v4(), storage_key, exists, memory, last_token: Mutex::new(None) })
    }

    fn set_token(&self, token: Option<String>) {
        *self.last_token.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }
}

impl Drop for VolatileDriver {
    fn drop(&mut self) {
        let mut state = self.memory.lock();
        if let Some(receivers) = state.receivers.get_mut(&self.storage_key) {
            receivers.remove(&self.id);
            if receivers.is_empty() {
                state.receivers.remove(&self.storage_key);
            }
        }
    }
}

#[async_trait]
impl Driver for VolatileDriver {
    fn storage_key(&self) -> &StorageKey {
        &self.storage_key
    }

    fn exists(&self) -> Exists {
        self.exists
    }

    fn token(&self) -> Option<String> {
        self.last_token.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn read(&self) -> Option<(Vec<u8>, u64)> {
        let state = self.memory.lock();
        let entry = state.entries.get(&self.storage_key)?;
        entry.data.clone().map(|data| (data, entry.version))
    }

    async fn write(&self, data: Vec<u8>, version: u64) -> bool {
        let peers: Vec<DriverReceiver> = {
            let mut state = self.memory.lock();
            let entry = state.entries.entry(self.storage_key.clone()).or_default();
            if entry.version + 1 != version {
                log::debug!(
                    "rejecting write to {} at version {version}, memory holds {}",
                    self.storage_key,
                    entry.version
                );
                return false;
            }
            let token = Uuid::new_v4().to_string();
            entry.data = Some(data.clone());
            entry.version = version;
            entry.token = Some(token.clone());
            self.set_token(Some(token));
            state
                .receivers
                .get(&self.storage_key)
                .map(|r| r.iter().filter(|(id, _)| **id != self.id).map(|(_, rx)| rx.clone()).collect())
                .unwrap_or_default()
        };
        for receiver in peers {
            receiver(data.clone(), version).await;
        }
        true
    }

    async fn register_receiver(&self, token: Option<String>, receiver: DriverReceiver) {
        let existing = {
            let mut state = self.memory.lock();
            state.receivers.entry(self.storage_key.clone()).or_default().insert(self.id, receiver.clone());
            state.entries.get(&self.storage_key).and_then(|entry| match &entry.data {
                Some(data) if entry.token != token => Some((data.clone(), entry.version, entry.token.clone())),
                _ => None,
            })
        };
        if let Some((data, version, token)) = existing {
            self.set_token(token);
            receiver(data, version).await;
        }
    }
}

/// Serves `volatile://` keys belonging to one arc.
pub struct VolatileDriverProvider {
    arc_id: String,
    memory: Arc<VolatileMemory>,
}

impl VolatileDriverProvider {
    pub fn new(arc_id: impl Into<String>, memory: Arc<VolatileMemory>) -> Self {
        Self { arc_id: arc_id.into(), memory }
    }
}

#[async_trait]
impl DriverProvider for VolatileDriverProvider {
    fn will_support(&self, key: &StorageKey) -> bool {
        matches!(key, StorageKey::Volatile { arc_id, .. } if *arc_id == self.arc_id)
    }

    async fn driver(&self, key: &StorageKey, exists: Exists) -> Result<Arc<dyn Driver>, StorageError> {
        if !self.will_support(key) {
            return Err(StorageError::NoDriver(key.to_string()));
        }
        Ok(Arc::new(VolatileDriver::new(key.clone(), exists, self.memory.clone())?))
    }
}

/// Serves `ramdisk://` keys; shared by every arc in the runtime.
pub struct RamDiskDriverProvider {
    memory: Arc<VolatileMemory>,
}

impl RamDiskDriverProvider {
    pub fn new(memory: Arc<VolatileMemory>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl DriverProvider for RamDiskDriverProvider {
    fn will_support(&self, key: &StorageKey) -> bool {
        matches!(key, StorageKey::RamDisk { .. })
    }

    async fn driver(&self, key: &StorageKey, exists: Exists) -> Result<Arc<dyn Driver>, StorageError> {
        if !self.will_support(key) {
            return Err(StorageError::NoDriver(key.to_string()));
        }
        Ok(Arc::new(VolatileDriver::new(key.clone(), exists, self.memory.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn key() -> StorageKey {
        StorageKey::volatile("!arc", "thing")
    }

    fn channel_receiver() -> (DriverReceiver, mpsc::UnboundedReceiver<(Vec<u8>, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let receiver: DriverReceiver = Arc::new(move |data, version| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send((data, version));
            })
        });
        (receiver, rx)
    }

    #[tokio::test]
    async fn test_exists_policies() {
        let memory = Arc::new(VolatileMemory::new());
        assert!(VolatileDriver::new(key(), Exists::ShouldExist, memory.clone()).is_err());
        assert!(VolatileDriver::new(key(), Exists::ShouldCreate, memory.clone()).is_ok());
        assert!(VolatileDriver::new(key(), Exists::ShouldCreate, memory.clone()).is_err());
        assert!(VolatileDriver::new(key(), Exists::ShouldExist, memory.clone()).is_ok());
        assert!(VolatileDriver::new(key(), Exists::MayExist, memory).is_ok());
    }

    #[tokio::test]
    async fn test_write_requires_next_version() {
        let memory = Arc::new(VolatileMemory::new());
        let driver = VolatileDriver::new(key(), Exists::MayExist, memory.clone()).unwrap();

        assert!(!driver.write(vec![1], 2).await);
        assert!(driver.write(vec![1], 1).await);
        assert!(!driver.write(vec![2], 1).await);
        assert!(driver.write(vec![2], 2).await);
        assert_eq!(driver.read().await, Some((vec![2], 2)));
        assert_eq!(memory.version(&key()), Some(2));
    }

    #[tokio::test]
    async fn test_write_pushes_to_other_drivers_only() {
        let memory = Arc::new(VolatileMemory::new());
        let a = VolatileDriver::new(key(), Exists::MayExist, memory.clone()).unwrap();
        let b = VolatileDriver::new(key(), Exists::MayExist, memory).unwrap();

        let (rx_a, mut seen_a) = channel_receiver();
        let (rx_b, mut seen_b) = channel_receiver();
        a.register_receiver(None, rx_a).await;
        b.register_receiver(None, rx_b).await;

        assert!(a.write(vec![7], 1).await);
        assert_eq!(seen_b.recv().await, Some((vec![7], 1)));
        assert!(seen_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_register_receiver_delivers_existing_data() {
        let memory = Arc::new(VolatileMemory::new());
        let writer = VolatileDriver::new(key(), Exists::MayExist, memory.clone()).unwrap();
        assert!(writer.write(vec![3], 1).await);

        let reader = VolatileDriver::new(key(), Exists::ShouldExist, memory).unwrap();
        let (rx, mut seen) = channel_receiver();
        reader.register_receiver(None, rx).await;
        assert_eq!(seen.recv().await, Some((vec![3], 1)));

        // Same token: nothing new to deliver.
        let (rx2, mut seen2) = channel_receiver();
        writer.register_receiver(writer.token(), rx2).await;
        assert!(seen2.try_recv().is_err());
    }
    #[tokio::test]
    async fn test_dropped_driver_unregisters_receiver() {
        let memory = Arc::new(VolatileMemory::new());
        let a = VolatileDriver::new(key(), Exists::MayExist, memory.clone()).unwrap();
        let b = VolatileDriver::new(key(), Exists::MayExist, memory.clone()).unwrap();
        let (rx_a, _seen_a) = channel_receiver();
        let (rx_b, _seen_b) = channel_receiver();
        a.register_receiver(None, rx_a).await;
        b.register_receiver(None, rx_b).await;
        assert_eq!(memory.receiver_count(&key()), 2);

        drop(b);
        assert_eq!(memory.receiver_count(&key()), 1);
        assert!(a.write(vec![1], 1).await);

        drop(a);
        assert_eq!(memory.receiver_count(&key()), 0);
        // The entry itself outlives its drivers.
        assert_eq!(memory.version(&key()), Some(1));
    }
}
