//! Runtime wiring for the injectable registries.

use std::sync::Arc;

use crate::driver::{DriverFactory, Exists, RamDiskDriverProvider, VolatileDriverProvider, VolatileMemory};
use crate::storage_key::{StorageKey, StorageKeyParser};
use crate::store::StoreOptions;

/// Storage configuration for one arc.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Arc whose `volatile://` keys this runtime serves
    pub arc_id: String,
    /// Serve `ramdisk://` keys from the same memory
    pub enable_ram_disk: bool,
    /// Existence policy for stores opened through [`StorageConfig::options`]
    pub default_exists: Exists,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { arc_id: "!arc".to_string(), enable_ram_disk: true, default_exists: Exists::MayExist }
    }
}

impl StorageConfig {
    /// Config for testing (fresh arc id, every in-memory driver on).
    pub fn for_testing() -> Self {
        Self { arc_id: format!("!test-{}", uuid::Uuid::new_v4()), ..Self::default() }
    }

    /// Driver registry over `memory`.
    pub fn build_driver_factory(&self, memory: Arc<VolatileMemory>) -> DriverFactory {
        let mut factory = DriverFactory::new();
        factory.register(Arc::new(VolatileDriverProvider::new(self.arc_id.clone(), memory.clone())));
        if self.enable_ram_disk {
            factory.register(Arc::new(RamDiskDriverProvider::new(memory)));
        }
        log::debug!("driver factory for {} with {} providers", self.arc_id, factory.provider_count());
        factory
    }

    pub fn key_parser(&self) -> StorageKeyParser {
        StorageKeyParser::with_defaults()
    }

    /// A `volatile://` key in this arc.
    pub fn volatile_key(&self, unique: impl Into<String>) -> StorageKey {
        StorageKey::volatile(self.arc_id.clone(), unique)
    }

    /// Store options for `key` on `factory`.
    pub fn options(&self, key: StorageKey, factory: Arc<DriverFactory>) -> StoreOptions {
        StoreOptions::new(key, self.default_exists, factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.arc_id, "!arc");
        assert!(config.enable_ram_disk);
        assert_eq!(config.default_exists, Exists::MayExist);
    }

    #[test]
    fn test_factory_honours_ram_disk_flag() {
        let memory = Arc::new(VolatileMemory::new());
        let config = StorageConfig::for_testing();
        let factory = config.build_driver_factory(memory.clone());
        assert!(factory.will_support(&config.volatile_key("x")));
        assert!(factory.will_support(&StorageKey::ram_disk("x")));
        assert!(!factory.will_support(&StorageKey::volatile("!other", "x")));

        let config = StorageConfig { enable_ram_disk: false, ..StorageConfig::for_testing() };
        assert!(!config.build_driver_factory(memory).will_support(&StorageKey::ram_disk("x")));
    }

    #[test]
    fn test_parser_reads_volatile_keys() {
        let config = StorageConfig::default();
        let key = config.key_parser().parse("volatile://!arc/thing").unwrap();
        assert_eq!(key, config.volatile_key("thing"));
    }
}
