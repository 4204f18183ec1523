//! Storage registry: named store instances resolved by DNS-label alias.
//!
//! Factories are keyed by class name (`std.filestorage`,
//! `concurrent.filestorage`, `hashcomputing.filestorage`) and build the
//! decorator stacks from [`StoreParams`]. The manager is an ordinary
//! value, owned by the boot layer and injected where needed; registration
//! is write-locked and rare, lookups are read-locked.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::{ArtifactStore, ConcurrentStore, HashComputingStore, SimpleFileStore, StoreError};

/// Construction parameters for the built-in storage classes.
#[derive(Debug, Clone, Default)]
pub struct StoreParams {
    pub base_dir: Option<Utf8PathBuf>,
    pub lock_dir: Option<Utf8PathBuf>,
    pub lock_timeout: Option<Duration>,
}

impl StoreParams {
    fn base_dir(&self, alias: &str) -> Result<Utf8PathBuf, StoreError> {
        self.base_dir
            .clone()
            .ok_or_else(|| StoreError::InvalidConfig(format!("storage {alias}: basePath/baseDir is required")))
    }

    fn locking(&self, alias: &str) -> Result<(Utf8PathBuf, Duration), StoreError> {
        let lock_dir = self.lock_dir.clone().ok_or_else(|| {
            StoreError::InvalidConfig(format!("storage {alias}: lockDir is required"))
        })?;
        let timeout = self.lock_timeout.ok_or_else(|| {
            StoreError::InvalidConfig(format!("storage {alias}: lockTimeout is required"))
        })?;
        Ok((lock_dir, timeout))
    }
}

type StoreFactory =
    Box<dyn Fn(&str, &StoreParams) -> Result<Arc<dyn ArtifactStore>, StoreError> + Send + Sync>;

pub struct StoreManager {
    stores: RwLock<HashMap<String, Arc<dyn ArtifactStore>>>,
    factories: RwLock<HashMap<String, StoreFactory>>,
}

impl Default for StoreManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let aliases: Vec<String> = self.aliases();
        f.debug_struct("StoreManager").field("stores", &aliases).finish()
    }
}

impl StoreManager {
    /// Creates a manager with the built-in file storage factories
    /// registered.
    pub fn new() -> Self {
        let manager = Self {
            stores: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
        };

        manager.register_factory("std.filestorage", |alias, params| {
            let store: Arc<dyn ArtifactStore> =
                Arc::new(SimpleFileStore::new(alias, params.base_dir(alias)?)?);
            Ok(store)
        });

        manager.register_factory("concurrent.filestorage", |alias, params| {
            let (lock_dir, timeout) = params.locking(alias)?;
            let store = SimpleFileStore::new(alias, params.base_dir(alias)?)?;
            let store: Arc<dyn ArtifactStore> =
                Arc::new(ConcurrentStore::new(store, lock_dir, timeout)?);
            Ok(store)
        });

        manager.register_factory("hashcomputing.filestorage", |alias, params| {
            // With locking parameters the full production stack is built;
            // without them the hash-computing layer sits directly on the
            // simple store.
            let store = SimpleFileStore::new(alias, params.base_dir(alias)?)?;
            let store: Arc<dyn ArtifactStore> =
                if params.lock_dir.is_some() || params.lock_timeout.is_some() {
                    let (lock_dir, timeout) = params.locking(alias)?;
                    Arc::new(HashComputingStore::new(ConcurrentStore::new(
                        store, lock_dir, timeout,
                    )?))
                } else {
                    Arc::new(HashComputingStore::new(store))
                };
            Ok(store)
        });

        manager
    }

    /// Registers (or replaces) a factory for a storage class.
    pub fn register_factory<F>(&self, class: &str, factory: F)
    where
        F: Fn(&str, &StoreParams) -> Result<Arc<dyn ArtifactStore>, StoreError>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .write()
            .expect("factory registry poisoned")
            .insert(class.to_string(), Box::new(factory));
    }

    /// Builds and registers a store under `alias`.
    pub fn create(
        &self,
        class: &str,
        alias: &str,
        params: &StoreParams,
    ) -> Result<Arc<dyn ArtifactStore>, StoreError> {
        if !is_valid_dns_name(alias) {
            return Err(StoreError::InvalidAlias(alias.to_string()));
        }

        let factories = self.factories.read().expect("factory registry poisoned");
        let factory = factories
            .get(class)
            .ok_or_else(|| StoreError::UnknownClass(class.to_string()))?;

        let mut stores = self.stores.write().expect("store registry poisoned");
        if stores.contains_key(alias) {
            return Err(StoreError::AliasExists(alias.to_string()));
        }

        let store = factory(alias, params)?;
        stores.insert(alias.to_string(), store.clone());
        tracing::info!(alias, class, "registered storage");
        Ok(store)
    }

    /// Looks up a store by alias.
    pub fn get(&self, alias: &str) -> Result<Arc<dyn ArtifactStore>, StoreError> {
        self.stores
            .read()
            .expect("store registry poisoned")
            .get(alias)
            .cloned()
            .ok_or_else(|| StoreError::UnknownAlias(alias.to_string()))
    }

    /// Registered aliases, sorted.
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self
            .stores
            .read()
            .expect("store registry poisoned")
            .keys()
            .cloned()
            .collect();
        aliases.sort();
        aliases
    }

    /// Builds every store declared under the `storages.<alias>` tree.
    pub fn load_from_config(&self, cfg: &config::Config) -> Result<(), StoreError> {
        let storages = cfg.sub("storages");
        for alias in storages.keys() {
            let storage = storages.sub(&alias);
            let class = storage.get_str("class").ok_or_else(|| {
                StoreError::InvalidConfig(format!("storage {alias}: class is required"))
            })?;

            let params_cfg = storage.sub("params");
            let base_dir = params_cfg
                .get_str("basePath")
                .or_else(|| params_cfg.get_str("baseDir"))
                .map(Utf8PathBuf::from);
            let lock_dir = params_cfg.get_str("lockDir").map(Utf8PathBuf::from);
            let lock_timeout = params_cfg.get_duration("lockTimeout").map_err(|err| {
                StoreError::InvalidConfig(format!("storage {alias}: invalid lockTimeout: {err}"))
            })?;

            let params = StoreParams {
                base_dir,
                lock_dir,
                lock_timeout,
            };
            self.create(&class, &alias, &params)?;
        }
        Ok(())
    }
}

/// RFC-1123 DNS name validation: lowercase alphanumeric labels with
/// interior hyphens, 1-63 characters per label, 253 total, dot separated.
pub(crate) fn is_valid_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(is_valid_dns_label)
}

fn is_valid_dns_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    let bytes = label.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes.iter().all(|&b| alnum(b) || b == b'-')
}
