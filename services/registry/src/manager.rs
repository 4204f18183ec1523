//! Registry manager: named registry instances resolved by DNS-label
//! alias, built by class-keyed factories that resolve their storage
//! dependency by alias at construction time.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use artifact_store::StoreManager;

use crate::proxy::UpstreamConfig;
use crate::{PrivateRegistry, ProxyRegistry, RegistryError, RegistryResult};

/// Address a registry is served on when it gets its own listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBinding {
    pub ip: String,
    pub port: u16,
}

impl fmt::Display for ServiceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    Private,
    Proxy,
    /// Reserved: a private store combined with ordered proxy fallbacks.
    Compound,
}

/// Common surface of all registry flavours.
pub trait Registry: Send + Sync {
    fn alias(&self) -> &str;
    fn kind(&self) -> RegistryKind;
    fn class_name(&self) -> &'static str;
    fn storage_alias(&self) -> &str;
    fn binding(&self) -> Option<&ServiceBinding>;
    /// The axum router serving this registry's `/v2` surface.
    fn router(&self) -> axum::Router;
}

impl Registry for PrivateRegistry {
    fn alias(&self) -> &str {
        PrivateRegistry::alias(self)
    }

    fn kind(&self) -> RegistryKind {
        RegistryKind::Private
    }

    fn class_name(&self) -> &'static str {
        "docker.registry.private"
    }

    fn storage_alias(&self) -> &str {
        PrivateRegistry::storage_alias(self)
    }

    fn binding(&self) -> Option<&ServiceBinding> {
        PrivateRegistry::binding(self)
    }

    fn router(&self) -> axum::Router {
        PrivateRegistry::router(self)
    }
}

impl Registry for ProxyRegistry {
    fn alias(&self) -> &str {
        ProxyRegistry::alias(self)
    }

    fn kind(&self) -> RegistryKind {
        RegistryKind::Proxy
    }

    fn class_name(&self) -> &'static str {
        "docker.registry"
    }

    fn storage_alias(&self) -> &str {
        ProxyRegistry::storage_alias(self)
    }

    fn binding(&self) -> Option<&ServiceBinding> {
        ProxyRegistry::binding(self)
    }

    fn router(&self) -> axum::Router {
        ProxyRegistry::router(self)
    }
}

/// Construction parameters for the built-in registry classes.
#[derive(Debug, Clone, Default)]
pub struct RegistryParams {
    pub storage_alias: String,
    pub description: Option<String>,
    pub upstream: Option<UpstreamConfig>,
    pub cache_ttl: Option<Duration>,
}

type RegistryFactory = Box<
    dyn Fn(
            &str,
            Option<ServiceBinding>,
            &RegistryParams,
            &StoreManager,
        ) -> RegistryResult<Arc<dyn Registry>>
        + Send
        + Sync,
>;

pub struct RegistryManager {
    registries: RwLock<HashMap<String, Arc<dyn Registry>>>,
    factories: RwLock<HashMap<String, RegistryFactory>>,
}

impl Default for RegistryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RegistryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryManager")
            .field("registries", &self.aliases())
            .finish()
    }
}

impl RegistryManager {
    /// Creates a manager with the built-in registry factories registered.
    pub fn new() -> Self {
        let manager = Self {
            registries: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
        };

        manager.register_factory("docker.registry.private", |alias, binding, params, stores| {
            let storage = stores.get(&params.storage_alias)?;
            let registry: Arc<dyn Registry> = Arc::new(PrivateRegistry::new(
                alias,
                params.storage_alias.clone(),
                storage,
                binding,
                params.description.clone().unwrap_or_default(),
            ));
            Ok(registry)
        });

        manager.register_factory("docker.registry", |alias, binding, params, stores| {
            let upstream = params.upstream.as_ref().ok_or_else(|| {
                RegistryError::InvalidConfig(format!("registry {alias}: upstream is required"))
            })?;
            let storage = stores.get(&params.storage_alias)?;
            let registry: Arc<dyn Registry> = Arc::new(ProxyRegistry::new(
                alias,
                params.storage_alias.clone(),
                storage,
                upstream,
                params.cache_ttl,
                binding,
            )?);
            Ok(registry)
        });

        manager
    }

    /// Registers (or replaces) a factory for a registry class.
    pub fn register_factory<F>(&self, class: &str, factory: F)
    where
        F: Fn(
                &str,
                Option<ServiceBinding>,
                &RegistryParams,
                &StoreManager,
            ) -> RegistryResult<Arc<dyn Registry>>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .write()
            .expect("factory registry poisoned")
            .insert(class.to_string(), Box::new(factory));
    }

    /// Builds and registers a registry under `alias`, resolving its
    /// storage dependency from `stores`.
    pub fn create(
        &self,
        class: &str,
        alias: &str,
        binding: Option<ServiceBinding>,
        params: &RegistryParams,
        stores: &StoreManager,
    ) -> RegistryResult<Arc<dyn Registry>> {
        if !is_valid_dns_name(alias) {
            return Err(RegistryError::InvalidAlias(alias.to_string()));
        }
        if params.storage_alias.is_empty() {
            return Err(RegistryError::InvalidConfig(format!(
                "registry {alias}: storageAlias is required"
            )));
        }

        let factories = self.factories.read().expect("factory registry poisoned");
        let factory = factories
            .get(class)
            .ok_or_else(|| RegistryError::UnknownClass(class.to_string()))?;

        let mut registries = self.registries.write().expect("registry map poisoned");
        if registries.contains_key(alias) {
            return Err(RegistryError::AliasExists(alias.to_string()));
        }

        let registry = factory(alias, binding, params, stores)?;
        registries.insert(alias.to_string(), registry.clone());
        tracing::info!(alias, class, storage = %params.storage_alias, "registered registry");
        Ok(registry)
    }

    /// Looks up a registry by alias.
    pub fn get(&self, alias: &str) -> RegistryResult<Arc<dyn Registry>> {
        self.registries
            .read()
            .expect("registry map poisoned")
            .get(alias)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownAlias(alias.to_string()))
    }

    /// All registered registries, sorted by alias.
    pub fn all(&self) -> Vec<Arc<dyn Registry>> {
        let mut all: Vec<_> = self
            .registries
            .read()
            .expect("registry map poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.alias().cmp(b.alias()));
        all
    }

    /// Registered aliases, sorted.
    pub fn aliases(&self) -> Vec<String> {
        self.all().iter().map(|r| r.alias().to_string()).collect()
    }

    /// Builds every registry declared under the `registries.<alias>`
    /// tree.
    pub fn load_from_config(
        &self,
        cfg: &config::Config,
        stores: &StoreManager,
    ) -> RegistryResult<()> {
        let registries = cfg.sub("registries");
        for alias in registries.keys() {
            let registry = registries.sub(&alias);
            let class = registry.get_str("class").ok_or_else(|| {
                RegistryError::InvalidConfig(format!("registry {alias}: class is required"))
            })?;

            let binding = if registry.exists("serviceBinding") {
                let binding = registry.sub("serviceBinding");
                let ip = binding.get_str_or("ip", "0.0.0.0");
                let port = binding.get_int("port").ok_or_else(|| {
                    RegistryError::InvalidConfig(format!(
                        "registry {alias}: serviceBinding.port is required"
                    ))
                })?;
                Some(ServiceBinding {
                    ip,
                    port: u16::try_from(port).map_err(|_| {
                        RegistryError::InvalidConfig(format!(
                            "registry {alias}: serviceBinding.port out of range: {port}"
                        ))
                    })?,
                })
            } else {
                None
            };

            let params_cfg = registry.sub("params");
            let upstream = if params_cfg.exists("upstream") {
                let upstream = params_cfg.sub("upstream");
                let url = upstream.get_str("url").ok_or_else(|| {
                    RegistryError::InvalidConfig(format!(
                        "registry {alias}: upstream.url is required"
                    ))
                })?;
                Some(UpstreamConfig {
                    url,
                    username: upstream.get_str("username"),
                    password: upstream.get_str("password"),
                    ttl: ttl_seconds(&upstream, "ttl", &alias)?,
                })
            } else {
                None
            };

            let params = RegistryParams {
                storage_alias: params_cfg.get_str_or("storageAlias", ""),
                description: params_cfg.get_str("description"),
                upstream,
                cache_ttl: ttl_seconds(&params_cfg, "cacheTTL", &alias)?,
            };

            self.create(&class, &alias, binding, &params, stores)?;
        }
        Ok(())
    }
}

/// TTLs are configured as integer seconds (`604800`) or duration strings
/// (`168h`).
fn ttl_seconds(
    cfg: &config::Config,
    key: &str,
    alias: &str,
) -> RegistryResult<Option<Duration>> {
    if !cfg.exists(key) {
        return Ok(None);
    }
    if let Some(seconds) = cfg.get_int(key) {
        if seconds <= 0 {
            return Ok(None);
        }
        return Ok(Some(Duration::from_secs(seconds as u64)));
    }
    match cfg.get_duration(key) {
        Ok(ttl) => Ok(ttl),
        Err(err) => Err(RegistryError::InvalidConfig(format!(
            "registry {alias}: invalid {key}: {err}"
        ))),
    }
}

/// RFC-1123 DNS name validation, the same rules the storage manager
/// applies to its aliases.
fn is_valid_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        let bytes = label.as_bytes();
        let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
        alnum(bytes[0])
            && alnum(bytes[bytes.len() - 1])
            && bytes.iter().all(|&b| alnum(b) || b == b'-')
    })
}

#[cfg(test)]
mod tests {
    use artifact_store::StoreParams;
    use camino::Utf8Path;

    use super::*;

    fn store_manager(dir: &Utf8Path) -> StoreManager {
        let stores = StoreManager::new();
        stores
            .create(
                "std.filestorage",
                "main",
                &StoreParams {
                    base_dir: Some(dir.join("data")),
                    ..Default::default()
                },
            )
            .unwrap();
        stores
    }

    fn tempdir() -> (tempfile::TempDir, camino::Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, path)
    }

    #[tokio::test]
    async fn creates_private_registry_resolving_storage() {
        let (_guard, dir) = tempdir();
        let stores = store_manager(&dir);
        let manager = RegistryManager::new();

        let registry = manager
            .create(
                "docker.registry.private",
                "internal",
                None,
                &RegistryParams {
                    storage_alias: "main".into(),
                    ..Default::default()
                },
                &stores,
            )
            .unwrap();
        assert_eq!(registry.alias(), "internal");
        assert_eq!(registry.kind(), RegistryKind::Private);
        assert_eq!(registry.storage_alias(), "main");
        assert!(manager.get("internal").is_ok());
    }

    #[tokio::test]
    async fn proxy_requires_upstream() {
        let (_guard, dir) = tempdir();
        let stores = store_manager(&dir);
        let manager = RegistryManager::new();

        let err = match manager.create(
            "docker.registry",
            "hub",
            None,
            &RegistryParams {
                storage_alias: "main".into(),
                ..Default::default()
            },
            &stores,
        ) {
            Err(err) => err,
            Ok(_) => panic!("expected proxy registry without upstream to fail"),
        };
        assert!(matches!(err, RegistryError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn alias_and_class_validation() {
        let (_guard, dir) = tempdir();
        let stores = store_manager(&dir);
        let manager = RegistryManager::new();
        let params = RegistryParams {
            storage_alias: "main".into(),
            ..Default::default()
        };

        assert!(matches!(
            manager.create("docker.registry.private", "Bad-", None, &params, &stores),
            Err(RegistryError::InvalidAlias(_))
        ));
        assert!(matches!(
            manager.create("no.such.class", "fine", None, &params, &stores),
            Err(RegistryError::UnknownClass(_))
        ));

        manager
            .create("docker.registry.private", "fine", None, &params, &stores)
            .unwrap();
        assert!(matches!(
            manager.create("docker.registry.private", "fine", None, &params, &stores),
            Err(RegistryError::AliasExists(_))
        ));

        // Unknown storage alias fails at construction.
        let missing = RegistryParams {
            storage_alias: "absent".into(),
            ..Default::default()
        };
        assert!(manager
            .create("docker.registry.private", "other", None, &missing, &stores)
            .is_err());
    }

    #[tokio::test]
    async fn load_from_config_builds_both_kinds() {
        let (_guard, dir) = tempdir();
        let configs = dir.join("configs");
        std::fs::create_dir_all(&configs).unwrap();
        std::fs::write(
            configs.join("application.yaml"),
            format!(
                concat!(
                    "storages:\n",
                    "  cache:\n",
                    "    class: std.filestorage\n",
                    "    params:\n",
                    "      basePath: {base}\n",
                    "registries:\n",
                    "  internal:\n",
                    "    class: docker.registry.private\n",
                    "    params:\n",
                    "      storageAlias: cache\n",
                    "      description: team registry\n",
                    "    serviceBinding:\n",
                    "      ip: 127.0.0.1\n",
                    "      port: 5001\n",
                    "  hub:\n",
                    "    class: docker.registry\n",
                    "    params:\n",
                    "      storageAlias: cache\n",
                    "      cacheTTL: 3600\n",
                    "      upstream:\n",
                    "        url: https://registry-1.docker.io\n",
                    "        username: bot\n",
                    "        password: hunter2\n",
                ),
                base = dir.join("data"),
            ),
        )
        .unwrap();
        let cfg = config::Config::from_sources(&configs, &[], None, std::iter::empty()).unwrap();

        let stores = StoreManager::new();
        stores.load_from_config(&cfg).unwrap();
        let manager = RegistryManager::new();
        manager.load_from_config(&cfg, &stores).unwrap();

        assert_eq!(manager.aliases(), vec!["hub", "internal"]);
        let internal = manager.get("internal").unwrap();
        assert_eq!(
            internal.binding(),
            Some(&ServiceBinding {
                ip: "127.0.0.1".into(),
                port: 5001,
            })
        );
        assert_eq!(internal.binding().unwrap().to_string(), "127.0.0.1:5001");

        let hub = manager.get("hub").unwrap();
        assert_eq!(hub.kind(), RegistryKind::Proxy);
        assert_eq!(hub.class_name(), "docker.registry");
    }

    #[test]
    fn ttl_parsing_accepts_seconds_and_duration_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(
            path.join("application.yaml"),
            "a:\n  ttl: 3600\nb:\n  ttl: 2h\nc:\n  ttl: 0\n",
        )
        .unwrap();
        let cfg = config::Config::from_sources(path, &[], None, std::iter::empty()).unwrap();

        assert_eq!(
            ttl_seconds(&cfg.sub("a"), "ttl", "a").unwrap(),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(
            ttl_seconds(&cfg.sub("b"), "ttl", "b").unwrap(),
            Some(Duration::from_secs(7200))
        );
        assert_eq!(ttl_seconds(&cfg.sub("c"), "ttl", "c").unwrap(), None);
        assert_eq!(ttl_seconds(&cfg.sub("d"), "ttl", "d").unwrap(), None);
    }
}
