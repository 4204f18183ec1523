//! Binary repository manager server.
//!
//! Boot sequence: load the configuration tree, initialise logging, build
//! the storage and registry managers from it, then serve. Registries
//! with a `serviceBinding` get their own listener; at most one registry
//! without a binding is mounted on the main server next to `/status`.

use std::sync::Arc;

use artifact_store::StoreManager;
use registry::RegistryManager;
use tracing_subscriber::EnvFilter;

mod server;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cfg = config::Config::load()?;

    let level = cfg.log_level().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let stores = Arc::new(StoreManager::new());
    stores.load_from_config(&cfg)?;
    tracing::info!(storages = ?stores.aliases(), "storages configured");

    let registries = Arc::new(RegistryManager::new());
    registries.load_from_config(&cfg, &stores)?;
    tracing::info!(registries = ?registries.aliases(), "registries configured");

    server::serve(&cfg, stores, registries).await
}
