//! Listener wiring and the `/status` endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use artifact_store::StoreManager;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use eyre::{bail, WrapErr};
use registry::{Registry, RegistryManager};
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct AppState {
    started: Instant,
    stores: Arc<StoreManager>,
    registries: Arc<RegistryManager>,
}

/// Builds the main router: `/status` plus the single unbound registry,
/// if any. Registries carrying their own `serviceBinding` are excluded
/// here and get dedicated listeners in [`serve`].
pub(crate) fn build_root_router(
    stores: Arc<StoreManager>,
    registries: Arc<RegistryManager>,
) -> eyre::Result<Router> {
    let mut unbound: Option<Arc<dyn Registry>> = None;
    for registry in registries.all() {
        if registry.binding().is_none() {
            if let Some(previous) = &unbound {
                bail!(
                    "registries {} and {} both lack a serviceBinding; only one registry may be mounted on the main server",
                    previous.alias(),
                    registry.alias(),
                );
            }
            unbound = Some(registry);
        }
    }

    let state = AppState {
        started: Instant::now(),
        stores,
        registries,
    };
    let mut router = Router::new().route("/status", get(status)).with_state(state);
    if let Some(registry) = unbound {
        tracing::info!(alias = registry.alias(), "mounting registry on main server");
        router = router.merge(registry.router());
    }
    Ok(router)
}

/// Serves the main router and one extra listener per bound registry.
/// All listeners shut down gracefully on ctrl-c.
pub(crate) async fn serve(
    cfg: &config::Config,
    stores: Arc<StoreManager>,
    registries: Arc<RegistryManager>,
) -> eyre::Result<()> {
    let server_cfg = cfg.sub("server");
    let port = server_cfg.get_int_or("port", 8080);
    // readTimeout doubles as the per-request timeout; writeTimeout and
    // idleTimeout are surfaced in the startup log only.
    let request_timeout = Duration::from_secs(server_cfg.get_int_or("readTimeout", 15) as u64);
    tracing::debug!(
        read = server_cfg.get_int_or("readTimeout", 15),
        write = server_cfg.get_int_or("writeTimeout", 15),
        idle = server_cfg.get_int_or("idleTimeout", 60),
        "server timeouts configured"
    );

    let mut listeners = Vec::new();
    for registry in registries.all() {
        let Some(binding) = registry.binding().cloned() else {
            continue;
        };
        let router = registry
            .router()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(request_timeout));
        let listener = TcpListener::bind((binding.ip.as_str(), binding.port))
            .await
            .wrap_err_with(|| format!("binding registry {} to {binding}", registry.alias()))?;
        tracing::info!(alias = registry.alias(), %binding, "registry listening");
        listeners.push(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await
        }));
    }

    let router = build_root_router(stores, registries)?
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout));
    let listener = TcpListener::bind(("0.0.0.0", port as u16))
        .await
        .wrap_err_with(|| format!("binding main server to port {port}"))?;
    tracing::info!(port, "server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in listeners {
        task.await??;
    }
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("failed to listen for shutdown signal");
    } else {
        tracing::info!("shutting down");
    }
}

/// GET /status: uptime and the configured aliases.
async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let registries: Vec<serde_json::Value> = state
        .registries
        .all()
        .iter()
        .map(|registry| {
            serde_json::json!({
                "alias": registry.alias(),
                "class": registry.class_name(),
                "storageAlias": registry.storage_alias(),
                "binding": registry.binding().map(|b| b.to_string()),
            })
        })
        .collect();

    Json(serde_json::json!({
        "status": "ok",
        "uptimeSeconds": state.started.elapsed().as_secs(),
        "storages": state.stores.aliases(),
        "registries": registries,
    }))
}
