mod api;
mod auth;
mod config;
mod routes_log;
mod routes_map;
mod service_exec;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use vds::{BatchMutator, InMemoryStorage, InstantMutator, LocalService, Mutator};

use crate::auth::StaticOracle;
use crate::config::{AppConfig, MutatorKind};
use crate::state::{AppState, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env()?;

    let storage = Arc::new(InMemoryStorage::new());
    let mutator: Arc<dyn Mutator> = match cfg.mutator {
        MutatorKind::Instant => Arc::new(InstantMutator::new(storage.clone())),
        MutatorKind::Batch => Arc::new(BatchMutator::spawn(storage.clone(), cfg.batch.clone())),
    };
    info!(mutator = ?cfg.mutator, "storage: in-memory");

    let oracle = StaticOracle::parse(&cfg.api_keys).context("Failed to parse VDS_API_KEYS")?;
    if oracle.is_open() {
        warn!("auth: no API keys configured, all requests are allowed");
    }

    let service = LocalService::new(storage, mutator);
    let app_state: SharedState = Arc::new(AppState::new(service.clone(), Arc::new(oracle)));

    let app = router(app_state);

    let addr = &cfg.bind_addr;
    info!("vds-server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // apply whatever is still queued before exiting
    service.mutator().flush().await.context("Failed to flush mutator")?;
    info!("vds-server stopped");

    Ok(())
}

fn router(app_state: SharedState) -> Router {
    Router::new()
        .route("/v1/log/:name/entry", post(routes_log::post_entry))
        .route("/v1/log/:name/tree/:size", get(routes_log::get_tree))
        .route(
            "/v1/log/:name/tree/:size/inclusion/index/:index",
            get(routes_log::get_inclusion_by_index),
        )
        .route(
            "/v1/log/:name/tree/:size/inclusion/hash/:leaf_hash",
            get(routes_log::get_inclusion_by_hash),
        )
        .route("/v1/log/:name/tree/:size/consistency/:from", get(routes_log::get_consistency))
        .route("/v1/log/:name/entries/:first/:last", get(routes_log::get_entries))
        .route(
            "/v1/map/:name/key/:hex_key",
            put(routes_map::put_value).delete(routes_map::delete_value),
        )
        .route("/v1/map/:name/tree/:size", get(routes_map::get_tree))
        .route("/v1/map/:name/tree/:size/key/:hex_key", get(routes_map::get_value))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
