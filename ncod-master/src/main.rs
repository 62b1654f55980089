/*!
NCOD master: fleet coordinator

Owns the authoritative node registry. Nodes speak to it over MQTT through
per-node session actors; operators use the HTTP surface to inspect the fleet
and claim or release devices. Silent nodes are demoted to Offline by the
sweeper, and the registry is persisted to a JSON file.
*/

mod auth;
mod commands;
mod config;
mod health;
mod http;
mod hub;
mod models;
mod notify;
mod placement;
mod registry;
mod session;
mod state;
mod store;
mod sweeper;

use crate::auth::AllowList;
use crate::commands::CommandIssuer;
use crate::config::load_config;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::hub::Hub;
use crate::notify::{Broadcast, LogNotifier, MqttNotifier, SharedNotifier};
use crate::registry::NodeRegistry;
use crate::session::SessionContext;
use crate::store::{run_flusher, JsonFileStore, RegistryStore, FLUSH_INTERVAL};
use crate::sweeper::run_sweeper;

use anyhow::{Context, Result};
use ncod_protocol::{MqttTransport, Role, Transport};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for shutdown signal: {e}");
            }
        }
        _ = cancel.cancelled() => {}
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ncod_master=info")))
        .init();

    let config = load_config().await;
    let registry = Arc::new(NodeRegistry::new(config.timing.liveness_window()));

    let store = JsonFileStore::new(config.data_file.clone());
    match store.load().await {
        Ok(records) => info!("Restored {} nodes from {}", registry.restore(records), config.data_file.display()),
        Err(e) => warn!("Failed to restore registry, starting empty: {e}"),
    }

    let transport = MqttTransport::new(&config.mqtt_settings(), Role::Master);
    let notifier: SharedNotifier = Arc::new(Broadcast(vec![
        Arc::new(LogNotifier) as SharedNotifier,
        Arc::new(MqttNotifier::new(transport.client())) as SharedNotifier,
    ]));
    let ctx = Arc::new(SessionContext {
        registry: registry.clone(),
        sink: transport.sink(),
        auth: Arc::new(AllowList::from_config(&config.allowed_nodes)),
        notifier: notifier.clone(),
    });
    let health = HealthTracker::new();

    let cancel = CancellationToken::new();
    let hub = tokio::spawn(
        Hub::new(transport, ctx.clone(), health.clone(), config.timing.reconnect()).run(cancel.clone()),
    );
    let sweeper = tokio::spawn(run_sweeper(
        registry.clone(),
        notifier,
        config.timing.sweep_interval,
        cancel.clone(),
    ));
    let flush_cancel = CancellationToken::new();
    let flusher = tokio::spawn(run_flusher(registry.clone(), store, FLUSH_INTERVAL, flush_cancel.clone()));

    let app = http::build_router(AppState {
        registry: registry.clone(),
        health,
        issuer: Arc::new(CommandIssuer::new(registry, ctx.sink.clone())),
        api_key: std::env::var("NCOD_API_KEY").ok().filter(|key| !key.is_empty()),
    });

    let listener = TcpListener::bind(&config.http.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.http.bind))?;
    info!("🚀 NCOD master listening on http://{}", config.http.bind);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await;

    // sessions drain before the final flush
    cancel.cancel();
    for task in [hub, sweeper] {
        if let Err(e) = task.await {
            warn!("Task failed during shutdown: {e}");
        }
    }
    flush_cancel.cancel();
    if let Err(e) = flusher.await {
        warn!("Final registry flush failed: {e}");
    }

    served.context("HTTP server failed")
}
