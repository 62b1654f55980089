//! NCOD Slave - shares locally attached USB devices with the fleet
//!
//! This agent exposes the devices behind the local VirtualHere server:
//! - Node identity from the primary network hardware address
//! - Registration and heartbeats over MQTT
//! - Periodic device discovery and reconciliation
//! - Claim/release commands from the master
//! - Load reports for placement decisions

mod agent;
mod channel;
mod commands;
mod config;
mod devices;
mod identity;
mod metrics;
mod runtime;
mod session;

use agent::VirtualHereCli;
use anyhow::{Context, Result};
use config::SlaveConfig;
use identity::SystemInfo;
use ncod_protocol::{MqttTransport, RegisterPayload, Role};
use runtime::SlaveRuntime;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Identity errors are retried on the reconnect schedule
async fn discover_identity(config: &SlaveConfig) -> SystemInfo {
    let backoff = config.timing.reconnect();
    let mut retry = 0;

    loop {
        match SystemInfo::discover() {
            Ok(info) => return info,
            Err(e) => {
                let delay = backoff.delay(retry);
                error!("Cannot establish node identity: {e}, retrying in {delay:?}");
                retry += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn registration(info: &SystemInfo, config: &SlaveConfig) -> RegisterPayload {
    let mut metadata = config.node.metadata.clone();
    metadata.entry("os".into()).or_insert_with(|| info.os.clone());
    metadata
        .entry("architecture".into())
        .or_insert_with(|| info.architecture.clone());

    RegisterPayload {
        hostname: info.hostname.clone(),
        address: config
            .agent
            .advertise_address
            .clone()
            .unwrap_or_else(|| info.address.clone()),
        port: config.agent.server_port,
        metadata,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ncod_slave=info")))
        .init();

    info!("🤖 NCOD Slave starting...");

    let config = SlaveConfig::load().await.context("Failed to load slave configuration")?;
    let system = discover_identity(&config).await;

    let transport = MqttTransport::new(&config.mqtt_settings(&system.node_id), Role::Node(system.node_id.clone()));
    let agent = VirtualHereCli::new(config.agent.client_path.clone(), config.timing.command_timeout);

    let runtime = SlaveRuntime::start(
        transport,
        agent,
        system.node_id.clone(),
        registration(&system, &config),
        &config,
    )
    .context("Failed to start slave runtime")?;

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    let known = runtime.devices().lock().await.reports().len();
    info!(devices = known, "Shutdown requested");
    runtime.shutdown().await;
    Ok(())
}
