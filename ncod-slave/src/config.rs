//! Slave configuration
//!
//! Handles:
//! - MQTT broker settings
//! - VirtualHere agent invocation (client binary, server port, serial lookup)
//! - Free-form node metadata sent with every registration
//! - Protocol timing
//!
//! Stored as TOML at `$NCOD_SLAVE_CONFIG`, or in the OS config directory.

use anyhow::{Context, Result};
use ncod_protocol::{MqttSettings, NodeId, TimingConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveConfig {
    pub mqtt: MqttConfig,
    pub agent: AgentSettings,
    pub node: NodeSettings,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    /// Derived from the node id when unset
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub client_path: String,
    pub server_port: u16,
    /// Ask the agent for serial numbers so identical devices stay distinct
    pub resolve_serials: bool,
    /// Used for `USE` when a connect command carries no password of its own
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Address advertised to the master; the primary interface's IP otherwise
    pub advertise_address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub metadata: HashMap<String, String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            client_id: None,
            keep_alive_secs: 30,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            client_path: "vhclientx86_64".to_string(),
            server_port: 7575,
            resolve_serials: true,
            password: None,
            advertise_address: None,
        }
    }
}

impl SlaveConfig {
    /// Load config from `$NCOD_SLAVE_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let path = match std::env::var("NCOD_SLAVE_CONFIG") {
            Ok(path) => PathBuf::from(path),
            Err(_) => Self::config_file_path()?,
        };
        Self::load_from(&path).await
    }

    /// Missing file means first start: defaults apply
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: SlaveConfig =
            toml::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))?;

        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("ncod-slave");
        path.push("config.toml");
        Ok(path)
    }

    pub fn mqtt_settings(&self, node_id: &NodeId) -> MqttSettings {
        let client_id = self
            .mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("ncod-slave-{}", node_id.as_str().replace(':', "")));

        MqttSettings {
            broker_host: self.mqtt.broker_host.clone(),
            broker_port: self.mqtt.broker_port,
            client_id,
            keep_alive_secs: self.mqtt.keep_alive_secs,
        }
    }
}
