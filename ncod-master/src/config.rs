use ncod_protocol::{MqttSettings, TimingConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MasterConfig {
    pub mqtt: MqttConf,
    pub http: HttpConf,
    pub data_file: PathBuf,
    /// Node ids allowed to register; empty accepts every valid id
    pub allowed_nodes: Vec<String>,
    pub timing: TimingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "ncod-master".into(),
            keep_alive_secs: 15,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf::default(),
            http: HttpConf::default(),
            data_file: PathBuf::from("./data/nodes.json"),
            allowed_nodes: Vec::new(),
            timing: TimingConfig::default(),
        }
    }
}

impl MasterConfig {
    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            broker_host: self.mqtt.host.clone(),
            broker_port: self.mqtt.port,
            client_id: self.mqtt.client_id.clone(),
            keep_alive_secs: self.mqtt.keep_alive_secs,
        }
    }
}

/// Reads `NCOD_MASTER_CONFIG` (default `master.yaml`); never fails
pub async fn load_config() -> MasterConfig {
    let path = std::env::var("NCOD_MASTER_CONFIG").unwrap_or_else(|_| "master.yaml".into());
    load_config_from(Path::new(&path)).await
}

pub async fn load_config_from(path: &Path) -> MasterConfig {
    if !path.exists() {
        warn!(path = %path.display(), "No master config, using defaults");
        return MasterConfig::default();
    }

    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            warn!(path = %path.display(), "Cannot read master config: {e}, using defaults");
            return MasterConfig::default();
        }
    };
    if txt.trim().is_empty() {
        return MasterConfig::default();
    }

    match serde_yaml::from_str(&txt) {
        Ok(config) => {
            info!(path = %path.display(), "Loaded master config");
            config
        }
        Err(e) => {
            warn!(path = %path.display(), "Invalid master config: {e}, using defaults");
            MasterConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.yaml")).await;

        assert_eq!(config.http.bind, "0.0.0.0:8080");
        assert_eq!(config.data_file, PathBuf::from("./data/nodes.json"));
        assert!(config.allowed_nodes.is_empty());
    }

    #[tokio::test]
    async fn test_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.yaml");
        std::fs::write(
            &path,
            "mqtt:\n  host: broker.lan\nallowed_nodes:\n  - aa:bb:cc:dd:ee:ff\ntiming:\n  heartbeat_interval: 2\n",
        )
        .unwrap();

        let config = load_config_from(&path).await;
        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.allowed_nodes, vec!["aa:bb:cc:dd:ee:ff".to_string()]);
        assert_eq!(config.timing.liveness_window(), Duration::from_secs(6));
        assert_eq!(config.mqtt_settings().client_id, "ncod-master");
    }

    #[tokio::test]
    async fn test_invalid_yaml_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.yaml");
        std::fs::write(&path, "mqtt: [not, a, map").unwrap();

        let config = load_config_from(&path).await;
        assert_eq!(config.mqtt.host, "localhost");
    }

    #[tokio::test]
    async fn test_zero_interval_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.yaml");
        std::fs::write(&path, "mqtt:\n  host: broker.lan\ntiming:\n  sweep_interval: 0\n").unwrap();

        let config = load_config_from(&path).await;
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.timing.sweep_interval, Duration::from_secs(5));
    }
}
