/*!
Registry persistence

The store keeps the latest node and device records. The registry is flushed
periodically and once more on shutdown, after the node sessions are drained.
*/

use crate::models::NodeRecord;
use crate::registry::SharedRegistry;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid store contents: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait RegistryStore: Send + Sync + 'static {
    fn load(&self) -> impl Future<Output = Result<Vec<NodeRecord>, StoreError>> + Send;

    fn save(&self, records: Vec<NodeRecord>) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Pretty JSON file, replaced atomically on every save
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RegistryStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<NodeRecord>, StoreError> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "No registry file, starting fresh");
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, records: Vec<NodeRecord>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(&records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

async fn flush<S: RegistryStore>(registry: &SharedRegistry, store: &S) {
    let records = registry.nodes();
    let count = records.len();
    match store.save(records).await {
        Ok(()) => debug!(nodes = count, "Registry flushed"),
        Err(e) => error!("Failed to persist registry: {e}"),
    }
}

pub async fn run_flusher<S: RegistryStore>(
    registry: SharedRegistry,
    store: S,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => flush(&registry, &store).await,
        }
    }
    flush(&registry, &store).await;
    info!("Registry state saved");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeStatus;
    use crate::registry::{DeviceDelta, NodeRegistry};
    use chrono::Utc;
    use ncod_protocol::{DeviceKey, DeviceReport, DeviceStatus, NodeId, RegisterPayload};
    use std::sync::Arc;
    use time::OffsetDateTime;

    fn populated() -> (SharedRegistry, NodeId) {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(15)));
        let id = NodeId::parse("aa:bb:cc:dd:ee:ff").unwrap();
        let registration = RegisterPayload {
            hostname: "bench".into(),
            address: "10.0.0.7".into(),
            port: 7575,
            metadata: [("rack".to_string(), "a".to_string())].into_iter().collect(),
            version: "0.1.0".into(),
        };
        registry.upsert_node(&id, &registration, OffsetDateTime::now_utc());
        registry.open_session(&id, "t1", OffsetDateTime::now_utc()).unwrap();
        registry
            .apply_device_delta(
                &id,
                DeviceDelta::snapshot(vec![DeviceReport {
                    device_id: DeviceKey::serial("0781", "5567", "AAA"),
                    address: "1-2".into(),
                    name: "SanDisk Cruzer Blade".into(),
                    status: DeviceStatus::InUse,
                    claimed_by: Some("u1".into()),
                    last_seen: Utc::now(),
                }]),
            )
            .unwrap();
        (registry, id)
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nodes.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonFileStore::new(path);
        assert!(matches!(store.load().await, Err(StoreError::Json(_))));
    }

    #[tokio::test]
    async fn test_restart_restores_nodes_as_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("data").join("nodes.json"));
        let (registry, id) = populated();
        store.save(registry.nodes()).await.unwrap();

        let restarted = NodeRegistry::new(Duration::from_secs(15));
        restarted.restore(store.load().await.unwrap());

        let record = restarted.node(&id).unwrap();
        assert_eq!(record.node.status, NodeStatus::Unknown);
        assert_eq!(record.node.metadata.get("rack").map(String::as_str), Some("a"));
        assert_eq!(record.devices[0].claimed_by.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_flusher_saves_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        let (registry, id) = populated();

        let cancel = CancellationToken::new();
        let flusher = tokio::spawn(run_flusher(
            registry,
            JsonFileStore::new(path.clone()),
            Duration::from_secs(3600),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!path.exists());

        cancel.cancel();
        flusher.await.unwrap();

        let saved = JsonFileStore::new(path).load().await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].node.node_id, id);
    }
}
