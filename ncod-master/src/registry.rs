/*!
Node registry: the master's authoritative view of the fleet

The outer map is only write-locked to insert a node; every node entry has its
own lock, so registrations and heartbeats from different nodes never contend.
Nodes are never removed: silence demotes them to `Offline`.
*/

use crate::models::{Device, Node, NodeRecord, NodeStatus};
use crate::state::{new_state, Shared};
use ncod_protocol::{DeviceKey, DeviceReport, DeviceStatus, LoadReport, NodeId, RegisterPayload};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("node {0} is not registered")]
    UnknownNode(NodeId),
}

/// Device reports received from one node
#[derive(Debug, Clone, Default)]
pub struct DeviceDelta {
    pub reports: Vec<DeviceReport>,
    /// The reports are the node's whole table: anything missing is Offline
    pub complete: bool,
}

impl DeviceDelta {
    pub fn snapshot(reports: Vec<DeviceReport>) -> Self {
        Self { reports, complete: true }
    }

    pub fn single(report: DeviceReport) -> Self {
        Self {
            reports: vec![report],
            complete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceChange {
    pub device: Device,
    pub previous: Option<DeviceStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Updated,
}

/// What a command issuer needs to know about its target
#[derive(Debug, Clone)]
pub struct CommandTarget {
    pub status: NodeStatus,
    pub device: Option<Device>,
    pub session: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrySummary {
    pub nodes: usize,
    pub online: usize,
    pub devices: usize,
}

struct NodeEntry {
    node: Node,
    devices: BTreeMap<DeviceKey, Device>,
    load: Option<LoadReport>,
    session: Option<String>,
}

impl NodeEntry {
    fn new(node_id: &NodeId, now: OffsetDateTime) -> Self {
        Self {
            node: Node {
                node_id: node_id.clone(),
                hostname: String::new(),
                address: String::new(),
                port: 0,
                status: NodeStatus::Unknown,
                metadata: HashMap::new(),
                version: None,
                registered_at: now,
                last_seen: now,
            },
            devices: BTreeMap::new(),
            load: None,
            session: None,
        }
    }

    fn record(&self) -> NodeRecord {
        NodeRecord {
            node: self.node.clone(),
            devices: self.devices.values().cloned().collect(),
            load: self.load.clone(),
        }
    }
}

pub type SharedRegistry = Arc<NodeRegistry>;

pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Shared<NodeEntry>>>,
    liveness_window: time::Duration,
}

impl NodeRegistry {
    pub fn new(liveness_window: std::time::Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            liveness_window: time::Duration::try_from(liveness_window).unwrap_or(time::Duration::seconds(15)),
        }
    }

    fn entry(&self, node_id: &NodeId) -> Option<Shared<NodeEntry>> {
        self.nodes.read().get(node_id).cloned()
    }

    fn entry_or_insert(&self, node_id: &NodeId, now: OffsetDateTime) -> (Shared<NodeEntry>, Upsert) {
        if let Some(entry) = self.entry(node_id) {
            return (entry, Upsert::Updated);
        }
        let mut nodes = self.nodes.write();
        match nodes.get(node_id) {
            Some(entry) => (entry.clone(), Upsert::Updated),
            None => {
                let entry = new_state(NodeEntry::new(node_id, now));
                nodes.insert(node_id.clone(), entry.clone());
                (entry, Upsert::Created)
            }
        }
    }

    /// Idempotent on the node id: a second registration refreshes the record.
    /// The node stays `Registering` until a session is opened.
    pub fn upsert_node(&self, node_id: &NodeId, registration: &RegisterPayload, now: OffsetDateTime) -> (Node, Upsert) {
        let (entry, upsert) = self.entry_or_insert(node_id, now);
        let mut entry = entry.lock();

        entry.node.hostname = registration.hostname.clone();
        entry.node.address = registration.address.clone();
        entry.node.port = registration.port;
        entry.node.metadata = registration.metadata.clone();
        entry.node.version = Some(registration.version.clone());
        entry.node.status = NodeStatus::Registering;
        entry.node.last_seen = now;
        entry.session = None;

        if upsert == Upsert::Created {
            info!(node_id = %node_id, hostname = %registration.hostname, "New node registered");
        } else {
            debug!(node_id = %node_id, "Node re-registered");
        }
        (entry.node.clone(), upsert)
    }

    pub fn open_session(&self, node_id: &NodeId, token: &str, now: OffsetDateTime) -> Result<(), RegistryError> {
        let entry = self.entry(node_id).ok_or_else(|| RegistryError::UnknownNode(node_id.clone()))?;
        let mut entry = entry.lock();
        entry.session = Some(token.to_string());
        entry.node.status = NodeStatus::Online;
        entry.node.last_seen = now;
        Ok(())
    }

    pub fn session_matches(&self, node_id: &NodeId, token: Option<&str>) -> bool {
        let Some(token) = token else {
            return false;
        };
        self.entry(node_id)
            .map(|entry| entry.lock().session.as_deref() == Some(token))
            .unwrap_or(false)
    }

    /// Returns true when the node came back from `Offline`
    pub fn record_heartbeat(&self, node_id: &NodeId, at: OffsetDateTime) -> Result<bool, RegistryError> {
        let entry = self.entry(node_id).ok_or_else(|| RegistryError::UnknownNode(node_id.clone()))?;
        let mut entry = entry.lock();
        if at > entry.node.last_seen {
            entry.node.last_seen = at;
        }

        let revived = entry.node.status == NodeStatus::Offline && entry.session.is_some();
        if revived {
            entry.node.status = NodeStatus::Online;
            info!(node_id = %node_id, "Node is back online");
        }
        Ok(revived)
    }

    /// Applies all reports or nothing
    pub fn apply_device_delta(&self, node_id: &NodeId, delta: DeviceDelta) -> Result<Vec<DeviceChange>, RegistryError> {
        let entry = self.entry(node_id).ok_or_else(|| RegistryError::UnknownNode(node_id.clone()))?;
        let mut entry = entry.lock();

        let mut changes = Vec::new();
        let mut reported = HashSet::new();
        for report in &delta.reports {
            reported.insert(report.device_id.clone());
            let device = Device::from_report(node_id, report);
            let previous = entry.devices.insert(device.device_id.clone(), device.clone());

            let changed = match &previous {
                Some(known) => known.status != device.status || known.claimed_by != device.claimed_by,
                None => true,
            };
            if changed {
                changes.push(DeviceChange {
                    previous: previous.map(|d| d.status),
                    device,
                });
            }
        }

        if delta.complete {
            for device in entry.devices.values_mut() {
                if reported.contains(&device.device_id) || device.status == DeviceStatus::Offline {
                    continue;
                }
                let previous = device.status;
                device.status = DeviceStatus::Offline;
                device.claimed_by = None;
                changes.push(DeviceChange {
                    device: device.clone(),
                    previous: Some(previous),
                });
            }
        }
        Ok(changes)
    }

    /// Keeps only the latest sample
    pub fn record_load(&self, node_id: &NodeId, report: LoadReport) -> Result<(), RegistryError> {
        let entry = self.entry(node_id).ok_or_else(|| RegistryError::UnknownNode(node_id.clone()))?;
        entry.lock().load = Some(report);
        Ok(())
    }

    /// The only transition not driven by the node itself
    pub fn sweep_stale_nodes(&self, now: OffsetDateTime) -> Vec<NodeId> {
        let entries: Vec<(NodeId, Shared<NodeEntry>)> = self
            .nodes
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        let mut stale = Vec::new();
        for (node_id, entry) in entries {
            let mut entry = entry.lock();
            let live = matches!(entry.node.status, NodeStatus::Online | NodeStatus::Registering);
            if live && now - entry.node.last_seen > self.liveness_window {
                entry.node.status = NodeStatus::Offline;
                stale.push(node_id);
            }
        }
        stale.sort();
        stale
    }

    /// Rejected by authentication: the session is dropped
    pub fn mark_error(&self, node_id: &NodeId) -> bool {
        match self.entry(node_id) {
            Some(entry) => {
                let mut entry = entry.lock();
                entry.node.status = NodeStatus::Error;
                entry.session = None;
                true
            }
            None => false,
        }
    }

    /// Persisted nodes come back `Unknown` and without a session
    pub fn restore(&self, records: Vec<NodeRecord>) -> usize {
        let mut nodes = self.nodes.write();
        let mut restored = 0;
        for record in records {
            if nodes.contains_key(&record.node.node_id) {
                continue;
            }
            let mut node = record.node;
            node.status = NodeStatus::Unknown;
            let entry = NodeEntry {
                devices: record
                    .devices
                    .into_iter()
                    .map(|device| (device.device_id.clone(), device))
                    .collect(),
                load: None,
                session: None,
                node,
            };
            nodes.insert(entry.node.node_id.clone(), new_state(entry));
            restored += 1;
        }
        restored
    }

    pub fn node(&self, node_id: &NodeId) -> Option<NodeRecord> {
        self.entry(node_id).map(|entry| entry.lock().record())
    }

    /// Every node, ordered by id
    pub fn nodes(&self) -> Vec<NodeRecord> {
        let entries: Vec<Shared<NodeEntry>> = self.nodes.read().values().cloned().collect();
        let mut records: Vec<NodeRecord> = entries.iter().map(|entry| entry.lock().record()).collect();
        records.sort_by(|a, b| a.node.node_id.cmp(&b.node.node_id));
        records
    }

    pub fn target(&self, node_id: &NodeId, device_id: &DeviceKey) -> Option<CommandTarget> {
        self.entry(node_id).map(|entry| {
            let entry = entry.lock();
            CommandTarget {
                status: entry.node.status,
                device: entry.devices.get(device_id).cloned(),
                session: entry.session.clone(),
            }
        })
    }

    pub fn summary(&self) -> RegistrySummary {
        let entries: Vec<Shared<NodeEntry>> = self.nodes.read().values().cloned().collect();
        entries.iter().fold(RegistrySummary::default(), |mut summary, entry| {
            let entry = entry.lock();
            summary.nodes += 1;
            if entry.node.status == NodeStatus::Online {
                summary.online += 1;
            }
            summary.devices += entry.devices.len();
            summary
        })
    }
}
