use chrono::{DateTime, Utc};
use ncod_protocol::{DeviceKey, DeviceReport, DeviceStatus, LoadReport, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Unknown,
    Registering,
    Online,
    Offline,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub status: NodeStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// Master-side device record, keyed by (node_id, device_id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceKey,
    pub node_id: NodeId,
    pub address: String,
    pub name: String,
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

impl Device {
    pub fn from_report(node_id: &NodeId, report: &DeviceReport) -> Self {
        Self {
            device_id: report.device_id.clone(),
            node_id: node_id.clone(),
            address: report.address.clone(),
            name: report.name.clone(),
            status: report.status,
            claimed_by: report.claimed_by.clone(),
            last_seen: to_offset(report.last_seen),
        }
    }
}

/// One node with everything the registry knows about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node: Node,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadReport>,
}

/// Wire timestamps are chrono; registry timestamps are `time`
pub fn to_offset(at: DateTime<Utc>) -> OffsetDateTime {
    at.timestamp_nanos_opt()
        .and_then(|nanos| OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).ok())
        .unwrap_or_else(OffsetDateTime::now_utc)
}
