//! Command channel envelope (contract `ncod.envelope@v1`)
//!
//! Every message between a slave and the master is one JSON object:
//! `{type, node_id, device_id?, user_id?, session_token?, payload?, timestamp}`.
//! Typed payloads are (de)serialized on demand so that an unknown or partial
//! payload never poisons the envelope itself.

use crate::device::{DeviceKey, DeviceReport, ReportedStatus};
use crate::identity::NodeId;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{kind} envelope has no payload")]
    MissingPayload { kind: MessageType },
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} envelope has no device_id")]
    MissingDevice { kind: MessageType },
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Register,
    RegisterAck,
    RegisterRequired,
    Heartbeat,
    StatusUpdate,
    LoadReport,
    ConnectDevice,
    DisconnectDevice,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Register => "register",
            MessageType::RegisterAck => "register_ack",
            MessageType::RegisterRequired => "register_required",
            MessageType::Heartbeat => "heartbeat",
            MessageType::StatusUpdate => "status_update",
            MessageType::LoadReport => "load_report",
            MessageType::ConnectDevice => "connect_device",
            MessageType::DisconnectDevice => "disconnect_device",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: MessageType, node_id: NodeId) -> Self {
        Self {
            kind,
            node_id,
            device_id: None,
            user_id: None,
            session_token: None,
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_device(mut self, device_id: DeviceKey) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, ProtocolError> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Decode the payload as `T`
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let value = self
            .payload
            .clone()
            .ok_or(ProtocolError::MissingPayload { kind: self.kind })?;
        serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload { kind: self.kind, source })
    }

    pub fn require_device(&self) -> Result<&DeviceKey, ProtocolError> {
        self.device_id
            .as_ref()
            .ok_or(ProtocolError::MissingDevice { kind: self.kind })
    }
}

/// `register` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub hostname: String,
    /// Address the sharing agent server is reachable on
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub version: String,
}

/// `register_ack` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub session_token: String,
}

/// `heartbeat` payload: the node's full device table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub devices: Vec<DeviceReport>,
}

/// `status_update` payload, correlated by the envelope's `device_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: ReportedStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn from_report(report: DeviceReport) -> Self {
        Self {
            status: report.status.into(),
            device: Some(report),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, current: Option<DeviceReport>) -> Self {
        Self {
            status: ReportedStatus::Error,
            device: current,
            error: Some(message.into()),
        }
    }
}

/// `load_report` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub timestamp: DateTime<Utc>,
}

impl LoadReport {
    /// Mean utilisation, used to rank nodes for placement
    pub fn score(&self) -> f32 {
        (self.cpu_percent + self.memory_percent + self.disk_percent) / 3.0
    }
}

/// Optional `connect_device` payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}
