//! Registry events for the outside world
//!
//! Notifiers are fire-and-forget: they never block a session and their
//! failures are only logged.

use ncod_protocol::{DeviceKey, DeviceStatus, NodeId, EVENTS_TOPIC};
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    NodeRegistered {
        node_id: NodeId,
        hostname: String,
        address: String,
        first_time: bool,
    },
    NodeOnline {
        node_id: NodeId,
    },
    NodeOffline {
        node_id: NodeId,
    },
    DeviceTransition {
        node_id: NodeId,
        device_id: DeviceKey,
        status: DeviceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous: Option<DeviceStatus>,
        #[serde(skip_serializing_if = "Option::is_none")]
        claimed_by: Option<String>,
    },
    CommandFailed {
        node_id: NodeId,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_id: Option<DeviceKey>,
        error: String,
    },
    AuthRejected {
        node_id: NodeId,
        reason: String,
    },
}

impl RegistryEvent {
    pub fn node_id(&self) -> &NodeId {
        match self {
            RegistryEvent::NodeRegistered { node_id, .. }
            | RegistryEvent::NodeOnline { node_id }
            | RegistryEvent::NodeOffline { node_id }
            | RegistryEvent::DeviceTransition { node_id, .. }
            | RegistryEvent::CommandFailed { node_id, .. }
            | RegistryEvent::AuthRejected { node_id, .. } => node_id,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &RegistryEvent);
}

pub type SharedNotifier = Arc<dyn Notifier>;

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &RegistryEvent) {
        match event {
            RegistryEvent::CommandFailed { node_id, device_id, error } => {
                warn!(node_id = %node_id, device_id = ?device_id.as_ref().map(ToString::to_string), "Command failed: {error}")
            }
            RegistryEvent::AuthRejected { node_id, reason } => {
                warn!(node_id = %node_id, "Registration rejected: {reason}")
            }
            RegistryEvent::NodeOffline { node_id } => warn!(node_id = %node_id, "Node went offline"),
            RegistryEvent::DeviceTransition {
                node_id,
                device_id,
                status,
                ..
            } => info!(node_id = %node_id, device_id = %device_id, status = %status, "Device transition"),
            other => info!(node_id = %other.node_id(), "{other:?}"),
        }
    }
}

#[derive(Serialize)]
struct Published<'a> {
    #[serde(flatten)]
    event: &'a RegistryEvent,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

/// Publishes events as JSON on `ncod/events@v1`
pub struct MqttNotifier {
    client: AsyncClient,
}

impl MqttNotifier {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl Notifier for MqttNotifier {
    fn notify(&self, event: &RegistryEvent) {
        let published = Published {
            event,
            timestamp: OffsetDateTime::now_utc(),
        };
        let payload = match serde_json::to_vec(&published) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode registry event: {e}");
                return;
            }
        };
        if let Err(e) = self.client.try_publish(EVENTS_TOPIC, QoS::AtLeastOnce, false, payload) {
            warn!("Failed to publish registry event: {e}");
        }
    }
}

/// Sends every event to each inner notifier
pub struct Broadcast(pub Vec<SharedNotifier>);

impl Notifier for Broadcast {
    fn notify(&self, event: &RegistryEvent) {
        for notifier in &self.0 {
            notifier.notify(event);
        }
    }
}
