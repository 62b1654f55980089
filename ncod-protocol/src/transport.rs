//! Transport seam for the command channel
//!
//! A transport yields a stream of [`TransportEvent`]s and hands out a
//! cloneable [`EnvelopeSink`] for the outbound direction. Production code uses
//! [`MqttTransport`]; tests use the in-memory link from `ncod-devkit`.
//!
//! Topics (one pair per node):
//! - `ncod/nodes/<node_id>/uplink@v1`   slave -> master
//! - `ncod/nodes/<node_id>/downlink@v1` master -> slave

use crate::envelope::Envelope;
use crate::identity::NodeId;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const MASTER_SUBSCRIPTION: &str = "ncod/nodes/+/uplink@v1";
pub const EVENTS_TOPIC: &str = "ncod/events@v1";

pub fn uplink_topic(node_id: &NodeId) -> String {
    format!("ncod/nodes/{node_id}/uplink@v1")
}

pub fn downlink_topic(node_id: &NodeId) -> String {
    format!("ncod/nodes/{node_id}/downlink@v1")
}

/// Node id embedded in an uplink topic
fn uplink_node(topic: &str) -> Option<&str> {
    topic.strip_prefix("ncod/nodes/")?.strip_suffix("/uplink@v1")
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("channel closed")]
    Closed,
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish rejected: {0}")]
    Publish(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Link (re)established; subscriptions are in place
    Connected,
    Message(Envelope),
}

/// Outbound half of a transport. `send` never blocks: an envelope that cannot
/// be handed to the link is reported as an error and dropped.
pub trait EnvelopeSink: Clone + Send + Sync + 'static {
    fn send(&self, envelope: &Envelope) -> Result<(), ChannelError>;
}

pub trait Transport: Send + 'static {
    type Sink: EnvelopeSink;

    fn sink(&self) -> Self::Sink;

    /// Next link event. An `Err` means the link dropped; calling again after a
    /// delay attempts to reconnect.
    fn next_event(&mut self) -> impl Future<Output = Result<TransportEvent, ChannelError>> + Send;
}

/// Which end of the channel this transport serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Master,
    Node(NodeId),
}

impl Role {
    fn subscription(&self) -> String {
        match self {
            Role::Master => MASTER_SUBSCRIPTION.to_string(),
            Role::Node(id) => downlink_topic(id),
        }
    }

    fn publish_topic(&self, envelope: &Envelope) -> String {
        match self {
            Role::Master => downlink_topic(&envelope.node_id),
            Role::Node(id) => uplink_topic(id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            client_id: "ncod-unknown".to_string(),
            keep_alive_secs: 30,
        }
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
    role: Role,
}

impl MqttTransport {
    pub fn new(settings: &MqttSettings, role: Role) -> Self {
        let mut options = MqttOptions::new(&settings.client_id, &settings.broker_host, settings.broker_port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, 64);
        Self { client, eventloop, role }
    }

    /// Raw client, for publishers that live outside the command channel
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    fn decode(&self, topic: &str, payload: &[u8]) -> Option<Envelope> {
        let envelope: Envelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic, "dropping malformed envelope: {e}");
                return None;
            }
        };

        if self.role == Role::Master && uplink_node(topic) != Some(envelope.node_id.as_str()) {
            warn!(topic, node_id = %envelope.node_id, "envelope node_id does not match its topic, dropping");
            return None;
        }
        Some(envelope)
    }
}

#[derive(Clone)]
pub struct MqttSink {
    client: AsyncClient,
    role: Role,
}

impl EnvelopeSink for MqttSink {
    fn send(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(envelope)?;
        self.client
            .try_publish(self.role.publish_topic(envelope), QoS::AtLeastOnce, false, payload)
            .map_err(|e| ChannelError::Publish(e.to_string()))
    }
}

impl Transport for MqttTransport {
    type Sink = MqttSink;

    fn sink(&self) -> MqttSink {
        MqttSink {
            client: self.client.clone(),
            role: self.role.clone(),
        }
    }

    fn next_event(&mut self) -> impl Future<Output = Result<TransportEvent, ChannelError>> + Send {
        async move {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        // clean session: subscriptions are lost on every reconnect
                        self.client
                            .try_subscribe(self.role.subscription(), QoS::AtLeastOnce)
                            .map_err(|e| ChannelError::Connection(e.to_string()))?;
                        return Ok(TransportEvent::Connected);
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if let Some(envelope) = self.decode(&publish.topic, &publish.payload) {
                            return Ok(TransportEvent::Message(envelope));
                        }
                    }
                    Ok(event) => debug!("mqtt event: {event:?}"),
                    Err(e) => return Err(ChannelError::Connection(e.to_string())),
                }
            }
        }
    }
}
