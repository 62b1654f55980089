//! NCOD protocol - everything the master and the slave nodes agree on
//!
//! - Node identity derived from a normalized MAC address
//! - Node-scoped device identity and device lifecycle states
//! - The JSON envelope carried on the command channel and its payloads
//! - One coherent timing surface (intervals, liveness window, backoff)
//! - The transport seam, with the MQTT implementation used in production

pub mod device;
pub mod envelope;
pub mod identity;
pub mod timing;
pub mod transport;

pub use device::{DeviceKey, DeviceReport, DeviceStatus, ReportedStatus};
pub use envelope::{
    CommandPayload, Envelope, HeartbeatPayload, LoadReport, MessageType, ProtocolError,
    RegisterAck, RegisterPayload, StatusUpdate,
};
pub use identity::{IdentityError, NodeId};
pub use timing::{Backoff, TimingConfig};
pub use transport::{
    downlink_topic, uplink_topic, ChannelError, EnvelopeSink, MqttSettings, MqttSink, MqttTransport, Role,
    Transport, TransportEvent, EVENTS_TOPIC, MASTER_SUBSCRIPTION,
};
