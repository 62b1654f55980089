//! Device commands from the master to a node
//!
//! Issuing only checks that the node is Online and that the device state
//! permits the command, then publishes. The outcome arrives later from the
//! node as a `status_update` correlated by device id.

use crate::models::NodeStatus;
use crate::registry::SharedRegistry;
use ncod_protocol::{
    ChannelError, CommandPayload, DeviceKey, DeviceStatus, Envelope, EnvelopeSink, MessageType, NodeId,
    ProtocolError,
};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("node {0} is not registered")]
    UnknownNode(NodeId),
    #[error("node {node_id} is {status:?}, not Online")]
    NodeNotOnline { node_id: NodeId, status: NodeStatus },
    #[error("device {device_id} is unknown on node {node_id}")]
    UnknownDevice { node_id: NodeId, device_id: DeviceKey },
    #[error("device {device_id} is {status}")]
    DeviceUnavailable { device_id: DeviceKey, status: DeviceStatus },
    #[error(transparent)]
    Encode(#[from] ProtocolError),
    #[error("failed to send command: {0}")]
    Send(#[from] ChannelError),
}

pub struct CommandIssuer<S> {
    registry: SharedRegistry,
    sink: S,
}

impl<S: EnvelopeSink> CommandIssuer<S> {
    pub fn new(registry: SharedRegistry, sink: S) -> Self {
        Self { registry, sink }
    }

    pub fn connect(
        &self,
        node_id: &NodeId,
        device_id: &DeviceKey,
        user_id: &str,
        password: Option<String>,
    ) -> Result<Envelope, IssueError> {
        let session = self.check(node_id, device_id, DeviceStatus::Available)?;
        let mut envelope = Envelope::new(MessageType::ConnectDevice, node_id.clone())
            .with_device(device_id.clone())
            .with_user(user_id);
        if password.is_some() {
            envelope = envelope.with_payload(&CommandPayload { password })?;
        }
        self.publish(envelope, session)
    }

    pub fn disconnect(&self, node_id: &NodeId, device_id: &DeviceKey) -> Result<Envelope, IssueError> {
        let session = self.check(node_id, device_id, DeviceStatus::InUse)?;
        let envelope = Envelope::new(MessageType::DisconnectDevice, node_id.clone()).with_device(device_id.clone());
        self.publish(envelope, session)
    }

    /// Returns the node's session token
    fn check(&self, node_id: &NodeId, device_id: &DeviceKey, required: DeviceStatus) -> Result<Option<String>, IssueError> {
        let target = self
            .registry
            .target(node_id, device_id)
            .ok_or_else(|| IssueError::UnknownNode(node_id.clone()))?;

        if target.status != NodeStatus::Online {
            return Err(IssueError::NodeNotOnline {
                node_id: node_id.clone(),
                status: target.status,
            });
        }
        let device = target.device.ok_or_else(|| IssueError::UnknownDevice {
            node_id: node_id.clone(),
            device_id: device_id.clone(),
        })?;
        if device.status != required {
            return Err(IssueError::DeviceUnavailable {
                device_id: device_id.clone(),
                status: device.status,
            });
        }
        Ok(target.session)
    }

    fn publish(&self, mut envelope: Envelope, session: Option<String>) -> Result<Envelope, IssueError> {
        envelope.session_token = session;
        self.sink.send(&envelope)?;
        info!(
            node_id = %envelope.node_id,
            device_id = ?envelope.device_id.as_ref().map(ToString::to_string),
            "Sent {}",
            envelope.kind
        );
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DeviceDelta, NodeRegistry};
    use crate::session::tests::{available, node};
    use ncod_devkit::{mock_transport, MockLink, MockSink};
    use ncod_protocol::{RegisterPayload, Transport};
    use std::sync::Arc;
    use std::time::Duration;
    use time::OffsetDateTime;

    fn setup() -> (CommandIssuer<MockSink>, SharedRegistry, MockLink) {
        let (transport, link) = mock_transport();
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(15)));
        let registration = RegisterPayload {
            hostname: "bench".into(),
            address: "10.0.0.7".into(),
            port: 7575,
            metadata: Default::default(),
            version: "0.1.0".into(),
        };
        registry.upsert_node(&node(), &registration, OffsetDateTime::now_utc());
        registry.open_session(&node(), "t1", OffsetDateTime::now_utc()).unwrap();

        let mut claimed = available(1, 3);
        claimed.status = DeviceStatus::InUse;
        claimed.claimed_by = Some("u9".into());
        registry
            .apply_device_delta(&node(), DeviceDelta::snapshot(vec![available(1, 2), claimed]))
            .unwrap();

        (CommandIssuer::new(registry.clone(), transport.sink()), registry, link)
    }

    #[test]
    fn test_connect_published_with_session() {
        let (issuer, _, link) = setup();
        issuer.connect(&node(), &DeviceKey::port(1, 2), "u1", Some("pw".into())).unwrap();

        let sent = link.sent_of(MessageType::ConnectDevice);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].user_id.as_deref(), Some("u1"));
        assert_eq!(sent[0].session_token.as_deref(), Some("t1"));
        let payload: CommandPayload = sent[0].payload_as().unwrap();
        assert_eq!(payload.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_device_state_is_checked() {
        let (issuer, _, link) = setup();

        assert!(matches!(
            issuer.connect(&node(), &DeviceKey::port(1, 3), "u1", None),
            Err(IssueError::DeviceUnavailable { status: DeviceStatus::InUse, .. })
        ));
        assert!(matches!(
            issuer.disconnect(&node(), &DeviceKey::port(1, 2)),
            Err(IssueError::DeviceUnavailable { status: DeviceStatus::Available, .. })
        ));
        assert!(matches!(
            issuer.connect(&node(), &DeviceKey::port(9, 9), "u1", None),
            Err(IssueError::UnknownDevice { .. })
        ));
        assert!(link.sent().is_empty());

        issuer.disconnect(&node(), &DeviceKey::port(1, 3)).unwrap();
        assert_eq!(link.count_of(MessageType::DisconnectDevice), 1);
    }

    #[test]
    fn test_node_must_be_online() {
        let (issuer, registry, link) = setup();
        registry.sweep_stale_nodes(OffsetDateTime::now_utc() + time::Duration::minutes(1));

        assert!(matches!(
            issuer.connect(&node(), &DeviceKey::port(1, 2), "u1", None),
            Err(IssueError::NodeNotOnline { status: NodeStatus::Offline, .. })
        ));
        let stranger = NodeId::parse("02:00:00:00:00:01").unwrap();
        assert!(matches!(
            issuer.connect(&stranger, &DeviceKey::port(1, 2), "u1", None),
            Err(IssueError::UnknownNode(_))
        ));
        assert!(link.sent().is_empty());
    }

    #[test]
    fn test_send_failure_surfaces() {
        let (issuer, _, link) = setup();
        link.reject_sends(true);
        assert!(matches!(
            issuer.connect(&node(), &DeviceKey::port(1, 2), "u1", None),
            Err(IssueError::Send(_))
        ));
    }
}
