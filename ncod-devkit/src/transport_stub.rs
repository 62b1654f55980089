/*!
In-memory transport for developing without a broker

`MockTransport` implements the protocol `Transport` trait; the paired
`MockLink` stays with the test to inject link events and inspect every
envelope the code under test sent.
*/

use anyhow::Result;
use chrono::Utc;
use ncod_protocol::{
    ChannelError, DeviceKey, DeviceReport, Envelope, EnvelopeSink, HeartbeatPayload, LoadReport, MessageType,
    NodeId, RegisterAck, RegisterPayload, StatusUpdate, Transport, TransportEvent,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

type LinkEvent = Result<TransportEvent, ChannelError>;

/// Creates a connected pair: the transport for the code under test, the link for the test
pub fn mock_transport() -> (MockTransport, MockLink) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let sink = MockSink::default();

    let transport = MockTransport {
        events: events_rx,
        sink: sink.clone(),
    };
    let link = MockLink { events: events_tx, sink };
    (transport, link)
}

pub struct MockTransport {
    events: mpsc::UnboundedReceiver<LinkEvent>,
    sink: MockSink,
}

impl Transport for MockTransport {
    type Sink = MockSink;

    fn sink(&self) -> MockSink {
        self.sink.clone()
    }

    fn next_event(&mut self) -> impl Future<Output = LinkEvent> + Send {
        async move {
            match self.events.recv().await {
                Some(event) => event,
                // the test dropped its link: behave like a silent connection
                None => std::future::pending().await,
            }
        }
    }
}

/// Records every envelope sent through it
#[derive(Clone, Default)]
pub struct MockSink {
    sent: Arc<Mutex<Vec<Envelope>>>,
    reject: Arc<AtomicBool>,
}

impl EnvelopeSink for MockSink {
    fn send(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(ChannelError::Publish("mock sink rejecting".into()));
        }
        self.sent.lock().unwrap().push(envelope.clone());
        log::info!("📤 [MOCK] {} for {}", envelope.kind, envelope.node_id);
        Ok(())
    }
}

/// Test-side handle of a mock link
#[derive(Clone)]
pub struct MockLink {
    events: mpsc::UnboundedSender<LinkEvent>,
    sink: MockSink,
}

impl MockLink {
    /// Simulates a successful (re)connection
    pub fn connect(&self) {
        let _ = self.events.send(Ok(TransportEvent::Connected));
        log::info!("🔌 [MOCK] link up");
    }

    /// Simulates the link dropping mid-session
    pub fn drop_connection(&self) {
        let _ = self.events.send(Err(ChannelError::Connection("mock link dropped".into())));
        log::info!("💥 [MOCK] link dropped");
    }

    /// Simulates an envelope arriving from the other end
    pub fn deliver(&self, envelope: Envelope) {
        log::info!("📨 [MOCK] delivering {}", envelope.kind);
        let _ = self.events.send(Ok(TransportEvent::Message(envelope)));
    }

    /// Makes the sink refuse (or accept again) outbound envelopes
    pub fn reject_sends(&self, reject: bool) {
        self.sink.reject.store(reject, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sink.sent.lock().unwrap().clone()
    }

    pub fn sent_of(&self, kind: MessageType) -> Vec<Envelope> {
        self.sink
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|env| env.kind == kind)
            .cloned()
            .collect()
    }

    pub fn count_of(&self, kind: MessageType) -> usize {
        self.sent_of(kind).len()
    }

    pub fn counts(&self) -> HashMap<MessageType, usize> {
        let mut counts = HashMap::new();
        for env in self.sent() {
            *counts.entry(env.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn clear(&self) {
        self.sink.sent.lock().unwrap().clear();
    }

    /// Waits until at least `count` envelopes of `kind` were sent
    pub async fn wait_for(&self, kind: MessageType, count: usize, timeout_ms: u64) -> Result<Vec<Envelope>> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            let sent = self.sent_of(kind);
            if sent.len() >= count {
                return Ok(sent);
            }
            if tokio::time::Instant::now() >= deadline {
                log::warn!("⏰ Timeout waiting for {count} x {kind}, got {}", sent.len());
                anyhow::bail!("timed out waiting for {count} {kind} envelopes (got {})", sent.len());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Builds contract-shaped envelopes on behalf of one node
pub struct EnvelopeBuilder {
    node_id: NodeId,
}

impl EnvelopeBuilder {
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn register(&self, hostname: &str, address: &str, metadata: &[(&str, &str)]) -> Envelope {
        let payload = RegisterPayload {
            hostname: hostname.to_string(),
            address: address.to_string(),
            port: 7575,
            metadata: metadata.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            version: "test".to_string(),
        };
        Envelope::new(MessageType::Register, self.node_id.clone())
            .with_payload(&payload)
            .expect("register payload serializes")
    }

    pub fn register_ack(&self, token: &str) -> Envelope {
        Envelope::new(MessageType::RegisterAck, self.node_id.clone())
            .with_payload(&RegisterAck { session_token: token.to_string() })
            .expect("ack payload serializes")
    }

    pub fn register_required(&self) -> Envelope {
        Envelope::new(MessageType::RegisterRequired, self.node_id.clone())
    }

    pub fn heartbeat(&self, token: &str, devices: Vec<DeviceReport>) -> Envelope {
        Envelope::new(MessageType::Heartbeat, self.node_id.clone())
            .with_token(token)
            .with_payload(&HeartbeatPayload { devices })
            .expect("heartbeat payload serializes")
    }

    pub fn status_update(&self, token: &str, update: &StatusUpdate, device_id: DeviceKey) -> Envelope {
        Envelope::new(MessageType::StatusUpdate, self.node_id.clone())
            .with_token(token)
            .with_device(device_id)
            .with_payload(update)
            .expect("status payload serializes")
    }

    pub fn load_report(&self, token: &str, cpu: f32, memory: f32, disk: f32) -> Envelope {
        let report = LoadReport {
            cpu_percent: cpu,
            memory_percent: memory,
            disk_percent: disk,
            timestamp: Utc::now(),
        };
        Envelope::new(MessageType::LoadReport, self.node_id.clone())
            .with_token(token)
            .with_payload(&report)
            .expect("load payload serializes")
    }

    pub fn connect_device(&self, device_id: DeviceKey, user_id: &str) -> Envelope {
        Envelope::new(MessageType::ConnectDevice, self.node_id.clone())
            .with_device(device_id)
            .with_user(user_id)
    }

    pub fn disconnect_device(&self, device_id: DeviceKey) -> Envelope {
        Envelope::new(MessageType::DisconnectDevice, self.node_id.clone()).with_device(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::new(NodeId::parse("a1:b2:c3:d4:e5:f6").unwrap())
    }

    #[tokio::test]
    async fn test_link_events_reach_transport() {
        let (mut transport, link) = mock_transport();

        link.connect();
        link.deliver(builder().register_ack("t1"));
        link.drop_connection();

        assert_eq!(transport.next_event().await.unwrap(), TransportEvent::Connected);
        match transport.next_event().await.unwrap() {
            TransportEvent::Message(env) => assert_eq!(env.kind, MessageType::RegisterAck),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(transport.next_event().await.is_err());
    }

    #[tokio::test]
    async fn test_sink_records_and_rejects() {
        let (transport, link) = mock_transport();
        let sink = transport.sink();

        sink.send(&builder().heartbeat("t1", vec![])).unwrap();
        link.reject_sends(true);
        assert!(sink.send(&builder().heartbeat("t1", vec![])).is_err());

        assert_eq!(link.count_of(MessageType::Heartbeat), 1);
        assert_eq!(link.counts().get(&MessageType::Heartbeat), Some(&1));
        assert!(link.wait_for(MessageType::Register, 1, 30).await.is_err());
    }

    #[test]
    fn test_builders() {
        let b = builder();
        let reg = b.register("bench-01", "10.0.0.7", &[("rack", "r1")]);
        let payload: RegisterPayload = reg.payload_as().unwrap();
        assert_eq!(payload.metadata.get("rack").map(String::as_str), Some("r1"));

        let cmd = b.connect_device(DeviceKey::port(1, 2), "u1");
        assert_eq!(cmd.user_id.as_deref(), Some("u1"));
        assert_eq!(cmd.device_id, Some(DeviceKey::port(1, 2)));
    }
}
