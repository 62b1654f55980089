/*!
Test harness playing the master against a slave

Wraps a `MockLink` and speaks the master's half of the protocol:
- acknowledges registrations with fresh session tokens
- pushes connect/disconnect commands down the link
- asserts on the envelopes the slave published
*/

use crate::transport_stub::{EnvelopeBuilder, MockLink};
use anyhow::Result;
use ncod_protocol::{CommandPayload, DeviceKey, Envelope, MessageType, NodeId, RegisterPayload};

/// Master-side test harness
pub struct TestHarness {
    pub link: MockLink,
    node_id: NodeId,
    sessions_issued: usize,
    acked_registers: usize,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    kind: MessageType,
    expected_count: usize,
    timeout_ms: u64,
}

impl TestHarness {
    pub fn new(link: MockLink, node_id: NodeId) -> Self {
        env_logger::try_init().ok();

        Self {
            link,
            node_id,
            sessions_issued: 0,
            acked_registers: 0,
            expectations: Vec::new(),
        }
    }

    pub fn builder(&self) -> EnvelopeBuilder {
        EnvelopeBuilder::new(self.node_id.clone())
    }

    /// Waits for the next unanswered `register` and acknowledges it.
    /// Returns the session token handed out.
    pub async fn accept_registration(&mut self, timeout_ms: u64) -> Result<String> {
        let registers = self
            .link
            .wait_for(MessageType::Register, self.acked_registers + 1, timeout_ms)
            .await?;
        let latest = registers.last().ok_or_else(|| anyhow::anyhow!("no register received"))?;
        let payload: RegisterPayload = latest.payload_as()?;

        self.acked_registers = registers.len();
        self.sessions_issued += 1;
        let token = format!("session-{}", self.sessions_issued);

        self.link.deliver(self.builder().register_ack(&token));
        log::info!("🤝 Acked registration of {} ({}) with {token}", self.node_id, payload.hostname);
        Ok(token)
    }

    /// Tells the slave its session is unknown
    pub fn require_registration(&self) {
        self.link.deliver(self.builder().register_required());
    }

    pub fn send_connect(&self, device_id: DeviceKey, user_id: &str, password: Option<&str>) -> Result<()> {
        let mut envelope = self.builder().connect_device(device_id, user_id);
        if let Some(password) = password {
            envelope = envelope.with_payload(&CommandPayload {
                password: Some(password.to_string()),
            })?;
        }
        self.send_command(envelope);
        Ok(())
    }

    pub fn send_disconnect(&self, device_id: DeviceKey) {
        self.send_command(self.builder().disconnect_device(device_id));
    }

    pub fn send_command(&self, envelope: Envelope) {
        log::info!("⚡ Sending {} for {:?}", envelope.kind, envelope.device_id);
        self.link.deliver(envelope);
    }

    /// Expects exactly `count` envelopes of `kind` by the time of verification
    pub fn expect_messages(&mut self, kind: MessageType, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            kind,
            expected_count: count,
            timeout_ms: 5000,
        });
        self
    }

    pub async fn verify_expectations(&self) -> Result<()> {
        log::info!("🔍 Verifying {} expectations...", self.expectations.len());

        for expectation in &self.expectations {
            // give in-flight envelopes a chance to land before counting
            let _ = self
                .link
                .wait_for(expectation.kind, expectation.expected_count, expectation.timeout_ms)
                .await;
            let actual = self.link.count_of(expectation.kind);
            if actual != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for {}: expected {} envelopes, got {}",
                    expectation.kind,
                    expectation.expected_count,
                    actual
                );
            }
            log::info!("✅ {}: {} envelopes as expected", expectation.kind, actual);
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.link.clear();
        self.acked_registers = 0;
        self.expectations.clear();
    }
}
