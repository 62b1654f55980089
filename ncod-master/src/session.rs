/*!
Per-node session actor

Each node that speaks to the master gets one actor fed by the hub. The actor
owns the node's registration handshake and turns its uplink traffic into
registry updates. Any traffic with a valid session token counts as liveness;
traffic with a missing or stale token is answered with `register_required`.
A rejected registration ends the actor; the hub starts a fresh one if the
node speaks again.
*/

use crate::auth::NodeAuthenticator;
use crate::notify::{RegistryEvent, SharedNotifier};
use crate::registry::{DeviceChange, DeviceDelta, SharedRegistry, Upsert};
use ncod_protocol::{
    Envelope, EnvelopeSink, HeartbeatPayload, LoadReport, MessageType, NodeId, RegisterAck, RegisterPayload,
    StatusUpdate,
};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Minimum gap between two `register_required` to the same node
const REQUIRED_DEBOUNCE: Duration = Duration::from_secs(1);

/// Services shared by every session
pub struct SessionContext<S> {
    pub registry: SharedRegistry,
    pub sink: S,
    pub auth: Arc<dyn NodeAuthenticator>,
    pub notifier: SharedNotifier,
}

pub struct NodeSession<S> {
    node_id: NodeId,
    ctx: Arc<SessionContext<S>>,
    last_required: Option<Instant>,
    rejected: bool,
}

impl<S: EnvelopeSink> NodeSession<S> {
    pub fn new(node_id: NodeId, ctx: Arc<SessionContext<S>>) -> Self {
        Self {
            node_id,
            ctx,
            last_required: None,
            rejected: false,
        }
    }

    /// Runs until the hub drops the inbox, the node fails authentication or
    /// shutdown is requested; queued envelopes are still applied on shutdown.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<Envelope>, cancel: CancellationToken) {
        debug!(node_id = %self.node_id, "Session started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => self.handle(envelope),
                    None => return,
                },
            }
            if self.rejected {
                debug!(node_id = %self.node_id, "Session closed after rejected registration");
                return;
            }
        }

        inbox.close();
        let mut drained = 0;
        while let Some(envelope) = inbox.recv().await {
            self.handle(envelope);
            drained += 1;
            if self.rejected {
                break;
            }
        }
        debug!(node_id = %self.node_id, drained, "Session drained");
    }

    pub fn handle(&mut self, envelope: Envelope) {
        if envelope.node_id != self.node_id {
            warn!(node_id = %self.node_id, other = %envelope.node_id, "Envelope routed to the wrong session, dropping");
            return;
        }

        let now = OffsetDateTime::now_utc();
        match envelope.kind {
            MessageType::Register => self.on_register(&envelope, now),
            MessageType::Heartbeat | MessageType::StatusUpdate | MessageType::LoadReport => {
                if !self.ctx.registry.session_matches(&self.node_id, envelope.session_token.as_deref()) {
                    self.require_registration();
                    return;
                }
                match self.ctx.registry.record_heartbeat(&self.node_id, now) {
                    Ok(true) => self.notify(RegistryEvent::NodeOnline {
                        node_id: self.node_id.clone(),
                    }),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(node_id = %self.node_id, "Dropping {}: {e}", envelope.kind);
                        return;
                    }
                }
                self.on_session_traffic(&envelope);
            }
            other => warn!(node_id = %self.node_id, "Unexpected {other} on uplink, dropping"),
        }
    }

    fn on_register(&mut self, envelope: &Envelope, now: OffsetDateTime) {
        let registration: RegisterPayload = match envelope.payload_as() {
            Ok(registration) => registration,
            Err(e) => {
                warn!(node_id = %self.node_id, "Invalid registration: {e}");
                return;
            }
        };

        if let Err(e) = self.ctx.auth.authenticate(&self.node_id, &registration) {
            if self.ctx.registry.mark_error(&self.node_id) {
                warn!(node_id = %self.node_id, "Known node failed authentication, marked Error");
            }
            self.notify(RegistryEvent::AuthRejected {
                node_id: self.node_id.clone(),
                reason: e.to_string(),
            });
            self.rejected = true;
            return;
        }

        let (node, upsert) = self.ctx.registry.upsert_node(&self.node_id, &registration, now);
        let token = Uuid::new_v4().to_string();
        if let Err(e) = self.ctx.registry.open_session(&self.node_id, &token, now) {
            warn!(node_id = %self.node_id, "Cannot open session: {e}");
            return;
        }
        self.last_required = None;

        let ack = Envelope::new(MessageType::RegisterAck, self.node_id.clone())
            .with_token(token.clone())
            .with_payload(&RegisterAck { session_token: token });
        match ack {
            Ok(ack) => self.reply(&ack),
            Err(e) => warn!(node_id = %self.node_id, "Failed to encode register_ack: {e}"),
        }

        info!(
            node_id = %self.node_id,
            hostname = %node.hostname,
            address = %node.address,
            "Session opened"
        );
        self.notify(RegistryEvent::NodeRegistered {
            node_id: self.node_id.clone(),
            hostname: node.hostname,
            address: node.address,
            first_time: upsert == Upsert::Created,
        });
    }

    fn on_session_traffic(&mut self, envelope: &Envelope) {
        match envelope.kind {
            MessageType::Heartbeat => match envelope.payload_as::<HeartbeatPayload>() {
                Ok(heartbeat) => self.apply(DeviceDelta::snapshot(heartbeat.devices)),
                Err(e) => warn!(node_id = %self.node_id, "Heartbeat without device snapshot: {e}"),
            },
            MessageType::StatusUpdate => match envelope.payload_as::<StatusUpdate>() {
                Ok(update) => self.on_status_update(envelope, update),
                Err(e) => warn!(node_id = %self.node_id, "Invalid status_update: {e}"),
            },
            MessageType::LoadReport => match envelope.payload_as::<LoadReport>() {
                Ok(load) => {
                    if let Err(e) = self.ctx.registry.record_load(&self.node_id, load) {
                        warn!(node_id = %self.node_id, "Load report dropped: {e}");
                    }
                }
                Err(e) => warn!(node_id = %self.node_id, "Invalid load_report: {e}"),
            },
            _ => {}
        }
    }

    fn on_status_update(&mut self, envelope: &Envelope, update: StatusUpdate) {
        if update.status.device_status().is_none() {
            // a failed command leaves the device as it was
            self.notify(RegistryEvent::CommandFailed {
                node_id: self.node_id.clone(),
                device_id: envelope.device_id.clone(),
                error: update.error.unwrap_or_else(|| "unspecified failure".into()),
            });
            return;
        }

        match update.device {
            Some(report) => self.apply(DeviceDelta::single(report)),
            None => warn!(node_id = %self.node_id, "status_update {:?} without device record", update.status),
        }
    }

    fn apply(&self, delta: DeviceDelta) {
        match self.ctx.registry.apply_device_delta(&self.node_id, delta) {
            Ok(changes) => {
                for DeviceChange { device, previous } in changes {
                    self.notify(RegistryEvent::DeviceTransition {
                        node_id: self.node_id.clone(),
                        device_id: device.device_id,
                        status: device.status,
                        previous,
                        claimed_by: device.claimed_by,
                    });
                }
            }
            Err(e) => warn!(node_id = %self.node_id, "Device delta rejected: {e}"),
        }
    }

    fn require_registration(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_required {
            if now.duration_since(last) < REQUIRED_DEBOUNCE {
                return;
            }
        }
        self.last_required = Some(now);
        debug!(node_id = %self.node_id, "Traffic without a valid session, asking for registration");
        self.reply(&Envelope::new(MessageType::RegisterRequired, self.node_id.clone()));
    }

    fn reply(&self, envelope: &Envelope) {
        if let Err(e) = self.ctx.sink.send(envelope) {
            warn!(node_id = %self.node_id, "Failed to send {}: {e}", envelope.kind);
        }
    }

    fn notify(&self, event: RegistryEvent) {
        self.ctx.notifier.notify(&event);
    }
}
