//! Command channel towards the master
//!
//! Two tasks per node:
//! - the link supervisor owns the transport, turns its events into
//!   [`LinkEvent`]s and waits out the reconnect backoff after a drop;
//! - the channel task is the only writer. It owns the session, stamps the
//!   session token on outbound envelopes, answers control messages and hands
//!   device commands to the command consumer.
//!
//! Nothing is buffered across a disconnection: envelopes queued while the link
//! is down, or before the master acknowledged the registration, are dropped.
//! Heartbeats carry full snapshots, so the next cycle re-asserts the truth.

use crate::session::NodeSession;
use ncod_protocol::{
    Backoff, ChannelError, Envelope, EnvelopeSink, MessageType, NodeId, RegisterAck, RegisterPayload, Transport,
    TransportEvent,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug)]
pub enum LinkEvent {
    Up,
    Down(ChannelError),
    Retrying { attempt: u32, delay: Duration },
    Inbound(Envelope),
}

/// Producer side of the outbound queue
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Envelope>,
    node_id: NodeId,
}

pub fn outbox(node_id: NodeId, capacity: usize) -> (Outbox, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Outbox { tx, node_id }, rx)
}

impl Outbox {
    pub fn envelope(&self, kind: MessageType) -> Envelope {
        Envelope::new(kind, self.node_id.clone())
    }

    /// Never waits: a full queue drops the envelope
    pub fn push(&self, envelope: Envelope) -> bool {
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                warn!("Outbound queue full, dropping {}", envelope.kind);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Reconnect loop; the delay before attempt `n` is `backoff.delay(n)`
pub async fn supervise_link<T: Transport>(
    mut transport: T,
    backoff: Backoff,
    events: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
) {
    let mut retry: u32 = 0;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = transport.next_event() => event,
        };

        let forwarded = match event {
            Ok(TransportEvent::Connected) => {
                retry = 0;
                events.send(LinkEvent::Up).await
            }
            Ok(TransportEvent::Message(envelope)) => events.send(LinkEvent::Inbound(envelope)).await,
            Err(e) => {
                if events.send(LinkEvent::Down(e)).await.is_err() {
                    return;
                }
                let delay = backoff.delay(retry);
                retry = retry.saturating_add(1);
                let _ = events.send(LinkEvent::Retrying { attempt: retry, delay }).await;

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => Ok(()),
                }
            }
        };
        if forwarded.is_err() {
            // channel task is gone
            return;
        }
    }
}

pub struct Channel<S> {
    sink: S,
    node_id: NodeId,
    registration: RegisterPayload,
    session: NodeSession,
    link: LinkState,
    registration_retry: Duration,
}

impl<S: EnvelopeSink> Channel<S> {
    pub fn new(sink: S, node_id: NodeId, registration: RegisterPayload, registration_retry: Duration) -> Self {
        Self {
            sink,
            node_id,
            registration,
            session: NodeSession::new(),
            link: LinkState::Disconnected,
            registration_retry,
        }
    }

    pub async fn run(
        mut self,
        mut link_events: mpsc::Receiver<LinkEvent>,
        mut outbound: mpsc::Receiver<Envelope>,
        commands: mpsc::Sender<Envelope>,
        cancel: CancellationToken,
    ) {
        let mut retry = interval(self.registration_retry);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(envelope) = outbound.recv() => self.forward(envelope),
                Some(event) = link_events.recv() => {
                    self.on_link_event(event, &commands, &mut outbound, &mut retry);
                }
                _ = retry.tick() => {
                    if self.link == LinkState::Connected && self.session.is_registering() {
                        info!(node_id = %self.node_id, "No register_ack yet, retrying registration");
                        self.send_register(&mut retry);
                    }
                }
            }
        }
        debug!(node_id = %self.node_id, "Channel task stopped");
    }

    fn forward(&self, mut envelope: Envelope) {
        let (LinkState::Connected, Some(token)) = (self.link, self.session.token()) else {
            debug!("Dropping {}: session is {:?}", envelope.kind, self.session.state());
            return;
        };
        envelope.session_token = Some(token.to_string());
        if let Err(e) = self.sink.send(&envelope) {
            warn!("Failed to send {}: {e}", envelope.kind);
        }
    }

    fn on_link_event(
        &mut self,
        event: LinkEvent,
        commands: &mpsc::Sender<Envelope>,
        outbound: &mut mpsc::Receiver<Envelope>,
        retry: &mut tokio::time::Interval,
    ) {
        match event {
            LinkEvent::Up => {
                info!(node_id = %self.node_id, "Link up");
                self.link = LinkState::Connected;
                self.session.link_up();
                self.send_register(retry);
            }
            LinkEvent::Down(e) => {
                warn!(node_id = %self.node_id, "Link down: {e}");
                self.link = LinkState::Disconnected;
                self.session.link_down();
                let mut dropped = 0;
                while outbound.try_recv().is_ok() {
                    dropped += 1;
                }
                if dropped > 0 {
                    debug!("Dropped {dropped} queued envelopes");
                }
            }
            LinkEvent::Retrying { attempt, delay } => {
                self.link = LinkState::Connecting;
                info!("Reconnect attempt {attempt} in {delay:?}");
            }
            LinkEvent::Inbound(envelope) => self.on_inbound(envelope, commands, retry),
        }
    }

    fn on_inbound(&mut self, envelope: Envelope, commands: &mpsc::Sender<Envelope>, retry: &mut tokio::time::Interval) {
        if envelope.node_id != self.node_id {
            warn!(node_id = %envelope.node_id, "Envelope addressed to another node, dropping");
            return;
        }

        match envelope.kind {
            MessageType::RegisterAck => match envelope.payload_as::<RegisterAck>() {
                Ok(ack) => {
                    self.session.acknowledged(ack.session_token);
                }
                Err(e) => warn!("Invalid register_ack: {e}"),
            },
            MessageType::RegisterRequired => {
                // a burst of these must not start several registrations
                let was_registering = self.session.is_registering();
                self.session.registration_required();
                if !was_registering && self.link == LinkState::Connected && self.session.is_registering() {
                    self.send_register(retry);
                }
            }
            MessageType::ConnectDevice | MessageType::DisconnectDevice => {
                if let Err(e) = commands.try_send(envelope) {
                    warn!("Command queue unavailable, dropping command: {e}");
                }
            }
            other => debug!("Ignoring unexpected {other} from master"),
        }
    }

    fn send_register(&self, retry: &mut tokio::time::Interval) {
        retry.reset();
        let envelope = match Envelope::new(MessageType::Register, self.node_id.clone()).with_payload(&self.registration)
        {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Failed to encode registration: {e}");
                return;
            }
        };
        match self.sink.send(&envelope) {
            Ok(()) => info!(node_id = %self.node_id, "Registration sent"),
            Err(e) => warn!("Failed to send registration: {e}"),
        }
    }
}
