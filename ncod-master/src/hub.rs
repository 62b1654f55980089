//! Uplink hub: one transport, one session actor per node
//!
//! The hub owns the master's transport. Each envelope is routed to the actor
//! of its node, spawned on first contact. Actor queues are bounded; a full
//! queue drops the envelope since the next heartbeat re-asserts the state.
//! Actors that ended (rejected registration) are reaped as traffic flows.

use crate::health::HealthTracker;
use crate::session::{NodeSession, SessionContext};
use ncod_protocol::{Backoff, Envelope, NodeId, Transport, TransportEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SESSION_QUEUE: usize = 64;

pub struct Hub<T: Transport> {
    transport: T,
    ctx: Arc<SessionContext<T::Sink>>,
    health: HealthTracker,
    backoff: Backoff,
    sessions: HashMap<NodeId, mpsc::Sender<Envelope>>,
    tasks: JoinSet<()>,
}

impl<T: Transport> Hub<T> {
    pub fn new(transport: T, ctx: Arc<SessionContext<T::Sink>>, health: HealthTracker, backoff: Backoff) -> Self {
        Self {
            transport,
            ctx,
            health,
            backoff,
            sessions: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut retry = 0u32;
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = self.transport.next_event() => event,
            };

            match event {
                Ok(TransportEvent::Connected) => {
                    retry = 0;
                    self.health.mark_mqtt_connected();
                    info!("📡 Connected to broker, listening for nodes");
                }
                Ok(TransportEvent::Message(envelope)) => self.route(envelope, &cancel),
                Err(e) => {
                    self.health.increment_reconnects();
                    let delay = self.backoff.delay(retry);
                    retry = retry.saturating_add(1);
                    error!("MQTT error: {e}, reconnecting in {delay:?}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        self.drain().await;
    }

    fn route(&mut self, envelope: Envelope, cancel: &CancellationToken) {
        self.reap();
        let node_id = envelope.node_id.clone();
        if self.sessions.get(&node_id).is_some_and(|inbox| inbox.is_closed()) {
            self.sessions.remove(&node_id);
        }
        let tasks = &mut self.tasks;
        let ctx = &self.ctx;
        let inbox = self.sessions.entry(node_id.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(SESSION_QUEUE);
            let session = NodeSession::new(node_id.clone(), ctx.clone());
            tasks.spawn(session.run(rx, cancel.clone()));
            tx
        });

        match inbox.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                warn!(node_id = %node_id, "Session queue full, dropping {}", envelope.kind);
            }
            Err(TrySendError::Closed(_)) => {
                warn!(node_id = %node_id, "Session ended unexpectedly, restarting on next message");
                self.sessions.remove(&node_id);
            }
        }
    }

    fn reap(&mut self) {
        let mut finished = 0;
        while let Some(result) = self.tasks.try_join_next() {
            finished += 1;
            if let Err(e) = result {
                error!("Session task failed: {e}");
            }
        }
        if finished > 0 {
            self.sessions.retain(|_, inbox| !inbox.is_closed());
            debug!(finished, live = self.sessions.len(), "Reaped node sessions");
        }
    }

    async fn drain(mut self) {
        let sessions = self.sessions.len();
        self.sessions.clear();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("Session task failed: {e}");
            }
        }
        info!(sessions, "All node sessions drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowList;
    use crate::models::NodeStatus;
    use crate::notify::recording::RecordingNotifier;
    use crate::notify::RegistryEvent;
    use crate::registry::{NodeRegistry, SharedRegistry};
    use crate::session::tests::{available, node};
    use ncod_devkit::{mock_transport, EnvelopeBuilder, MockLink};
    use ncod_protocol::{MessageType, RegisterAck};
    use std::time::Duration;

    struct Fixture {
        link: MockLink,
        registry: SharedRegistry,
        health: HealthTracker,
        cancel: CancellationToken,
        hub: tokio::task::JoinHandle<()>,
        builder: EnvelopeBuilder,
    }

    fn start() -> Fixture {
        let (transport, link) = mock_transport();
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(15)));
        let ctx = Arc::new(SessionContext {
            registry: registry.clone(),
            sink: transport.sink(),
            auth: Arc::new(AllowList::open()),
            notifier: Arc::new(RecordingNotifier::default()),
        });
        let health = HealthTracker::new();
        let cancel = CancellationToken::new();
        let hub = Hub::new(transport, ctx, health.clone(), Backoff::fixed(Duration::from_millis(10)));
        let hub = tokio::spawn(hub.run(cancel.clone()));

        Fixture {
            link,
            registry,
            health,
            cancel,
            hub,
            builder: EnvelopeBuilder::new(node()),
        }
    }

    async fn token(link: &MockLink, count: usize) -> String {
        let acks = link.wait_for(MessageType::RegisterAck, count, 500).await.unwrap();
        let ack: RegisterAck = acks[count - 1].payload_as().unwrap();
        ack.session_token
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let fx = start();
        fx.link.connect();
        fx.link.deliver(fx.builder.register("bench-01", "10.0.0.7", &[]));
        let token = token(&fx.link, 1).await;

        fx.link.deliver(fx.builder.heartbeat(&token, vec![available(1, 2)]));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = fx.registry.node(&node()).unwrap();
        assert_eq!(record.node.status, NodeStatus::Online);
        assert_eq!(record.devices.len(), 1);
        assert_eq!(fx.health.get_health(&fx.registry).mqtt_status, "connected");

        fx.cancel.cancel();
        fx.hub.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnecting_node_is_not_duplicated() {
        let fx = start();
        fx.link.connect();
        fx.link.deliver(fx.builder.register("bench-01", "10.0.0.7", &[]));
        let first = token(&fx.link, 1).await;

        // broker hiccup, then the node replays its registration
        fx.link.drop_connection();
        fx.link.connect();
        fx.link.deliver(fx.builder.heartbeat(&first, vec![]));
        fx.link.deliver(fx.builder.register("bench-01", "10.0.0.8", &[]));
        let second = token(&fx.link, 2).await;
        fx.link.deliver(fx.builder.heartbeat(&second, vec![available(1, 2)]));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let nodes = fx.registry.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node.address, "10.0.0.8");
        assert_eq!(nodes[0].devices.len(), 1);
        assert_eq!(fx.health.get_health(&fx.registry).mqtt_reconnects, 1);

        fx.cancel.cancel();
        fx.hub.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_session_gets_register_required() {
        let fx = start();
        fx.link.connect();
        fx.link.deliver(fx.builder.heartbeat("from-before-restart", vec![available(1, 2)]));

        let required = fx.link.wait_for(MessageType::RegisterRequired, 1, 500).await.unwrap();
        assert_eq!(required[0].node_id, node());
        assert!(fx.registry.node(&node()).is_none());

        fx.cancel.cancel();
        fx.hub.await.unwrap();
    }

    #[tokio::test]
    async fn test_one_session_per_node() {
        let fx = start();
        fx.link.connect();
        let other = EnvelopeBuilder::new(NodeId::parse("aa:bb:cc:dd:ee:02").unwrap());
        fx.link.deliver(fx.builder.register("bench-01", "10.0.0.7", &[]));
        fx.link.deliver(other.register("bench-02", "10.0.0.8", &[]));

        let acks = fx.link.wait_for(MessageType::RegisterAck, 2, 500).await.unwrap();
        let mut addressed: Vec<String> = acks.iter().map(|ack| ack.node_id.to_string()).collect();
        addressed.sort();
        assert_eq!(addressed, vec!["aa:bb:cc:dd:ee:01", "aa:bb:cc:dd:ee:02"]);
        assert_eq!(fx.registry.summary().online, 2);

        fx.cancel.cancel();
        fx.hub.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_sessions_are_reaped() {
        let (transport, _link) = mock_transport();
        let allowed = NodeId::parse("aa:bb:cc:dd:ee:02").unwrap();
        let events = Arc::new(RecordingNotifier::default());
        let ctx = Arc::new(SessionContext {
            registry: Arc::new(NodeRegistry::new(Duration::from_secs(15))),
            sink: transport.sink(),
            auth: Arc::new(AllowList::from_config(&[allowed.to_string()])),
            notifier: events.clone(),
        });
        let mut hub = Hub::new(transport, ctx, HealthTracker::new(), Backoff::fixed(Duration::from_millis(10)));
        let cancel = CancellationToken::new();
        let builder = EnvelopeBuilder::new(node());

        hub.route(builder.register("bench-01", "10.0.0.7", &[]), &cancel);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(hub.sessions[&node()].is_closed());

        hub.route(EnvelopeBuilder::new(allowed.clone()).register("bench-02", "10.0.0.8", &[]), &cancel);
        assert_eq!(hub.sessions.keys().collect::<Vec<_>>(), vec![&allowed]);

        // retrying after the rejection gets a fresh actor
        hub.route(builder.register("bench-01", "10.0.0.7", &[]), &cancel);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let rejected = events
            .events()
            .iter()
            .filter(|event| matches!(event, RegistryEvent::AuthRejected { .. }))
            .count();
        assert_eq!(rejected, 2);

        cancel.cancel();
        hub.drain().await;
    }
}
