//! Slave runtime: wires the periodic loops to the command channel
//!
//! Independent tasks, all stopped by one cancellation token:
//! link supervisor, channel writer, command consumer, discovery and
//! reconciliation, heartbeat, load reporter.

use crate::agent::DeviceAgent;
use crate::channel::{self, Channel, Outbox};
use crate::commands::CommandExecutor;
use crate::config::SlaveConfig;
use crate::devices::reconciler::DeviceTable;
use crate::devices::DeviceDiscovery;
use crate::metrics::LoadSampler;
use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use ncod_protocol::{
    HeartbeatPayload, MessageType, NodeId, RegisterPayload, StatusUpdate, TimingConfig, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OUTBOUND_CAPACITY: usize = 64;
const COMMAND_CAPACITY: usize = 16;

pub struct SlaveRuntime {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    table: Arc<Mutex<DeviceTable>>,
}

impl SlaveRuntime {
    pub fn start<T: Transport, A: DeviceAgent>(
        transport: T,
        agent: A,
        node_id: NodeId,
        registration: RegisterPayload,
        config: &SlaveConfig,
    ) -> Result<Self> {
        let timing = config.timing.clone();
        let cancel = CancellationToken::new();
        let table = Arc::new(Mutex::new(DeviceTable::new()));
        let discovery = Arc::new(
            DeviceDiscovery::new(agent, config.agent.resolve_serials).context("Failed to build listing parser")?,
        );

        let (outbox, outbound_rx) = channel::outbox(node_id.clone(), OUTBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);

        let sink = transport.sink();
        let writer = Channel::new(sink, node_id.clone(), registration, timing.registration_retry);
        let executor = CommandExecutor::new(
            discovery.clone(),
            table.clone(),
            outbox.clone(),
            timing.command_timeout,
            config.agent.password.clone(),
        );

        let tasks = vec![
            tokio::spawn(channel::supervise_link(transport, timing.reconnect(), events_tx, cancel.clone())),
            tokio::spawn(writer.run(events_rx, outbound_rx, commands_tx, cancel.clone())),
            tokio::spawn(executor.run(commands_rx, cancel.clone())),
            tokio::spawn(discovery_loop(discovery, table.clone(), outbox.clone(), timing.clone(), cancel.clone())),
            tokio::spawn(heartbeat_loop(table.clone(), outbox.clone(), timing.heartbeat_interval, cancel.clone())),
            tokio::spawn(load_loop(outbox, timing.load_report_interval, cancel.clone())),
        ];

        info!(node_id = %node_id, "Slave runtime started");
        Ok(Self { cancel, tasks, table })
    }

    pub fn devices(&self) -> Arc<Mutex<DeviceTable>> {
        self.table.clone()
    }

    /// Stops every loop and waits for them
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                warn!("Task ended abnormally: {e}");
            }
        }
        info!("Slave runtime stopped");
    }
}

fn periodic(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn discovery_loop<A: DeviceAgent>(
    discovery: Arc<DeviceDiscovery<A>>,
    table: Arc<Mutex<DeviceTable>>,
    outbox: Outbox,
    timing: TimingConfig,
    cancel: CancellationToken,
) {
    let mut ticker = periodic(timing.discovery_interval);
    // a whole cycle may issue several agent calls
    let cycle_budget = timing.command_timeout.max(timing.discovery_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let discovered = match tokio::time::timeout(cycle_budget, discovery.scan()).await {
            Ok(discovered) => discovered,
            Err(_) => {
                warn!("Discovery cycle timed out after {cycle_budget:?}");
                continue;
            }
        };

        let transitions = table.lock().await.reconcile(&discovered, Utc::now());
        for transition in transitions {
            info!(
                device_id = %transition.device.device_id,
                status = %transition.device.status,
                "Device {:?}", transition.kind
            );
            let device_id = transition.device.device_id.clone();
            match outbox
                .envelope(MessageType::StatusUpdate)
                .with_device(device_id)
                .with_payload(&StatusUpdate::from_report(transition.device))
            {
                Ok(envelope) => {
                    outbox.push(envelope);
                }
                Err(e) => warn!("Failed to encode status_update: {e}"),
            }
        }
    }
}

async fn heartbeat_loop(
    table: Arc<Mutex<DeviceTable>>,
    outbox: Outbox,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = periodic(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let devices = table.lock().await.reports();
        match outbox
            .envelope(MessageType::Heartbeat)
            .with_payload(&HeartbeatPayload { devices })
        {
            Ok(envelope) => {
                outbox.push(envelope);
            }
            Err(e) => warn!("Failed to encode heartbeat: {e}"),
        }
    }
}

async fn load_loop(outbox: Outbox, period: Duration, cancel: CancellationToken) {
    let mut ticker = periodic(period);
    let mut sampler = LoadSampler::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let report = sampler.sample();
        match outbox.envelope(MessageType::LoadReport).with_payload(&report) {
            Ok(envelope) => {
                outbox.push(envelope);
            }
            Err(e) => warn!("Failed to encode load_report: {e}"),
        }
    }
    debug!("Load reporter stopped");
}
