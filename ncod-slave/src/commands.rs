//! Inbound device commands
//!
//! Each `connect_device` / `disconnect_device` runs as its own task so a slow
//! agent never holds up the channel. The outcome is reported asynchronously
//! as a `status_update` correlated by `device_id`.

use crate::agent::{AgentError, DeviceAgent};
use crate::channel::Outbox;
use crate::devices::reconciler::DeviceTable;
use crate::devices::DeviceDiscovery;
use ncod_protocol::{CommandPayload, DeviceKey, DeviceReport, Envelope, MessageType, StatusUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct CommandExecutor<A> {
    discovery: Arc<DeviceDiscovery<A>>,
    table: Arc<Mutex<DeviceTable>>,
    outbox: Outbox,
    timeout: Duration,
    default_password: Option<String>,
}

impl<A> Clone for CommandExecutor<A> {
    fn clone(&self) -> Self {
        Self {
            discovery: self.discovery.clone(),
            table: self.table.clone(),
            outbox: self.outbox.clone(),
            timeout: self.timeout,
            default_password: self.default_password.clone(),
        }
    }
}

impl<A: DeviceAgent> CommandExecutor<A> {
    pub fn new(
        discovery: Arc<DeviceDiscovery<A>>,
        table: Arc<Mutex<DeviceTable>>,
        outbox: Outbox,
        timeout: Duration,
        default_password: Option<String>,
    ) -> Self {
        Self {
            discovery,
            table,
            outbox,
            timeout,
            default_password,
        }
    }

    /// Inbound-command consumer loop
    pub async fn run(self, mut commands: mpsc::Receiver<Envelope>, cancel: CancellationToken) {
        let mut running = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(envelope) = commands.recv() => {
                    let executor = self.clone();
                    running.spawn(async move { executor.execute(envelope).await });
                }
                Some(_) = running.join_next(), if !running.is_empty() => {}
            }
        }
        running.shutdown().await;
    }

    pub async fn execute(&self, envelope: Envelope) {
        let key = match envelope.require_device() {
            Ok(key) => key.clone(),
            Err(e) => {
                warn!("Dropping uncorrelatable command: {e}");
                return;
            }
        };

        match envelope.kind {
            MessageType::ConnectDevice => self.connect(&envelope, key).await,
            MessageType::DisconnectDevice => self.disconnect(key).await,
            other => warn!("Not a device command: {other}"),
        }
    }

    async fn connect(&self, envelope: &Envelope, key: DeviceKey) {
        let begun = self.table.lock().await.begin_claim(&key);
        let address = match begun {
            Ok(address) => address,
            Err(refusal) => {
                let current = self.table.lock().await.report(&key);
                self.report_failure(&key, refusal.to_string(), current);
                return;
            }
        };

        let password = envelope
            .payload_as::<CommandPayload>()
            .ok()
            .and_then(|p| p.password)
            .or_else(|| self.default_password.clone());

        info!(device_id = %key, user_id = ?envelope.user_id, "Claiming device");
        let outcome = self.bounded(self.discovery.claim(&address, password.as_deref())).await;

        let report = self
            .table
            .lock()
            .await
            .finish_claim(&key, envelope.user_id.clone(), outcome.is_ok());
        self.report_outcome(&key, outcome, report);
    }

    async fn disconnect(&self, key: DeviceKey) {
        let begun = self.table.lock().await.begin_release(&key);
        let address = match begun {
            Ok(address) => address,
            Err(refusal) => {
                let current = self.table.lock().await.report(&key);
                self.report_failure(&key, refusal.to_string(), current);
                return;
            }
        };

        info!(device_id = %key, "Releasing device");
        let outcome = self.bounded(self.discovery.release(&address)).await;

        let report = self.table.lock().await.finish_release(&key, outcome.is_ok());
        self.report_outcome(&key, outcome, report);
    }

    async fn bounded(
        &self,
        call: impl std::future::Future<Output = Result<(), AgentError>>,
    ) -> Result<(), AgentError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AgentError::Timeout(self.timeout)),
        }
    }

    fn report_outcome(&self, key: &DeviceKey, outcome: Result<(), AgentError>, report: Option<DeviceReport>) {
        match (outcome, report) {
            (Ok(()), Some(report)) => {
                info!(device_id = %key, status = %report.status, "Command succeeded");
                self.send(key, &StatusUpdate::from_report(report));
            }
            (Ok(()), None) => warn!(device_id = %key, "Device record disappeared during command"),
            (Err(e), report) => self.report_failure(key, e.to_string(), report),
        }
    }

    fn report_failure(&self, key: &DeviceKey, message: String, current: Option<DeviceReport>) {
        warn!(device_id = %key, "Command failed: {message}");
        self.send(key, &StatusUpdate::failed(message, current));
    }

    fn send(&self, key: &DeviceKey, update: &StatusUpdate) {
        match self
            .outbox
            .envelope(MessageType::StatusUpdate)
            .with_device(key.clone())
            .with_payload(update)
        {
            Ok(envelope) => {
                self.outbox.push(envelope);
            }
            Err(e) => warn!("Failed to encode status_update: {e}"),
        }
    }
}
