use crate::notify::{RegistryEvent, SharedNotifier};
use crate::registry::SharedRegistry;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Periodically demotes silent nodes to Offline. Timer-based only: nodes are
/// never probed.
pub async fn run_sweeper(
    registry: SharedRegistry,
    notifier: SharedNotifier,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("Starting liveness sweeper (every {interval:?})");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for node_id in registry.sweep_stale_nodes(OffsetDateTime::now_utc()) {
                    notifier.notify(&RegistryEvent::NodeOffline { node_id });
                }
            }
        }
    }
}
