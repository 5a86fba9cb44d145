//! Heartbeat Reaper
//!
//! Periodic sweep removing nodes whose last heartbeat is older than the
//! liveness timeout. Removal surfaces as `NodeLost` so task drivers can
//! reassign work before anything else happens to it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use super::{DisconnectReason, NodeRegistry};

/// Spawn the reaper task. Sweeps at the heartbeat interval; the registry
/// itself applies the 3x timeout when judging staleness.
pub fn spawn_heartbeat_reaper(
    registry: Arc<NodeRegistry>,
    sweep_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            for (node_id, conn_id) in registry.stale_nodes().await {
                warn!(node_id = %node_id, "Reaping node: heartbeat timeout");
                registry
                    .disconnect(&node_id, conn_id, DisconnectReason::HeartbeatTimeout)
                    .await;
            }
        }
    })
}
