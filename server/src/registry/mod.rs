//! Node Registry
//!
//! Tracks connected workers and answers selection queries. The registry is
//! the single authority translating node ids into live connection handles;
//! every other component refers to workers by id only.

mod reaper;
pub mod tier;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use iris_common::protocol::CoordinatorFrame;
use iris_common::{NodeCapabilities, Tier};

pub use reaper::spawn_heartbeat_reaper;

/// Capacity of the per-worker outgoing frame queue.
const OUTBOX_CAPACITY: usize = 64;

/// Events the registry emits to interested components (task drivers).
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A node's connection is gone; subtasks assigned to it are lost.
    NodeLost { node_id: String },
}

/// Why a node was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The socket closed or errored.
    ConnectionClosed,
    /// The heartbeat reaper declared the node dead.
    HeartbeatTimeout,
    /// A new connection for the same node id displaced this one.
    Displaced,
    /// The connection violated the protocol.
    ProtocolViolation,
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A live connection already owns this node id under another account.
    #[error("Node id already registered: {0}")]
    DuplicateId(String),

    /// The node is not (or no longer) connected.
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// The worker's send queue stayed full past the grace period.
    #[error("Send queue full for node {0}")]
    Backpressure(String),

    /// The worker's connection is closing.
    #[error("Connection closing for node {0}")]
    ConnectionClosing(String),
}

/// A live worker connection.
///
/// Load and heartbeat fields are mutated through the registry only; other
/// components read them via [`NodeSnapshot`].
#[derive(Debug)]
pub struct NodeHandle {
    pub node_id: String,
    pub account_ref: String,
    pub capabilities: NodeCapabilities,
    pub tier: Tier,
    /// Distinguishes this connection from a displaced predecessor.
    conn_id: u64,
    outbox: mpsc::Sender<CoordinatorFrame>,
    /// Cancelled when the registry drops this connection (displacement,
    /// reap, shutdown); the gateway loops watch it.
    closed: CancellationToken,
    current_load: AtomicU32,
    reputation: AtomicI64,
    last_heartbeat: Mutex<Instant>,
    uptime_seconds: AtomicU64,
}

impl NodeHandle {
    /// Connection generation id.
    #[must_use]
    pub const fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Signal observed by the connection's reader/writer loops.
    #[must_use]
    pub const fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Queue a frame without waiting. Used for acks on the protocol path;
    /// a full queue here just drops the ack, the next heartbeat retries.
    pub(crate) fn try_send(&self, frame: CoordinatorFrame) {
        let _ = self.outbox.try_send(frame);
    }

    /// In-flight subtasks plus the configured artificial offset.
    #[must_use]
    pub fn effective_load(&self) -> u32 {
        self.current_load.load(Ordering::Relaxed) + self.capabilities.artificial_load_offset
    }

    fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock().expect("heartbeat lock") = Instant::now();
    }

    fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().expect("heartbeat lock").elapsed()
    }
}

/// Immutable view of one node for selection and monitoring.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub tier: Tier,
    pub capabilities: NodeCapabilities,
    pub effective_load: u32,
    pub reputation: i64,
    pub is_online: bool,
    pub uptime_seconds: u64,
}

/// The set of connected workers.
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Arc<NodeHandle>>>,
    events: broadcast::Sender<RegistryEvent>,
    heartbeat_timeout: Duration,
    send_grace: Duration,
    conn_seq: AtomicU64,
}

impl NodeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(heartbeat_timeout: Duration, send_grace: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            nodes: RwLock::new(HashMap::new()),
            events,
            heartbeat_timeout,
            send_grace,
            conn_seq: AtomicU64::new(1),
        }
    }

    /// Subscribe to registry events. Each task driver holds a subscription
    /// for the duration of its task.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Insert a node after a successful handshake.
    ///
    /// A live connection under the same id is displaced when the new
    /// connection proves the same account; its in-flight subtasks surface as
    /// `NodeLost`. A different account is a `DuplicateId` error.
    pub async fn register(
        &self,
        node_id: String,
        account_ref: String,
        capabilities: NodeCapabilities,
        reputation: i64,
    ) -> Result<(Arc<NodeHandle>, mpsc::Receiver<CoordinatorFrame>), RegistryError> {
        let tier = tier::derive_tier(&capabilities);
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);

        let handle = Arc::new(NodeHandle {
            node_id: node_id.clone(),
            account_ref: account_ref.clone(),
            capabilities,
            tier,
            conn_id: self.conn_seq.fetch_add(1, Ordering::Relaxed),
            outbox,
            closed: CancellationToken::new(),
            current_load: AtomicU32::new(0),
            reputation: AtomicI64::new(reputation),
            last_heartbeat: Mutex::new(Instant::now()),
            uptime_seconds: AtomicU64::new(0),
        });

        let displaced = {
            let mut nodes = self.nodes.write().await;
            if let Some(incumbent) = nodes.get(&node_id) {
                if incumbent.account_ref != account_ref {
                    return Err(RegistryError::DuplicateId(node_id));
                }
                // Same account reconnecting: the old connection loses.
                let old = nodes.insert(node_id.clone(), handle.clone());
                old
            } else {
                nodes.insert(node_id.clone(), handle.clone());
                None
            }
        };

        if let Some(old) = displaced {
            info!(node_id = %node_id, old_conn = old.conn_id, "Displaced stale connection");
            old.closed.cancel();
            let _ = self.events.send(RegistryEvent::NodeLost { node_id: node_id.clone() });
        }

        info!(node_id = %node_id, tier = %tier, "Node registered");
        Ok((handle, outbox_rx))
    }

    /// Record a heartbeat. Unknown nodes are ignored (the reaper may have
    /// already swept the sender).
    pub async fn heartbeat(&self, node_id: &str, load: u32, uptime_seconds: u64) {
        let nodes = self.nodes.read().await;
        if let Some(node) = nodes.get(node_id) {
            node.touch_heartbeat();
            node.current_load.store(load, Ordering::Relaxed);
            node.uptime_seconds.store(uptime_seconds, Ordering::Relaxed);
            debug!(node_id = %node_id, load, "Heartbeat");
        }
    }

    /// Remove a node. Idempotent: removing an unknown node, or a connection
    /// generation that has already been displaced, is a no-op.
    pub async fn disconnect(&self, node_id: &str, conn_id: u64, reason: DisconnectReason) {
        let removed = {
            let mut nodes = self.nodes.write().await;
            match nodes.get(node_id) {
                Some(current) if current.conn_id == conn_id => nodes.remove(node_id),
                _ => None,
            }
        };

        if let Some(node) = removed {
            info!(node_id = %node_id, ?reason, "Node disconnected");
            node.closed.cancel();
            let _ = self.events.send(RegistryEvent::NodeLost { node_id: node_id.to_string() });
        }
    }

    /// Immutable view of every connected node.
    pub async fn snapshot(&self) -> Vec<NodeSnapshot> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .map(|n| NodeSnapshot {
                node_id: n.node_id.clone(),
                tier: n.tier,
                capabilities: n.capabilities.clone(),
                effective_load: n.effective_load(),
                reputation: n.reputation.load(Ordering::Relaxed),
                is_online: n.heartbeat_age() < self.heartbeat_timeout,
                uptime_seconds: n.uptime_seconds.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Look up a live handle.
    pub async fn get(&self, node_id: &str) -> Option<Arc<NodeHandle>> {
        self.nodes.read().await.get(node_id).cloned()
    }

    /// Number of connected nodes.
    pub async fn online_count(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Send a frame to a node, waiting up to the configured grace period
    /// for queue space. Backpressure past the grace is reported so callers
    /// can treat the node as lost.
    pub async fn send(&self, node_id: &str, frame: CoordinatorFrame) -> Result<(), RegistryError> {
        let node = self
            .get(node_id)
            .await
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;

        match node.outbox.send_timeout(frame, self.send_grace).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(node_id = %node_id, "Send queue full past grace period");
                Err(RegistryError::Backpressure(node_id.to_string()))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                Err(RegistryError::ConnectionClosing(node_id.to_string()))
            }
        }
    }

    /// Bump a node's in-flight load after a dispatch.
    pub async fn load_started(&self, node_id: &str) {
        if let Some(node) = self.get(node_id).await {
            node.current_load.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop a node's in-flight load after a terminal subtask event.
    /// Saturating: the count never goes below zero.
    pub async fn load_finished(&self, node_id: &str) {
        if let Some(node) = self.get(node_id).await {
            let _ = node
                .current_load
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        }
    }

    /// Mirror a score from the reputation store onto the live handle so
    /// selection sees it without crossing component boundaries.
    pub async fn mirror_reputation(&self, node_id: &str, score: i64) {
        if let Some(node) = self.get(node_id).await {
            node.reputation.store(score, Ordering::Relaxed);
        }
    }

    /// Node ids whose last heartbeat is older than the liveness timeout.
    pub(crate) async fn stale_nodes(&self) -> Vec<(String, u64)> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|n| n.heartbeat_age() > self.heartbeat_timeout)
            .map(|n| (n.node_id.clone(), n.conn_id))
            .collect()
    }

    /// Close every worker connection. Used during shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<NodeHandle>> = {
            let mut nodes = self.nodes.write().await;
            nodes.drain().map(|(_, n)| n).collect()
        };
        info!(count = drained.len(), "Closing all worker connections");
        for node in drained {
            node.closed.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_common::Quantization;

    fn caps(tps: f64, offset: u32) -> NodeCapabilities {
        NodeCapabilities {
            model_name: "llama3:34b".into(),
            params_billions: None,
            quantization: Quantization::Q4,
            vram_mb: 24_000,
            tokens_per_second: tps,
            vision: false,
            artificial_load_offset: offset,
        }
    }

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Duration::from_secs(45), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn register_assigns_tier_and_appears_in_snapshot() {
        let reg = registry();
        let (handle, _rx) = reg
            .register("n1".into(), "acct".into(), caps(40.0, 0), 100)
            .await
            .unwrap();
        assert_eq!(handle.tier, Tier::Pro);

        let snap = reg.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert!(snap[0].is_online);
        assert_eq!(snap[0].reputation, 100);
    }

    #[tokio::test]
    async fn duplicate_id_under_other_account_is_rejected() {
        let reg = registry();
        let _keep = reg
            .register("n1".into(), "acct-a".into(), caps(40.0, 0), 10)
            .await
            .unwrap();
        let err = reg
            .register("n1".into(), "acct-b".into(), caps(40.0, 0), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn same_account_displaces_and_emits_node_lost() {
        let reg = registry();
        let mut events = reg.subscribe();
        let (old, _old_rx) = reg
            .register("n1".into(), "acct".into(), caps(40.0, 0), 10)
            .await
            .unwrap();
        let (new, _new_rx) = reg
            .register("n1".into(), "acct".into(), caps(40.0, 0), 10)
            .await
            .unwrap();
        assert_ne!(old.conn_id(), new.conn_id());

        let RegistryEvent::NodeLost { node_id } = events.recv().await.unwrap();
        assert_eq!(node_id, "n1");

        // The old connection's disconnect must not remove the new one.
        reg.disconnect("n1", old.conn_id(), DisconnectReason::ConnectionClosed).await;
        assert_eq!(reg.online_count().await, 1);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let reg = registry();
        let (handle, _rx) = reg
            .register("n1".into(), "acct".into(), caps(40.0, 0), 10)
            .await
            .unwrap();
        reg.disconnect("n1", handle.conn_id(), DisconnectReason::ConnectionClosed).await;
        reg.disconnect("n1", handle.conn_id(), DisconnectReason::ConnectionClosed).await;
        assert_eq!(reg.online_count().await, 0);
    }

    #[tokio::test]
    async fn heartbeat_updates_are_idempotent() {
        let reg = registry();
        let _keep = reg
            .register("n1".into(), "acct".into(), caps(40.0, 0), 10)
            .await
            .unwrap();
        reg.heartbeat("n1", 3, 60).await;
        reg.heartbeat("n1", 3, 60).await;

        let snap = reg.snapshot().await;
        assert_eq!(snap[0].effective_load, 3);
    }

    #[tokio::test]
    async fn effective_load_includes_artificial_offset() {
        let reg = registry();
        let _keep = reg
            .register("fallback".into(), "acct".into(), caps(40.0, 5), 10)
            .await
            .unwrap();
        reg.load_started("fallback").await;

        let snap = reg.snapshot().await;
        assert_eq!(snap[0].effective_load, 6);
    }

    #[tokio::test]
    async fn load_never_goes_negative() {
        let reg = registry();
        let (handle, _rx) = reg
            .register("n1".into(), "acct".into(), caps(40.0, 0), 10)
            .await
            .unwrap();
        reg.load_finished("n1").await;
        assert_eq!(handle.effective_load(), 0);
    }
}
