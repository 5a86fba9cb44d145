//! Reputation Engine
//!
//! Event-driven score mutation behind a single-writer queue: every event
//! for every node flows through one task, so events for a node apply in
//! the order they were recorded. Scores are clamped to
//! `[floor, ceiling]`, mirrored onto live registry handles for selection,
//! and persisted as an append-only log plus a compacted snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use iris_common::ReputationEventKind;

use crate::db;
use crate::registry::NodeRegistry;

const COMMAND_CAPACITY: usize = 256;
const DECAY_PERIOD_DAYS: i64 = 7;

#[derive(Debug)]
enum Command {
    Record { node_id: String, kind: ReputationEventKind, at: DateTime<Utc> },
    Decay { now: DateTime<Utc> },
    Flush { ack: oneshot::Sender<()> },
}

#[derive(Debug, Clone, Copy)]
struct ScoreEntry {
    score: i64,
    last_decay: DateTime<Utc>,
}

/// Handle to the reputation store. Cheap to clone; all writes are
/// serialised through the engine task.
#[derive(Clone)]
pub struct ReputationEngine {
    tx: mpsc::Sender<Command>,
    scores: Arc<RwLock<HashMap<String, ScoreEntry>>>,
    floor: i64,
}

impl ReputationEngine {
    /// Load persisted scores and start the engine task.
    pub async fn start(
        pool: SqlitePool,
        registry: Arc<NodeRegistry>,
        floor: i64,
        ceiling: i64,
        decay_factor: f64,
    ) -> anyhow::Result<(Self, JoinHandle<()>)> {
        let mut loaded = HashMap::new();
        for row in db::load_reputation_scores(&pool).await? {
            loaded.insert(
                row.node_id,
                ScoreEntry { score: row.score, last_decay: row.last_decay_at },
            );
        }

        let scores = Arc::new(RwLock::new(loaded));
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);

        let engine = Self { tx, scores: scores.clone(), floor };
        let worker = EngineTask { pool, registry, scores, floor, ceiling, decay_factor };
        let handle = tokio::spawn(worker.run(rx));

        Ok((engine, handle))
    }

    /// Record an event against a node. Fire-and-forget; ordering among
    /// records from one caller is preserved by the queue.
    pub async fn record(&self, node_id: &str, kind: ReputationEventKind) {
        let command = Command::Record {
            node_id: node_id.to_string(),
            kind,
            at: Utc::now(),
        };
        if self.tx.send(command).await.is_err() {
            warn!(node_id = %node_id, "Reputation engine is gone; event dropped");
        }
    }

    /// Apply weekly decay to every node that is due.
    pub async fn decay(&self, now: DateTime<Utc>) {
        let _ = self.tx.send(Command::Decay { now }).await;
    }

    /// Current score for a node. Unknown nodes sit at the floor.
    pub async fn score(&self, node_id: &str) -> i64 {
        self.scores
            .read()
            .await
            .get(node_id)
            .map_or(self.floor, |e| e.score)
    }

    /// Top `n` nodes by score, best first.
    pub async fn leaderboard(&self, n: usize) -> Vec<(String, i64)> {
        let scores = self.scores.read().await;
        let mut board: Vec<(String, i64)> =
            scores.iter().map(|(id, e)| (id.clone(), e.score)).collect();
        board.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        board.truncate(n);
        board
    }

    /// Wait until every queued event has been applied and persisted.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush { ack }).await.is_ok() {
            let _ = done.await;
        }
    }
}

struct EngineTask {
    pool: SqlitePool,
    registry: Arc<NodeRegistry>,
    scores: Arc<RwLock<HashMap<String, ScoreEntry>>>,
    floor: i64,
    ceiling: i64,
    decay_factor: f64,
}

impl EngineTask {
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Record { node_id, kind, at } => {
                    self.apply_event(&node_id, kind, at).await;
                }
                Command::Decay { now } => self.apply_decay(now).await,
                Command::Flush { ack } => {
                    let _ = ack.send(());
                }
            }
        }
        debug!("Reputation engine stopped");
    }

    async fn apply_event(&self, node_id: &str, kind: ReputationEventKind, at: DateTime<Utc>) {
        let new_score = {
            let mut scores = self.scores.write().await;
            let entry = scores
                .entry(node_id.to_string())
                .or_insert(ScoreEntry { score: self.floor, last_decay: at });
            entry.score = (entry.score + kind.points()).clamp(self.floor, self.ceiling);
            entry.score
        };

        debug!(node_id = %node_id, kind = kind.as_str(), score = new_score, "Reputation event");
        self.registry.mirror_reputation(node_id, new_score).await;

        if let Err(e) =
            db::insert_reputation_event(&self.pool, node_id, kind.as_str(), kind.points(), at).await
        {
            warn!(error = %e, "Failed to append reputation event");
        }
        self.persist_score(node_id).await;
    }

    async fn apply_decay(&self, now: DateTime<Utc>) {
        let due: Vec<String> = {
            let scores = self.scores.read().await;
            scores
                .iter()
                .filter(|(_, e)| (now - e.last_decay).num_days() >= DECAY_PERIOD_DAYS)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for node_id in due {
            let new_score = {
                let mut scores = self.scores.write().await;
                let Some(entry) = scores.get_mut(&node_id) else { continue };
                entry.score = ((entry.score as f64 * self.decay_factor) as i64)
                    .clamp(self.floor, self.ceiling);
                entry.last_decay = now;
                entry.score
            };

            debug!(node_id = %node_id, score = new_score, "Weekly decay applied");
            self.registry.mirror_reputation(&node_id, new_score).await;

            if let Err(e) = db::insert_reputation_event(
                &self.pool,
                &node_id,
                ReputationEventKind::WeeklyDecay.as_str(),
                0,
                now,
            )
            .await
            {
                warn!(error = %e, "Failed to append decay event");
            }
            self.persist_score(&node_id).await;
        }
    }

    async fn persist_score(&self, node_id: &str) {
        let entry = {
            let scores = self.scores.read().await;
            scores.get(node_id).copied()
        };
        if let Some(entry) = entry {
            if let Err(e) =
                db::upsert_reputation_score(&self.pool, node_id, entry.score, entry.last_decay)
                    .await
            {
                warn!(error = %e, "Failed to persist reputation snapshot");
            }
        }
    }
}

/// Hourly sweep: credit uptime to connected nodes, charge broken promises
/// to persisted-but-unreachable nodes, and trigger weekly decay.
pub fn spawn_reputation_sweeper(
    engine: ReputationEngine,
    registry: Arc<NodeRegistry>,
    pool: SqlitePool,
    sweep_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a freshly started
        // coordinator does not charge promises before anyone can connect.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let online: std::collections::HashSet<String> = registry
                .snapshot()
                .await
                .into_iter()
                .filter(|n| n.is_online)
                .map(|n| n.node_id)
                .collect();

            for node_id in &online {
                engine.record(node_id, ReputationEventKind::UptimeHour).await;
            }

            match db::list_node_metadata(&pool).await {
                Ok(rows) => {
                    for row in rows {
                        if !online.contains(&row.node_id) {
                            engine.record(&row.node_id, ReputationEventKind::BrokenPromise).await;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Broken-promise sweep could not list metadata"),
            }

            engine.decay(Utc::now()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> (ReputationEngine, JoinHandle<()>, SqlitePool) {
        let pool = crate::db::create_pool("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let registry = Arc::new(NodeRegistry::new(
            Duration::from_secs(45),
            Duration::from_millis(100),
        ));
        let (engine, handle) = ReputationEngine::start(pool.clone(), registry, 10, 1000, 0.99)
            .await
            .unwrap();
        (engine, handle, pool)
    }

    #[tokio::test]
    async fn unknown_node_sits_at_floor() {
        let (engine, _handle, _pool) = engine().await;
        assert_eq!(engine.score("nobody").await, 10);
    }

    #[tokio::test]
    async fn completion_raises_score() {
        let (engine, _handle, _pool) = engine().await;
        engine.record("n1", ReputationEventKind::TaskCompleted).await;
        engine.record("n1", ReputationEventKind::FastCompletion).await;
        engine.flush().await;
        assert_eq!(engine.score("n1").await, 25);
    }

    #[tokio::test]
    async fn score_never_drops_below_floor() {
        let (engine, _handle, _pool) = engine().await;
        engine.record("n1", ReputationEventKind::InvalidResponse).await;
        engine.record("n1", ReputationEventKind::InvalidResponse).await;
        engine.flush().await;
        assert_eq!(engine.score("n1").await, 10);
    }

    #[tokio::test]
    async fn score_clamps_at_ceiling() {
        let (engine, _handle, _pool) = engine().await;
        for _ in 0..200 {
            engine.record("n1", ReputationEventKind::TaskCompleted).await;
        }
        engine.flush().await;
        assert_eq!(engine.score("n1").await, 1000);
    }

    #[tokio::test]
    async fn decay_applies_only_after_a_week() {
        let (engine, _handle, _pool) = engine().await;
        engine.record("n1", ReputationEventKind::TaskCompleted).await;
        for _ in 0..20 {
            engine.record("n1", ReputationEventKind::TaskCompleted).await;
        }
        engine.flush().await;
        let before = engine.score("n1").await;

        // Not yet due.
        engine.decay(Utc::now()).await;
        engine.flush().await;
        assert_eq!(engine.score("n1").await, before);

        // Due a week from now.
        engine.decay(Utc::now() + chrono::Duration::days(8)).await;
        engine.flush().await;
        let after = engine.score("n1").await;
        assert_eq!(after, (before as f64 * 0.99) as i64);
    }

    #[tokio::test]
    async fn events_survive_in_the_log(){
        let (engine, _handle, pool) = engine().await;
        engine.record("n1", ReputationEventKind::Timeout).await;
        engine.flush().await;

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT kind, points FROM reputation_events WHERE node_id = 'n1'")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(rows, vec![("timeout".to_string(), -20)]);
    }

    #[tokio::test]
    async fn restart_reloads_compacted_scores() {
        let pool = crate::db::create_pool("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let registry = Arc::new(NodeRegistry::new(
            Duration::from_secs(45),
            Duration::from_millis(100),
        ));

        let (engine, handle) =
            ReputationEngine::start(pool.clone(), registry.clone(), 10, 1000, 0.99)
                .await
                .unwrap();
        engine.record("n1", ReputationEventKind::TaskCompleted).await;
        engine.flush().await;
        drop(engine);
        handle.await.unwrap();

        let (engine, _handle) = ReputationEngine::start(pool, registry, 10, 1000, 0.99)
            .await
            .unwrap();
        assert_eq!(engine.score("n1").await, 20);
    }
}
