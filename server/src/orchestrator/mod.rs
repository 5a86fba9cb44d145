//! Task Orchestrator
//!
//! Per-request state machine: classify, divide, select, dispatch, collect,
//! aggregate. One driver task per in-flight request owns all task state;
//! worker frames reach it through the [`TaskRouter`], node losses through
//! the registry's event channel.

mod divider;
mod driver;
mod task;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use iris_common::protocol::WorkerErrorKind;
use iris_common::{TaskFile, TaskMode};

use crate::classifier::Classifier;
use crate::config::Config;
use crate::direct::DirectProcessor;
use crate::registry::NodeRegistry;
use crate::reputation::ReputationEngine;
use crate::stream::StreamRegistry;

pub use task::{Subtask, TaskHandle};

/// Queue depth between protocol readers and one task driver.
const EVENT_CAPACITY: usize = 256;

/// Terminal task handles linger this long for polling before the janitor
/// drops them.
const TERMINAL_RETENTION: Duration = Duration::from_secs(3600);

/// A worker frame routed to the owning task driver.
#[derive(Debug)]
pub enum SubtaskEvent {
    Chunk { subtask_index: u32, seq: u64, payload: String, node_id: String },
    Result { subtask_index: u32, payload: String, elapsed_ms: u64, node_id: String },
    Error { subtask_index: u32, kind: WorkerErrorKind, detail: String, node_id: String },
}

/// Routes incoming worker frames to per-task driver queues.
pub struct TaskRouter {
    routes: DashMap<Uuid, mpsc::Sender<SubtaskEvent>>,
}

impl TaskRouter {
    #[must_use]
    pub fn new() -> Self {
        Self { routes: DashMap::new() }
    }

    fn register(&self, task_id: Uuid) -> mpsc::Receiver<SubtaskEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        self.routes.insert(task_id, tx);
        rx
    }

    fn deregister(&self, task_id: Uuid) {
        self.routes.remove(&task_id);
    }

    /// Deliver an event to the task's driver. Frames for finished or
    /// unknown tasks are dropped; late workers learn of cancellation via
    /// `task_cancel`, not via routing errors.
    pub async fn route(&self, task_id: Uuid, event: SubtaskEvent) {
        let sender = self.routes.get(&task_id).map(|entry| entry.clone());
        match sender {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    debug!(task_id = %task_id, "Driver gone; frame dropped");
                }
            }
            None => debug!(task_id = %task_id, "No route for frame; task finished?"),
        }
    }
}

impl Default for TaskRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Orchestrator errors surfaced at the submission boundary.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Prompt must not be empty")]
    EmptyPrompt,

    #[error("Coordinator is shutting down")]
    ShuttingDown,
}

/// A task submission from the HTTP boundary.
#[derive(Debug)]
pub struct SubmitRequest {
    pub prompt: String,
    pub mode: TaskMode,
    pub streaming: bool,
    pub files: Vec<TaskFile>,
    pub account_ref: String,
}

/// The request-orchestration engine. Owns every task and subtask.
pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<NodeRegistry>,
    streams: Arc<StreamRegistry>,
    classifier: Arc<Classifier>,
    direct: Arc<DirectProcessor>,
    reputation: ReputationEngine,
    pool: SqlitePool,
    router: Arc<TaskRouter>,
    tasks: DashMap<Uuid, Arc<TaskHandle>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        registry: Arc<NodeRegistry>,
        streams: Arc<StreamRegistry>,
        classifier: Arc<Classifier>,
        direct: Arc<DirectProcessor>,
        reputation: ReputationEngine,
        pool: SqlitePool,
    ) -> Self {
        Self {
            config,
            registry,
            streams,
            classifier,
            direct,
            reputation,
            pool,
            router: Arc::new(TaskRouter::new()),
            tasks: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Router shared with the worker gateway.
    #[must_use]
    pub fn router(&self) -> Arc<TaskRouter> {
        self.router.clone()
    }

    /// Accept a request: create the task, allocate its stream when asked
    /// for, and spawn the driver.
    pub fn submit(
        self: &Arc<Self>,
        request: SubmitRequest,
    ) -> Result<Arc<TaskHandle>, OrchestratorError> {
        if request.prompt.trim().is_empty() {
            return Err(OrchestratorError::EmptyPrompt);
        }
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }

        let handle = Arc::new(TaskHandle::new(
            request.mode,
            request.streaming,
            request.prompt,
            request.files,
            request.account_ref,
            &self.shutdown,
        ));

        let stream = request
            .streaming
            .then(|| self.streams.create(handle.id));

        self.tasks.insert(handle.id, handle.clone());
        let events = self.router.register(handle.id);

        info!(task_id = %handle.id, mode = ?handle.mode, streaming = handle.streaming, "Task accepted");

        let driver = driver::TaskDriver::new(
            self.config.clone(),
            self.registry.clone(),
            self.classifier.clone(),
            self.direct.clone(),
            self.reputation.clone(),
            self.pool.clone(),
            handle.clone(),
            stream,
        );
        let router = self.router.clone();
        let task_id = handle.id;
        tokio::spawn(async move {
            driver.run(events).await;
            router.deregister(task_id);
        });

        Ok(handle)
    }

    /// Look up a task for polling.
    #[must_use]
    pub fn get(&self, task_id: Uuid) -> Option<Arc<TaskHandle>> {
        self.tasks.get(&task_id).map(|t| t.clone())
    }

    /// Cancel a task. Idempotent; cancelling a terminal task is a no-op.
    /// Returns whether the task exists.
    #[must_use]
    pub fn cancel(&self, task_id: Uuid) -> bool {
        match self.tasks.get(&task_id) {
            Some(task) => {
                task.request_cancel();
                true
            }
            None => false,
        }
    }

    /// Number of tasks not yet terminal.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| !entry.value().status().is_terminal())
            .count()
    }

    /// Begin teardown: refuse new work and cancel every driver.
    pub fn begin_shutdown(&self) {
        info!(in_flight = self.in_flight(), "Orchestrator shutting down");
        self.shutdown.cancel();
    }

    /// Drop terminal handles past the retention window.
    fn sweep_terminal(&self) {
        self.tasks.retain(|_, task| {
            task.terminal_for().is_none_or(|age| age < TERMINAL_RETENTION)
        });
    }
}

/// Spawn the janitor that expires old terminal task handles.
pub fn spawn_task_janitor(
    orchestrator: Arc<Orchestrator>,
    sweep_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            orchestrator.sweep_terminal();
        }
    })
}

/// Terminal-status counters plus liveness numbers for the stats endpoint.
#[derive(Debug, serde::Serialize)]
pub struct NetworkStats {
    pub online_nodes: usize,
    pub in_flight_tasks: usize,
    pub tasks_by_status: std::collections::HashMap<String, i64>,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub nodes: Vec<NodeStat>,
}

#[derive(Debug, serde::Serialize)]
pub struct LeaderboardEntry {
    pub node_id: String,
    pub score: i64,
}

/// Per-node liveness row in the stats response.
#[derive(Debug, serde::Serialize)]
pub struct NodeStat {
    pub node_id: String,
    pub tier: iris_common::Tier,
    pub effective_load: u32,
    pub reputation: i64,
    pub uptime_seconds: u64,
}

impl Orchestrator {
    /// Network stats consumed by external monitoring.
    pub async fn network_stats(&self) -> NetworkStats {
        let tasks_by_status = crate::db::task_status_counts(&self.pool)
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();

        let leaderboard = self
            .reputation
            .leaderboard(self.config.leaderboard_size)
            .await
            .into_iter()
            .map(|(node_id, score)| LeaderboardEntry { node_id, score })
            .collect();

        let mut nodes: Vec<NodeStat> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|n| n.is_online)
            .map(|n| NodeStat {
                node_id: n.node_id,
                tier: n.tier,
                effective_load: n.effective_load,
                reputation: n.reputation,
                uptime_seconds: n.uptime_seconds,
            })
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        NetworkStats {
            online_nodes: self.registry.online_count().await,
            in_flight_tasks: self.in_flight(),
            tasks_by_status,
            leaderboard,
            nodes,
        }
    }

    /// Whether a submission should bypass workers entirely: an attachment
    /// carries a format the external document processor handles directly.
    #[must_use]
    pub(crate) fn is_direct_bypass(config: &Config, files: &[TaskFile]) -> bool {
        files.iter().any(|f| {
            f.extension()
                .is_some_and(|ext| config.direct_formats.iter().any(|d| *d == ext))
        })
    }
}
