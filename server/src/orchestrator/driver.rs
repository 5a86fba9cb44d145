//! Task Driver
//!
//! One driver per in-flight task. The driver is the only writer of the
//! task's state: it classifies, divides, dispatches, collects worker
//! events, enforces both timeout layers, reassigns lost attempts and
//! aggregates the final answer. Every suspension point is cancellable
//! through the task's cancellation token.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use iris_common::protocol::{CoordinatorFrame, StreamFrame};
use iris_common::{
    Difficulty, FailureReason, ReputationEventKind, SubtaskState, TaskMode, TaskStatus,
};

use super::{divider, Orchestrator, Subtask, SubtaskEvent, TaskHandle};
use crate::aggregator;
use crate::classifier::Classifier;
use crate::config::Config;
use crate::db;
use crate::direct::DirectProcessor;
use crate::registry::{NodeRegistry, RegistryEvent};
use crate::reputation::ReputationEngine;
use crate::scheduler;
use crate::stream::TaskStream;

/// Results larger than this fail integrity validation.
const MAX_RESULT_BYTES: usize = 1 << 20;

/// Deadline sweep granularity inside the event loop.
const TICK_MS: u64 = 250;

pub(super) struct TaskDriver {
    config: Arc<Config>,
    registry: Arc<NodeRegistry>,
    classifier: Arc<Classifier>,
    direct: Arc<DirectProcessor>,
    reputation: ReputationEngine,
    pool: SqlitePool,
    handle: Arc<TaskHandle>,
    stream: Option<Arc<TaskStream>>,
    subtasks: Vec<Subtask>,
    difficulty: Difficulty,
    task_deadline: Instant,
    /// Every node that served an attempt, for the history row.
    participants: HashSet<String>,
    /// Reason behind the most recent subtask failure.
    last_failure: Option<FailureReason>,
}

impl TaskDriver {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        config: Arc<Config>,
        registry: Arc<NodeRegistry>,
        classifier: Arc<Classifier>,
        direct: Arc<DirectProcessor>,
        reputation: ReputationEngine,
        pool: SqlitePool,
        handle: Arc<TaskHandle>,
        stream: Option<Arc<TaskStream>>,
    ) -> Self {
        Self {
            config,
            registry,
            classifier,
            direct,
            reputation,
            pool,
            handle,
            stream,
            subtasks: Vec::new(),
            difficulty: Difficulty::Simple,
            task_deadline: Instant::now(),
            participants: HashSet::new(),
            last_failure: None,
        }
    }

    /// Drive the task to a terminal status.
    pub(super) async fn run(mut self, mut events: mpsc::Receiver<SubtaskEvent>) {
        let cancel = self.handle.cancel_token().clone();

        let cancelled = tokio::select! {
            () = cancel.cancelled() => true,
            () = self.execute(&mut events) => false,
        };

        if cancelled {
            self.finish_cancelled().await;
        }

        debug!(task_id = %self.handle.id, status = %self.handle.status(), "Driver finished");
    }

    async fn execute(&mut self, events: &mut mpsc::Receiver<SubtaskEvent>) {
        self.handle.set_status(TaskStatus::Classifying);

        // Document bypass skips classification and node selection entirely.
        if self.handle.mode == TaskMode::Direct
            || Orchestrator::is_direct_bypass(&self.config, &self.handle.files)
        {
            self.run_direct().await;
            return;
        }

        self.difficulty = self
            .classifier
            .classify(&self.handle.prompt, &self.handle.files)
            .await;
        self.handle.set_difficulty(self.difficulty);
        self.task_deadline = Instant::now()
            + self.config.difficulty_timeout_s.for_difficulty(self.difficulty);

        info!(task_id = %self.handle.id, difficulty = %self.difficulty, "Task classified");

        let fragments = divider::divide(self.handle.mode, &self.handle.prompt, &self.config);
        self.subtasks = fragments
            .into_iter()
            .enumerate()
            .map(|(i, prompt)| Subtask::new(i as u32, prompt))
            .collect();

        // Subscribe before dispatch so no loss goes unseen.
        let mut registry_events = self.registry.subscribe();

        for index in 0..self.subtasks.len() {
            if !self.dispatch_subtask(index).await {
                // Capacity error at dispatch time fails the task immediately.
                warn!(task_id = %self.handle.id, "No eligible node at dispatch");
                self.finish_failed(FailureReason::NoNodes).await;
                return;
            }
        }
        self.handle.set_status(TaskStatus::Dispatched);

        self.collect(events, &mut registry_events).await;
    }

    /// Event loop: worker frames, node losses, deadline sweeps.
    async fn collect(
        &mut self,
        events: &mut mpsc::Receiver<SubtaskEvent>,
        registry_events: &mut broadcast::Receiver<RegistryEvent>,
    ) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(TICK_MS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.all_terminal() {
            tokio::select! {
                Some(event) = events.recv() => self.on_event(event).await,

                result = registry_events.recv() => match result {
                    Ok(RegistryEvent::NodeLost { node_id }) => {
                        self.on_node_lost(&node_id).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.audit_assignments().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Registry gone; shutdown cancellation follows.
                        tokio::time::sleep(std::time::Duration::from_millis(TICK_MS)).await;
                    }
                },

                _ = ticker.tick() => {
                    if Instant::now() >= self.task_deadline {
                        self.finish_timed_out().await;
                        return;
                    }
                    self.sweep_attempt_deadlines().await;
                }
            }
        }

        self.finalize().await;
    }

    async fn on_event(&mut self, event: SubtaskEvent) {
        match event {
            SubtaskEvent::Chunk { subtask_index, seq, payload, node_id } => {
                let index = subtask_index as usize;
                let Some(subtask) = self.subtasks.get_mut(index) else { return };
                if subtask.state.is_terminal()
                    || subtask.assigned_node.as_deref() != Some(node_id.as_str())
                {
                    // Frame from a superseded attempt; the consumer already
                    // saw the attempt-restart marker.
                    return;
                }

                subtask.state = SubtaskState::Streaming;
                subtask.buffer.push_str(&payload);
                subtask.last_seq = Some(seq);
                self.handle.set_status(TaskStatus::Streaming);

                if let Some(stream) = &self.stream {
                    stream.push(StreamFrame::Chunk {
                        subtask_index,
                        seq,
                        payload,
                        is_terminal: false,
                    });
                    subtask.streamed = true;
                }
            }

            SubtaskEvent::Result { subtask_index, payload, elapsed_ms, node_id } => {
                let index = subtask_index as usize;
                let Some(subtask) = self.subtasks.get_mut(index) else { return };
                if subtask.state.is_terminal()
                    || subtask.assigned_node.as_deref() != Some(node_id.as_str())
                {
                    return;
                }

                if payload.trim().is_empty() || payload.len() > MAX_RESULT_BYTES {
                    warn!(task_id = %self.handle.id, subtask_index, node_id = %node_id,
                        "Result failed validation");
                    self.registry.load_finished(&node_id).await;
                    self.reputation
                        .record(&node_id, ReputationEventKind::InvalidResponse)
                        .await;
                    self.fail_subtask(index, FailureReason::InvalidResponse);
                    return;
                }

                let attempt_elapsed = subtask.started_at.map(|t| t.elapsed());
                let streamed_this_attempt = !subtask.buffer.is_empty();
                let terminal_seq = subtask.last_seq.map_or(0, |s| s + 1);
                subtask.state = SubtaskState::Completed;
                subtask.result = Some(payload.clone());
                subtask.completed_by = Some(node_id.clone());
                subtask.assigned_node = None;
                subtask.attempt_deadline = None;

                debug!(task_id = %self.handle.id, subtask_index, node_id = %node_id,
                    elapsed_ms, "Subtask completed");

                self.registry.load_finished(&node_id).await;

                if let Some(stream) = &self.stream {
                    stream.push(StreamFrame::Chunk {
                        subtask_index,
                        seq: terminal_seq,
                        // Workers that streamed already delivered the text.
                        payload: if streamed_this_attempt { String::new() } else { payload },
                        is_terminal: true,
                    });
                }

                self.reputation
                    .record(&node_id, ReputationEventKind::TaskCompleted)
                    .await;
                let fast_budget = self
                    .config
                    .difficulty_timeout_s
                    .for_difficulty(self.difficulty)
                    .mul_f64(self.config.fast_completion_ratio);
                if attempt_elapsed.is_some_and(|elapsed| elapsed < fast_budget) {
                    self.reputation
                        .record(&node_id, ReputationEventKind::FastCompletion)
                        .await;
                }
            }

            SubtaskEvent::Error { subtask_index, kind, detail, node_id } => {
                let index = subtask_index as usize;
                let Some(subtask) = self.subtasks.get(index) else { return };
                if subtask.state.is_terminal()
                    || subtask.assigned_node.as_deref() != Some(node_id.as_str())
                {
                    return;
                }

                warn!(task_id = %self.handle.id, subtask_index, node_id = %node_id,
                    ?kind, detail = %detail, "Worker reported error");
                self.registry.load_finished(&node_id).await;
                self.attempt_failed(index, FailureReason::WorkerError).await;
            }
        }
    }

    /// NODE_LOST: every subtask assigned to the node loses its attempt
    /// before any reassignment happens.
    async fn on_node_lost(&mut self, node_id: &str) {
        let affected: Vec<usize> = self
            .subtasks
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                !s.state.is_terminal() && s.assigned_node.as_deref() == Some(node_id)
            })
            .map(|(i, _)| i)
            .collect();

        if affected.is_empty() {
            return;
        }

        info!(task_id = %self.handle.id, node_id = %node_id, subtasks = affected.len(),
            "Node lost with in-flight subtasks");
        self.reputation.record(node_id, ReputationEventKind::Timeout).await;

        for index in affected {
            self.attempt_failed(index, FailureReason::WorkerError).await;
        }
    }

    /// After a lagged event stream, re-check every assignment against the
    /// live registry.
    async fn audit_assignments(&mut self) {
        let assigned: Vec<(usize, String)> = self
            .subtasks
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.state.is_terminal())
            .filter_map(|(i, s)| s.assigned_node.clone().map(|n| (i, n)))
            .collect();

        for (index, node_id) in assigned {
            if self.registry.get(&node_id).await.is_none() {
                self.attempt_failed(index, FailureReason::WorkerError).await;
            }
        }
    }

    async fn sweep_attempt_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<usize> = self
            .subtasks
            .iter()
            .enumerate()
            .filter(|(_, s)| s.attempt_expired(now))
            .map(|(i, _)| i)
            .collect();

        for index in expired {
            if let Some(node_id) = self.subtasks[index].assigned_node.clone() {
                warn!(task_id = %self.handle.id, subtask_index = index, node_id = %node_id,
                    "Attempt deadline expired");
                self.reputation.record(&node_id, ReputationEventKind::Timeout).await;
                let _ = self
                    .registry
                    .send(
                        &node_id,
                        CoordinatorFrame::TaskCancel {
                            task_id: self.handle.id,
                            subtask_index: index as u32,
                        },
                    )
                    .await;
                self.registry.load_finished(&node_id).await;
            }
            self.attempt_failed(index, FailureReason::Timeout).await;
        }
    }

    /// Reassign-or-fail after a lost or failed attempt.
    async fn attempt_failed(&mut self, index: usize, reason: FailureReason) {
        let max_attempts = self.config.max_attempts_per_subtask;
        let subtask = &mut self.subtasks[index];
        if subtask.state.is_terminal() {
            return;
        }

        subtask.assigned_node = None;
        subtask.buffer.clear();
        subtask.last_seq = None;
        subtask.attempt_deadline = None;

        if subtask.attempts >= max_attempts {
            self.fail_subtask(index, specific_reason(reason));
            return;
        }

        subtask.state = SubtaskState::Reassigned;
        let restart_marker = subtask.streamed;
        let attempt = subtask.attempts + 1;

        if restart_marker {
            if let Some(stream) = &self.stream {
                stream.push(StreamFrame::AttemptRestart {
                    subtask_index: index as u32,
                    attempt,
                });
            }
        }

        if !self.dispatch_subtask(index).await {
            self.fail_subtask(index, specific_reason(reason));
        }
    }

    fn fail_subtask(&mut self, index: usize, reason: FailureReason) {
        let subtask = &mut self.subtasks[index];
        subtask.state = SubtaskState::Failed;
        subtask.assigned_node = None;
        subtask.attempt_deadline = None;
        self.last_failure = Some(reason);
    }

    /// Select a node and send the assignment. Nodes whose send queue is
    /// already wedged are skipped like lost nodes. Returns false when no
    /// eligible node accepted the frame.
    async fn dispatch_subtask(&mut self, index: usize) -> bool {
        loop {
            let exclude = self.subtasks[index].attempted_nodes.clone();
            let snapshot = self.registry.snapshot().await;
            let picked = scheduler::select(
                &snapshot,
                self.difficulty,
                1,
                &exclude,
                &self.config.selection_weights,
            );
            let Some(node) = picked.into_iter().next() else {
                return false;
            };

            let now = Instant::now();
            let attempt_deadline =
                (now + self.config.subtask_deadline(self.difficulty)).min(self.task_deadline);
            let deadline_ms = attempt_deadline
                .saturating_duration_since(now)
                .as_millis() as u64;

            let frame = CoordinatorFrame::TaskAssign {
                task_id: self.handle.id,
                subtask_index: index as u32,
                prompt: self.subtasks[index].prompt.clone(),
                files: self.handle.files.clone(),
                streaming: self.handle.streaming,
                deadline_ms,
            };

            match self.registry.send(&node.node_id, frame).await {
                Ok(()) => {
                    let subtask = &mut self.subtasks[index];
                    subtask.assigned_node = Some(node.node_id.clone());
                    subtask.attempted_nodes.insert(node.node_id.clone());
                    subtask.attempts += 1;
                    subtask.state = SubtaskState::Assigned;
                    subtask.started_at = Some(now);
                    subtask.attempt_deadline = Some(attempt_deadline);
                    self.participants.insert(node.node_id.clone());
                    self.registry.load_started(&node.node_id).await;
                    debug!(task_id = %self.handle.id, subtask_index = index,
                        node_id = %node.node_id, attempt = subtask.attempts, "Subtask dispatched");
                    return true;
                }
                Err(e) => {
                    warn!(task_id = %self.handle.id, node_id = %node.node_id, error = %e,
                        "Dispatch send failed; trying next candidate");
                    self.subtasks[index].attempted_nodes.insert(node.node_id);
                }
            }
        }
    }

    fn all_terminal(&self) -> bool {
        self.subtasks.iter().all(|s| s.state.is_terminal())
    }

    /// Combine completed subtasks into the final answer per the outcome
    /// policy and record the terminal status.
    async fn finalize(&mut self) {
        let completed = self
            .subtasks
            .iter()
            .filter(|s| s.state == SubtaskState::Completed)
            .count();
        let total = self.subtasks.len();

        let (status, answer) = match self.handle.mode {
            TaskMode::Consensus => self.finalize_consensus(completed).await,
            TaskMode::Context => {
                let windows: Vec<Option<String>> =
                    self.subtasks.iter().map(|s| s.result.clone()).collect();
                let (answer, gaps) =
                    aggregator::aggregate_context(&windows, self.config.context_overlap_tokens);
                match (completed, gaps) {
                    (0, _) => (TaskStatus::Failed, None),
                    (_, false) => (TaskStatus::Completed, Some(answer)),
                    (_, true) => (TaskStatus::Partial, Some(answer)),
                }
            }
            TaskMode::Subtasks | TaskMode::Direct => {
                let parts: Vec<Option<String>> =
                    self.subtasks.iter().map(|s| s.result.clone()).collect();
                let (answer, gaps) = aggregator::aggregate_subtasks(&parts);
                match (completed, gaps) {
                    (0, _) => (TaskStatus::Failed, None),
                    (_, false) => (TaskStatus::Completed, Some(answer)),
                    (_, true) => (TaskStatus::Partial, Some(answer)),
                }
            }
        };

        if let Some(answer) = answer {
            self.handle.set_result(answer);
        }
        if status != TaskStatus::Completed {
            if let Some(reason) = self.last_failure {
                self.handle.set_reason(reason);
            }
        }

        let status = match (status, self.last_failure) {
            (TaskStatus::Failed, Some(FailureReason::Timeout)) => TaskStatus::TimedOut,
            (status, _) => status,
        };
        self.handle.set_status(status);

        info!(task_id = %self.handle.id, status = %status, completed, total, "Task finished");

        self.close_stream(status);
        self.record_history().await;
    }

    async fn finalize_consensus(&mut self, completed: usize) -> (TaskStatus, Option<String>) {
        let quorum = (self.subtasks.len() + 1) / 2;
        if completed < quorum.max(1) {
            return (TaskStatus::Failed, None);
        }

        let mut replies = Vec::with_capacity(completed);
        for subtask in &self.subtasks {
            if let (Some(result), Some(producer)) = (&subtask.result, &subtask.completed_by) {
                let score = self.reputation.score(producer).await;
                replies.push((producer.clone(), result.clone(), score));
            }
        }

        let Some(outcome) = aggregator::aggregate_consensus(
            &replies,
            self.config.consensus_similarity_threshold,
        ) else {
            return (TaskStatus::Failed, None);
        };

        if self.config.consensus_penalty_enabled {
            for dissenter in &outcome.dissenters {
                self.reputation
                    .record(dissenter, ReputationEventKind::InvalidResponse)
                    .await;
            }
        }

        (TaskStatus::Completed, Some(outcome.answer))
    }

    /// Direct bypass: the external document processor answers; registered
    /// nodes are never involved and no reputation events are recorded.
    async fn run_direct(&mut self) {
        self.handle.set_status(TaskStatus::Dispatched);
        info!(task_id = %self.handle.id, "Direct bypass dispatch");

        let stream = self.stream.clone();
        let mut seq = 0_u64;
        let result = self
            .direct
            .process(&self.handle.prompt, &self.handle.files, |chunk| {
                if let Some(stream) = &stream {
                    stream.push(StreamFrame::Chunk {
                        subtask_index: 0,
                        seq,
                        payload: chunk,
                        is_terminal: false,
                    });
                    seq += 1;
                }
            })
            .await;

        match result {
            Ok(answer) => {
                if let Some(stream) = &self.stream {
                    stream.push(StreamFrame::Chunk {
                        subtask_index: 0,
                        seq,
                        payload: if seq == 0 { answer.clone() } else { String::new() },
                        is_terminal: true,
                    });
                    stream.close();
                }
                self.handle.set_result(answer);
                self.handle.set_status(TaskStatus::Completed);
            }
            Err(e) => {
                warn!(task_id = %self.handle.id, error = %e, "Direct processing failed");
                self.handle.set_reason(FailureReason::WorkerError);
                self.handle.set_status(TaskStatus::Failed);
                if let Some(stream) = &self.stream {
                    stream.close_error("WORKER_ERROR");
                }
            }
        }

        self.record_history().await;
    }

    /// Task deadline expired: cancel surviving attempts, charge timeouts.
    async fn finish_timed_out(&mut self) {
        warn!(task_id = %self.handle.id, "Task deadline expired");
        self.handle.set_reason(FailureReason::Timeout);
        self.handle.set_status(TaskStatus::TimedOut);
        self.abort_survivors(SubtaskState::Failed, true).await;
        self.close_stream(TaskStatus::TimedOut);
        self.record_history().await;
    }

    async fn finish_failed(&mut self, reason: FailureReason) {
        self.handle.set_reason(reason);
        self.handle.set_status(TaskStatus::Failed);
        self.abort_survivors(SubtaskState::Failed, false).await;
        self.close_stream(TaskStatus::Failed);
        self.record_history().await;
    }

    async fn finish_cancelled(&mut self) {
        info!(task_id = %self.handle.id, "Task cancelled");
        self.handle.set_reason(FailureReason::Cancelled);
        self.handle.set_status(TaskStatus::Cancelled);
        self.abort_survivors(SubtaskState::Cancelled, false).await;
        self.close_stream(TaskStatus::Cancelled);
        self.record_history().await;
    }

    /// Transition non-terminal subtasks, best-effort cancel their workers
    /// and release their load.
    async fn abort_survivors(&mut self, into: SubtaskState, charge_timeout: bool) {
        let survivors: Vec<(usize, Option<String>)> = self
            .subtasks
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.state.is_terminal())
            .map(|(i, s)| (i, s.assigned_node.clone()))
            .collect();

        for (index, node_id) in survivors {
            if let Some(node_id) = node_id {
                let _ = self
                    .registry
                    .send(
                        &node_id,
                        CoordinatorFrame::TaskCancel {
                            task_id: self.handle.id,
                            subtask_index: index as u32,
                        },
                    )
                    .await;
                self.registry.load_finished(&node_id).await;
                if charge_timeout {
                    self.reputation.record(&node_id, ReputationEventKind::Timeout).await;
                }
            }
            let subtask = &mut self.subtasks[index];
            subtask.state = into;
            subtask.assigned_node = None;
            subtask.attempt_deadline = None;
        }
    }

    fn close_stream(&self, status: TaskStatus) {
        let Some(stream) = &self.stream else { return };
        match status {
            TaskStatus::Completed => stream.close(),
            TaskStatus::Cancelled => stream.close_aborted(),
            _ => {
                let reason = self
                    .handle
                    .reason()
                    .map_or_else(|| status.to_string().to_uppercase(), |r| r.to_string());
                stream.close_error(&reason);
            }
        }
    }

    async fn record_history(&self) {
        let mut nodes: Vec<String> = self.participants.iter().cloned().collect();
        nodes.sort();

        let row = db::TaskHistoryRow {
            task_id: self.handle.id.to_string(),
            mode: format!("{:?}", self.handle.mode).to_lowercase(),
            difficulty: self.handle.difficulty().map(|d| d.to_string()),
            created_at: self.handle.created_at,
            terminal_status: self.handle.status().to_string(),
            duration_ms: (chrono::Utc::now() - self.handle.created_at).num_milliseconds(),
            participating_nodes: nodes.join(","),
        };

        if let Err(e) = db::insert_task_history(&self.pool, &row).await {
            warn!(task_id = %self.handle.id, error = %e, "Failed to record task history");
        }
    }
}

/// Timeouts and worker errors explain a dead subtask better than the
/// generic attempts-exhausted bookkeeping.
const fn specific_reason(cause: FailureReason) -> FailureReason {
    match cause {
        FailureReason::Timeout | FailureReason::WorkerError => cause,
        _ => FailureReason::AttemptsExhausted,
    }
}
