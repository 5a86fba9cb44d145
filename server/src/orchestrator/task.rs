//! Task and Subtask State
//!
//! A `Task` is owned and mutated exclusively by its driver; everything
//! other components see goes through the shared [`TaskHandle`] snapshot.

use std::collections::HashSet;
use std::sync::{OnceLock, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use iris_common::{Difficulty, FailureReason, SubtaskState, TaskFile, TaskMode, TaskStatus};

/// One unit of work dispatched to exactly one worker at a time.
#[derive(Debug)]
pub struct Subtask {
    pub index: u32,
    pub prompt: String,
    pub state: SubtaskState,
    /// Node currently serving this subtask. Ids, not handles: the registry
    /// is the one authority translating id to connection.
    pub assigned_node: Option<String>,
    /// Dispatch count across all attempts.
    pub attempts: u32,
    /// Nodes that already attempted this subtask; never re-selected.
    pub attempted_nodes: HashSet<String>,
    /// Chunks received for the current attempt.
    pub buffer: String,
    pub result: Option<String>,
    /// Node whose attempt produced the result.
    pub completed_by: Option<String>,
    /// Start of the current attempt.
    pub started_at: Option<Instant>,
    /// Wall-clock budget of the current attempt.
    pub attempt_deadline: Option<Instant>,
    /// Whether any chunk of a previous attempt reached the stream
    /// (drives the attempt-restart marker).
    pub streamed: bool,
    /// Highest chunk sequence seen for the current attempt.
    pub last_seq: Option<u64>,
}

impl Subtask {
    #[must_use]
    pub fn new(index: u32, prompt: String) -> Self {
        Self {
            index,
            prompt,
            state: SubtaskState::Pending,
            assigned_node: None,
            attempts: 0,
            attempted_nodes: HashSet::new(),
            buffer: String::new(),
            result: None,
            completed_by: None,
            started_at: None,
            attempt_deadline: None,
            streamed: false,
            last_seq: None,
        }
    }

    /// Whether the current attempt has outlived its budget.
    #[must_use]
    pub fn attempt_expired(&self, now: Instant) -> bool {
        !self.state.is_terminal()
            && self.attempt_deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Shared, read-mostly view of one task. The driver is the only writer.
#[derive(Debug)]
pub struct TaskHandle {
    pub id: Uuid,
    pub mode: TaskMode,
    pub streaming: bool,
    pub prompt: String,
    pub files: Vec<TaskFile>,
    pub account_ref: String,
    pub created_at: DateTime<Utc>,
    status: RwLock<TaskStatus>,
    difficulty: OnceLock<Difficulty>,
    result: RwLock<Option<String>>,
    reason: RwLock<Option<FailureReason>>,
    terminal_at: RwLock<Option<Instant>>,
    cancel: CancellationToken,
}

impl TaskHandle {
    #[must_use]
    pub fn new(
        mode: TaskMode,
        streaming: bool,
        prompt: String,
        files: Vec<TaskFile>,
        account_ref: String,
        parent_cancel: &CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            streaming,
            prompt,
            files,
            account_ref,
            created_at: Utc::now(),
            status: RwLock::new(TaskStatus::Pending),
            difficulty: OnceLock::new(),
            result: RwLock::new(None),
            reason: RwLock::new(None),
            terminal_at: RwLock::new(None),
            cancel: parent_cancel.child_token(),
        }
    }

    #[must_use]
    pub fn status(&self) -> TaskStatus {
        *self.status.read().expect("status lock")
    }

    /// Advance the lifecycle. A terminal status is assigned exactly once;
    /// transitions after that are ignored.
    pub fn set_status(&self, next: TaskStatus) -> bool {
        let mut status = self.status.write().expect("status lock");
        if status.is_terminal() {
            return false;
        }
        *status = next;
        if next.is_terminal() {
            *self.terminal_at.write().expect("terminal lock") = Some(Instant::now());
        }
        true
    }

    pub fn set_difficulty(&self, difficulty: Difficulty) {
        let _ = self.difficulty.set(difficulty);
    }

    #[must_use]
    pub fn difficulty(&self) -> Option<Difficulty> {
        self.difficulty.get().copied()
    }

    pub fn set_result(&self, result: String) {
        *self.result.write().expect("result lock") = Some(result);
    }

    #[must_use]
    pub fn result(&self) -> Option<String> {
        self.result.read().expect("result lock").clone()
    }

    pub fn set_reason(&self, reason: FailureReason) {
        let mut slot = self.reason.write().expect("reason lock");
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<FailureReason> {
        *self.reason.read().expect("reason lock")
    }

    /// Cancellation signal propagated into every suspension point of the
    /// task's driver.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation. A no-op on terminal tasks.
    pub fn request_cancel(&self) {
        if !self.status().is_terminal() {
            self.cancel.cancel();
        }
    }

    /// How long ago the task went terminal, if it has.
    #[must_use]
    pub fn terminal_for(&self) -> Option<std::time::Duration> {
        self.terminal_at
            .read()
            .expect("terminal lock")
            .map(|at| at.elapsed())
    }
}
