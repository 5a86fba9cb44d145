//! Task Types

use serde::{Deserialize, Serialize};

/// How a task is divided across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Split the prompt into independent fragments, one worker each.
    #[default]
    Subtasks,
    /// Send the same prompt to several workers and vote on the answer.
    Consensus,
    /// Slide overlapping windows over an oversized document.
    Context,
    /// Bypass registered workers entirely (document processed externally).
    Direct,
}

/// Classified prompt difficulty, driving deadlines and tier eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Simple,
    Complex,
    Advanced,
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Complex => write!(f, "complex"),
            Self::Advanced => write!(f, "advanced"),
        }
    }
}

/// Task lifecycle status. Exactly one terminal status is ever assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Classifying,
    Dispatched,
    Streaming,
    Completed,
    /// Some subtasks completed, some did not; the aggregate annotates gaps.
    Partial,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal. Once terminal, no further
    /// transitions occur.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Partial | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Classifying => "classifying",
            Self::Dispatched => "dispatched",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Per-subtask lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskState {
    Pending,
    Assigned,
    Streaming,
    Completed,
    Failed,
    /// A previous attempt was lost; a new attempt is (or will be) in flight.
    Reassigned,
    Cancelled,
}

impl SubtaskState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Machine-readable reason attached to PARTIAL/FAILED/TIMED_OUT outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// No eligible node for the required tier at dispatch time.
    NoNodes,
    /// Every attempt on some subtask was consumed without a result.
    AttemptsExhausted,
    /// The task deadline expired.
    Timeout,
    /// The user cancelled or disconnected.
    Cancelled,
    /// A worker reported a terminal error.
    WorkerError,
    /// A result failed validation.
    InvalidResponse,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoNodes => "NO_NODES",
            Self::AttemptsExhausted => "ATTEMPTS_EXHAUSTED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::WorkerError => "WORKER_ERROR",
            Self::InvalidResponse => "INVALID_RESPONSE",
        };
        write!(f, "{s}")
    }
}

/// An attachment submitted with a task.
///
/// Content crosses this boundary already ciphered by the external payload
/// cipher; the coordinator never inspects it beyond the file name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFile {
    pub name: String,
    pub content: String,
}

impl TaskFile {
    /// Lower-cased extension of the file name, if any.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }
}
