//! Worker Wire Protocol
//!
//! Self-describing JSON frames exchanged over each worker's persistent
//! WebSocket channel. Frame order per channel is preserved end-to-end.
//! Unknown frame types are protocol errors, never silently ignored.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{NodeCapabilities, TaskFile, Tier};

/// Worker-to-coordinator frames.
///
/// Unknown fields are tolerated (schemas evolve additively); unknown `type`
/// tags are not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// Registration handshake. Must be the first frame on a connection.
    NodeRegister {
        node_id: String,
        /// Account reference issued by the external key service.
        account_ref: String,
        /// Hex HMAC-SHA256 over `"{node_id}:{account_ref}"`.
        proof: String,
        capabilities: NodeCapabilities,
    },
    /// Periodic liveness report.
    NodeHeartbeat {
        /// Worker-observed in-flight subtask count.
        load: u32,
        uptime_seconds: u64,
    },
    /// One streamed token chunk for an assigned subtask.
    TaskStream {
        task_id: Uuid,
        subtask_index: u32,
        /// Monotonic per (subtask, attempt); restarts from 0 on reassignment.
        seq: u64,
        payload: String,
    },
    /// Final payload for an assigned subtask. Last producer frame.
    TaskResult {
        task_id: Uuid,
        subtask_index: u32,
        payload: String,
        /// Worker-observed generation time.
        elapsed_ms: u64,
    },
    /// Terminal failure for an assigned subtask.
    TaskError {
        task_id: Uuid,
        subtask_index: u32,
        kind: WorkerErrorKind,
        detail: String,
    },
}

/// Coordinator-to-worker frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorFrame {
    /// Registration accepted.
    RegisterAck { node_id: String, tier: Tier },
    /// Registration rejected; the connection closes after this frame.
    RegisterNack { reason: RegisterNackReason },
    /// Heartbeat acknowledgement, lets workers detect dead sockets.
    HeartbeatAck,
    /// Work assignment for one subtask.
    TaskAssign {
        task_id: Uuid,
        subtask_index: u32,
        prompt: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        files: Vec<TaskFile>,
        streaming: bool,
        /// Attempt wall-clock budget.
        deadline_ms: u64,
    },
    /// Best-effort cancellation of a previously assigned subtask.
    TaskCancel { task_id: Uuid, subtask_index: u32 },
}

/// Why a registration was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterNackReason {
    /// Account proof did not verify.
    InvalidProof,
    /// Node id is live under a different account.
    DuplicateId,
}

/// Worker-reported error kinds. Each drives the reassign-or-fail decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    ModelRefused,
    Internal,
    OutOfMemory,
    VisionUnsupported,
}

/// Frames delivered to the user's server-sent stream.
///
/// Within one subtask, chunks arrive in worker send order. Across subtasks
/// interleaving is arbitrary; consumers demultiplex by `subtask_index`, and
/// key on `(subtask_index, attempt)` if they deduplicate across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamFrame {
    /// One token chunk.
    Chunk {
        subtask_index: u32,
        seq: u64,
        payload: String,
        /// True for the last frame of a subtask.
        is_terminal: bool,
    },
    /// A subtask was reassigned; chunks that follow belong to a new attempt.
    AttemptRestart { subtask_index: u32, attempt: u32 },
    /// Backpressure dropped one or more chunks of this subtask.
    Dropped { subtask_index: u32 },
    /// Terminal marker: the task failed with the given reason.
    Error { reason: String },
    /// Terminal marker: the task was cancelled or the consumer went away.
    Aborted,
}

impl StreamFrame {
    /// Whether this frame ends the stream for its subtask or the whole task.
    #[must_use]
    pub const fn is_closing(&self) -> bool {
        matches!(
            self,
            Self::Chunk { is_terminal: true, .. } | Self::Error { .. } | Self::Aborted
        )
    }
}
