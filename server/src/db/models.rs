//! Database Models

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A row in the compacted reputation snapshot.
#[derive(Debug, Clone, FromRow)]
pub struct ReputationScoreRow {
    pub node_id: String,
    pub score: i64,
    pub last_decay_at: DateTime<Utc>,
}

/// Persisted worker identity and last-seen capabilities.
#[derive(Debug, Clone, FromRow)]
pub struct NodeMetadataRow {
    pub node_id: String,
    pub account_ref: String,
    /// Capabilities as JSON, exactly as last declared.
    pub capabilities: String,
    pub last_seen_at: DateTime<Utc>,
}

/// Terminal task record.
#[derive(Debug, Clone, FromRow)]
pub struct TaskHistoryRow {
    pub task_id: String,
    pub mode: String,
    pub difficulty: Option<String>,
    pub created_at: DateTime<Utc>,
    pub terminal_status: String,
    pub duration_ms: i64,
    /// Comma-separated node ids that served subtasks.
    pub participating_nodes: String,
}
