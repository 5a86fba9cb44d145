//! Database Queries

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::{NodeMetadataRow, ReputationScoreRow, TaskHistoryRow};

/// Append one event to the reputation log.
pub async fn insert_reputation_event(
    pool: &SqlitePool,
    node_id: &str,
    kind: &str,
    points: i64,
    recorded_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO reputation_events (node_id, kind, points, recorded_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(node_id)
    .bind(kind)
    .bind(points)
    .bind(recorded_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Write the compacted score for a node.
pub async fn upsert_reputation_score(
    pool: &SqlitePool,
    node_id: &str,
    score: i64,
    last_decay_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO reputation_scores (node_id, score, last_decay_at) VALUES ($1, $2, $3)
         ON CONFLICT (node_id) DO UPDATE SET score = $2, last_decay_at = $3",
    )
    .bind(node_id)
    .bind(score)
    .bind(last_decay_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Load every compacted score row.
pub async fn load_reputation_scores(
    pool: &SqlitePool,
) -> Result<Vec<ReputationScoreRow>, sqlx::Error> {
    sqlx::query_as("SELECT node_id, score, last_decay_at FROM reputation_scores")
        .fetch_all(pool)
        .await
}

/// Record or refresh a worker's identity and capabilities.
pub async fn upsert_node_metadata(
    pool: &SqlitePool,
    node_id: &str,
    account_ref: &str,
    capabilities_json: &str,
    last_seen_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO node_metadata (node_id, account_ref, capabilities, last_seen_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (node_id) DO UPDATE SET
            account_ref = $2, capabilities = $3, last_seen_at = $4",
    )
    .bind(node_id)
    .bind(account_ref)
    .bind(capabilities_json)
    .bind(last_seen_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Account reference a node last registered under, if any.
pub async fn find_node_account(
    pool: &SqlitePool,
    node_id: &str,
) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT account_ref FROM node_metadata WHERE node_id = $1")
            .bind(node_id)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|(account_ref,)| account_ref))
}

/// All persisted node metadata. Used by the broken-promise sweep.
pub async fn list_node_metadata(pool: &SqlitePool) -> Result<Vec<NodeMetadataRow>, sqlx::Error> {
    sqlx::query_as("SELECT node_id, account_ref, capabilities, last_seen_at FROM node_metadata")
        .fetch_all(pool)
        .await
}

/// Record one terminal task.
pub async fn insert_task_history(
    pool: &SqlitePool,
    row: &TaskHistoryRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO task_history
            (task_id, mode, difficulty, created_at, terminal_status, duration_ms, participating_nodes)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (task_id) DO NOTHING",
    )
    .bind(&row.task_id)
    .bind(&row.mode)
    .bind(&row.difficulty)
    .bind(row.created_at)
    .bind(&row.terminal_status)
    .bind(row.duration_ms)
    .bind(&row.participating_nodes)
    .execute(pool)
    .await?;

    Ok(())
}

/// Terminal status counts over the whole task history.
pub async fn task_status_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>, sqlx::Error> {
    sqlx::query_as(
        "SELECT terminal_status, COUNT(*) FROM task_history GROUP BY terminal_status",
    )
    .fetch_all(pool)
    .await
}
