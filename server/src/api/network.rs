//! Network Stats Handler

use axum::extract::State;
use axum::Json;

use super::AppState;
use crate::orchestrator::NetworkStats;

/// `GET /api/v1/network`
///
/// Online node count, in-flight tasks, terminal status counters and the
/// reputation leaderboard, for external monitoring consumers.
pub async fn stats(State(state): State<AppState>) -> Json<NetworkStats> {
    Json(state.orchestrator.network_stats().await)
}
