// SPDX-License-Identifier: Apache-2.0
//! Read-only operator endpoints: `/`, `/status`, `/debug/aggregation`,
//! `/debug/database`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
struct RootResponse {
    running: bool,
    connections: usize,
    database_url: String,
    uptime_ms: u128,
    timestamp: String,
}

/// `GET /`.
pub async fn root(State(state): State<AppState>) -> impl IntoResponse {
    Json(RootResponse {
        running: true,
        connections: state.hub.count(),
        database_url: state.database_url.clone(),
        uptime_ms: state.started_at.elapsed().as_millis(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    connections: usize,
    user_ids: Vec<String>,
    dropped_frames: u64,
}

/// `GET /status`.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        connections: state.hub.count(),
        user_ids: state.hub.connected_user_ids(),
        dropped_frames: state.hub.dropped_frame_count(),
    })
}

#[derive(Debug, Serialize)]
struct AggregationRow {
    user_id: String,
    sample_count: usize,
    last_arrival_ms: u64,
}

/// `GET /debug/aggregation`.
pub async fn debug_aggregation(State(state): State<AppState>) -> impl IntoResponse {
    let now_ms = crate::ws::now_ms();
    let rows: Vec<AggregationRow> = state
        .store
        .debug_aggregation(now_ms)
        .into_iter()
        .map(|r| AggregationRow {
            user_id: r.user_id,
            sample_count: r.sample_count,
            last_arrival_ms: r.last_arrival_ms,
        })
        .collect();
    Json(rows)
}

#[derive(Debug, Serialize)]
struct DatabaseResponse {
    users: i64,
    reactions_log: i64,
    effects_log: i64,
    sessions: i64,
    recent_reactions: Vec<reaction_persistence::ReactionRow>,
    recent_effects: Vec<reaction_persistence::EffectRow>,
}

/// `GET /debug/database`.
pub async fn debug_database(State(state): State<AppState>) -> impl IntoResponse {
    let counts = match state.persistence.table_counts().await {
        Ok(counts) => counts,
        Err(err) => {
            tracing::warn!(%err, "failed to read table counts");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": err.to_string()})))
                .into_response();
        }
    };
    let recent_reactions = state.persistence.recent_reactions(20).await.unwrap_or_default();
    let recent_effects = state.persistence.recent_effects(20).await.unwrap_or_default();
    Json(DatabaseResponse {
        users: counts.users,
        reactions_log: counts.reactions_log,
        effects_log: counts.effects_log,
        sessions: counts.sessions,
        recent_reactions,
        recent_effects,
    })
    .into_response()
}
