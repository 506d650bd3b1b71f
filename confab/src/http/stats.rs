//! Read-only management endpoints

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use confab_sfu::{RoomId, RoomStats, ServerStats};

use super::{AppResult, AppState};

pub fn create_stats_router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(server_stats))
        .route("/rooms/{room_id}", get(room_stats))
}

/// Room, participant, producer and consumer totals plus per-worker usage
pub async fn server_stats(State(state): State<AppState>) -> Json<ServerStats> {
    Json(state.sfu.get_stats().await)
}

pub async fn room_stats(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<RoomStats>> {
    let room = state.sfu.find_room(&RoomId::from(room_id.as_str()))?;
    Ok(Json(room.stats()))
}
