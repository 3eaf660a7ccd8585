use crate::error::{Result, SessionError};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use huddle_protocol::RoomSummary;

pub async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomSummary>> {
    Json(state.coordinator.rooms().summaries().await)
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RoomSummary>> {
    let room = state
        .coordinator
        .rooms()
        .summary(&name)
        .await
        .ok_or_else(|| SessionError::ResourceNotFound(format!("room {}", name)))?;
    Ok(Json(room))
}
