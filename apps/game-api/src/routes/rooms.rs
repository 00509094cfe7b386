//! Control-plane admissions on behalf of the lobby/hub.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::ApiError;
use crate::game::{ClientInfo, JoinedRoomRes, RoomOption};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms", post(create_room))
        .route("/rooms/{id}/join", post(join_room))
        .route("/rooms/{id}/watch", post(watch_room))
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomReq {
    pub app_id: String,
    pub room_option: RoomOption,
    pub master_info: ClientInfo,
}

#[derive(Debug, Deserialize)]
pub struct JoinRoomReq {
    pub app_id: String,
    pub client_info: ClientInfo,
}

/// `POST /rooms`: materialize a room and admit its master.
async fn create_room(
    State(state): State<AppState>,
    Json(req): Json<CreateRoomReq>,
) -> Result<Json<JoinedRoomRes>, ApiError> {
    let repo = state
        .repo(&req.app_id)
        .ok_or_else(|| ApiError::bad_request("unknown app id"))?;
    let res = repo.create_room(req.room_option, req.master_info).await?;
    Ok(Json(res))
}

/// `POST /rooms/{id}/join`: admit a player into a live room.
async fn join_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(req): Json<JoinRoomReq>,
) -> Result<Json<JoinedRoomRes>, ApiError> {
    let repo = state
        .repo(&req.app_id)
        .ok_or_else(|| ApiError::bad_request("unknown app id"))?;
    let res = repo.join_room(&room_id, req.client_info).await?;
    Ok(Json(res))
}

/// `POST /rooms/{id}/watch`: admit a read-only watcher.
async fn watch_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(req): Json<JoinRoomReq>,
) -> Result<Json<JoinedRoomRes>, ApiError> {
    let repo = state
        .repo(&req.app_id)
        .ok_or_else(|| ApiError::bad_request("unknown app id"))?;
    let res = repo.watch_room(&room_id, req.client_info).await?;
    Ok(Json(res))
}
