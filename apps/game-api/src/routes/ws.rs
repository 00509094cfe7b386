//! WebSocket upgrade for the data plane.
//!
//! The upgrade request must carry `Wsnet2-App`, `Wsnet2-User`,
//! `Wsnet2-LastEventSeq`, and `Authorization: Bearer <auth data>`. The
//! session is resolved through the registry and authenticated before the
//! upgrade; the connection then becomes a peer attached to the session.

use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::error::ApiError;
use crate::game::client::AttachError;
use crate::game::room::RoomCommand;
use crate::game::{Client, Peer};
use crate::AppState;

pub const HEADER_APP: &str = "Wsnet2-App";
pub const HEADER_USER: &str = "Wsnet2-User";
pub const HEADER_LAST_EVENT_SEQ: &str = "Wsnet2-LastEventSeq";

pub fn router() -> Router<AppState> {
    Router::new().route("/room/{id}", get(handle_room))
}

async fn handle_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let app_id = header_str(&headers, HEADER_APP)?;
    let client_id = header_str(&headers, HEADER_USER)?;
    let last_ev_seq: u32 = header_str(&headers, HEADER_LAST_EVENT_SEQ)?
        .parse()
        .map_err(|_| ApiError::bad_request("invalid Wsnet2-LastEventSeq"))?;

    let repo = state
        .repo(app_id)
        .ok_or_else(|| ApiError::bad_request("unknown app id"))?;
    let client = repo
        .get_client(&room_id, client_id)
        .ok_or_else(|| ApiError::bad_request("unknown room or client"))?;

    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
    if let Err(e) = client.valid_auth_data(bearer) {
        tracing::warn!(room_id = %room_id, client_id = %client_id, error = %e, "websocket authentication failed");
        return Err(ApiError::unauthorized("authentication failed"));
    }

    let room = repo
        .get_room(&room_id)
        .ok_or_else(|| ApiError::not_found("room not found"))?;
    let room_tx = room.msg_tx();

    tracing::info!(room_id = %room_id, client_id = %client_id, last_ev_seq, "websocket upgrade");
    Ok(ws.on_upgrade(move |socket| run_peer(socket, client, room_tx, last_ev_seq, room_id)))
}

/// Drives one connection: construct the peer, hand it to the session
/// (which replays buffered events), then read until the peer dies.
async fn run_peer(
    socket: WebSocket,
    client: Arc<Client>,
    room_tx: mpsc::Sender<RoomCommand>,
    last_ev_seq: u32,
    room_id: String,
) {
    let (sink, stream) = socket.split();
    let peer = Peer::new(client.id.clone(), room_id.clone(), sink);

    if let Err(e) = client.attach_peer(peer.clone(), last_ev_seq).await {
        tracing::warn!(room_id = %room_id, client_id = %client.id, error = %e, "peer attach failed");
        // Replay and ready failures already closed the peer with the
        // matching code; a gone session is terminal for the client.
        if let AttachError::Gone = e {
            peer.close_going_away("client already left").await;
        }
        return;
    }

    peer.msg_loop(&client, stream, room_tx).await;
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request(format!("missing header: {name}")))
}
