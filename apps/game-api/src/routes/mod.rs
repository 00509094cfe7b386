pub mod rooms;
pub mod ws;

use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().merge(rooms::router()).merge(ws::router())
}
