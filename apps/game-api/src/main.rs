use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use game_api::config::Config;
use game_api::db::store::{MemoryStore, RoomStore};
use game_api::AppState;

#[tokio::main]
async fn main() {
    // A missing .env is fine; the environment may already be set.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    let port = config.port;

    // In-memory room table for single-node development; the relational
    // store plugs in behind the same trait.
    let store: Arc<dyn RoomStore> = Arc::new(MemoryStore::new());

    tracing::info!(apps = ?config.app_ids, host_id = config.host_id, "game-api configured");

    let state = AppState::new(config, store);

    let app = axum::Router::new()
        .merge(game_api::routes::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "game-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            state.shutdown_all();
        })
        .await
        .expect("server error");
}
