pub mod auth;
pub mod binary;
pub mod config;
pub mod db;
pub mod error;
pub mod game;
pub mod routes;

use std::collections::HashMap;
use std::sync::Arc;

use config::Config;
use db::store::RoomStore;
use game::Repository;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    repos: Arc<HashMap<String, Arc<Repository>>>,
}

impl AppState {
    /// Builds one repository per configured app id over the shared store.
    pub fn new(config: Arc<Config>, store: Arc<dyn RoomStore>) -> AppState {
        let repos = config
            .app_ids
            .iter()
            .map(|app_id| {
                (
                    app_id.clone(),
                    Repository::new(app_id.clone(), config.clone(), store.clone()),
                )
            })
            .collect();
        AppState {
            config,
            repos: Arc::new(repos),
        }
    }

    pub fn repo(&self, app_id: &str) -> Option<Arc<Repository>> {
        self.repos.get(app_id).cloned()
    }

    /// Asks every room on every app to stop.
    pub fn shutdown_all(&self) {
        for repo in self.repos.values() {
            repo.shutdown_all();
        }
    }
}
