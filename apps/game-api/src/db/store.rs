//! Persistence seam for the room table.
//!
//! Backed by the relational store in production; the in-memory map keeps
//! the same uniqueness rules for tests and single-node development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

/// One row of the `room` table.
#[derive(Debug, Clone)]
pub struct RoomRow {
    pub id: String,
    pub app_id: String,
    pub host_id: u32,
    pub visible: bool,
    pub joinable: bool,
    pub watchable: bool,
    pub number: Option<u32>,
    pub search_group: u32,
    pub max_players: u32,
    pub players: u32,
    pub watchers: u32,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("room id already exists")]
    DuplicateId,
    #[error("room number already in use")]
    DuplicateNumber,
    #[error("room not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Room-row operations the room loop and registry need. Uniqueness of the
/// room id and of the live room number (both per app) is enforced here.
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn insert_room(&self, row: &RoomRow) -> Result<(), StoreError>;
    async fn update_room(&self, row: &RoomRow) -> Result<(), StoreError>;
    async fn delete_room(&self, app_id: &str, room_id: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    rooms: Mutex<HashMap<(String, String), RoomRow>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn insert_room(&self, row: &RoomRow) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock();
        let key = (row.app_id.clone(), row.id.clone());
        if rooms.contains_key(&key) {
            return Err(StoreError::DuplicateId);
        }
        if let Some(n) = row.number {
            let taken = rooms
                .values()
                .any(|r| r.app_id == row.app_id && r.number == Some(n));
            if taken {
                return Err(StoreError::DuplicateNumber);
            }
        }
        rooms.insert(key, row.clone());
        Ok(())
    }

    async fn update_room(&self, row: &RoomRow) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock();
        let key = (row.app_id.clone(), row.id.clone());
        match rooms.get_mut(&key) {
            Some(stored) => {
                *stored = row.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn delete_room(&self, app_id: &str, room_id: &str) -> Result<(), StoreError> {
        self.rooms
            .lock()
            .remove(&(app_id.to_string(), room_id.to_string()));
        Ok(())
    }
}
