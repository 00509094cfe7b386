//! Process-local room registry: admits rooms, members, and watchers on
//! behalf of the lobby/hub, and resolves live sessions for the WebSocket
//! upgrade. One repository per app id.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::binary::CodecError;
use crate::config::Config;
use crate::db::store::{RoomRow, RoomStore, StoreError};
use crate::game::client::Client;
use crate::game::room::{room_loop, parse_props, Room, RoomState};

const ROOM_ID_LEN: usize = 16;
const MAX_CLIENT_ID_LEN: usize = 128;

/// Base64 for marshaled property bytes carried in JSON payloads.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_players() -> u16 {
    10
}

/// Options for a new room, as sent by the lobby.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomOption {
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default = "default_true")]
    pub joinable: bool,
    #[serde(default = "default_true")]
    pub watchable: bool,
    /// Request a short human-joinable room number.
    #[serde(default)]
    pub with_number: bool,
    #[serde(default)]
    pub search_group: u32,
    #[serde(default = "default_max_players")]
    pub max_players: u16,
    /// Idle grace in seconds; 0 uses the configured default.
    #[serde(default)]
    pub client_deadline: u32,
    #[serde(default, with = "b64")]
    pub public_props: Vec<u8>,
    #[serde(default, with = "b64")]
    pub private_props: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    /// Marshaled props dict; empty means none.
    #[serde(default, with = "b64")]
    pub props: Vec<u8>,
}

/// Room summary returned by admissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: String,
    pub app_id: String,
    pub host_id: u32,
    pub visible: bool,
    pub joinable: bool,
    pub watchable: bool,
    pub number: Option<u32>,
    pub search_group: u32,
    pub max_players: u16,
    pub players: u32,
    pub watchers: u32,
    #[serde(with = "b64")]
    pub public_props: Vec<u8>,
    #[serde(with = "b64")]
    pub private_props: Vec<u8>,
    pub created: DateTime<Utc>,
}

/// Create/Join/Watch result: the room summary, the current players, the
/// key material for the WebSocket bearer, and the data-plane URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinedRoomRes {
    pub room_info: RoomInfo,
    pub players: Vec<ClientInfo>,
    pub auth_key: String,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room not found")]
    RoomNotFound,
    #[error("room is closing")]
    RoomClosed,
    #[error("room is not joinable")]
    NotJoinable,
    #[error("room is not watchable")]
    NotWatchable,
    #[error("room is full")]
    RoomFull,
    #[error("client {0} is already in the room")]
    DuplicatedClient(String),
    #[error("invalid client id")]
    InvalidClientId,
    #[error("invalid room option: {0}")]
    InvalidRoomOption(&'static str),
    #[error("invalid props: {0}")]
    InvalidProps(CodecError),
    #[error("no room id or number available")]
    NoRoomAvailable,
    #[error("store error: {0}")]
    Store(StoreError),
}

pub struct Repository {
    pub app_id: String,
    config: Arc<Config>,
    store: Arc<dyn RoomStore>,
    rooms: DashMap<String, Arc<Room>>,
    clients: DashMap<(String, String), Arc<Client>>,
}

impl Repository {
    pub fn new(app_id: String, config: Arc<Config>, store: Arc<dyn RoomStore>) -> Arc<Repository> {
        Arc::new(Repository {
            app_id,
            config,
            store,
            rooms: DashMap::new(),
            clients: DashMap::new(),
        })
    }

    /// Materializes a room: assigns a hex id (and optionally a short
    /// number) against store uniqueness with bounded retries, admits the
    /// master, starts the loop, registers the handle.
    pub async fn create_room(
        self: &Arc<Self>,
        op: RoomOption,
        master: ClientInfo,
    ) -> Result<JoinedRoomRes, RoomError> {
        validate_client_id(&master.id)?;
        if op.max_players == 0 {
            return Err(RoomError::InvalidRoomOption("max_players must be positive"));
        }
        let public_props = parse_props(&op.public_props)?;
        let private_props = parse_props(&op.private_props)?;

        let mut attempt = 0;
        let (id, number) = loop {
            attempt += 1;
            if attempt > self.config.retry_count {
                return Err(RoomError::NoRoomAvailable);
            }
            let id = wsnet2_common::id::random_hex(ROOM_ID_LEN);
            let number = op
                .with_number
                .then(|| wsnet2_common::id::random_number(self.config.max_room_num));
            let row = RoomRow {
                id: id.clone(),
                app_id: self.app_id.clone(),
                host_id: self.config.host_id,
                visible: op.visible,
                joinable: op.joinable,
                watchable: op.watchable,
                number,
                search_group: op.search_group,
                max_players: op.max_players as u32,
                players: 0,
                watchers: 0,
                created: Utc::now(),
            };
            match self.store.insert_room(&row).await {
                Ok(()) => break (id, number),
                Err(StoreError::DuplicateId | StoreError::DuplicateNumber) => continue,
                Err(e) => return Err(RoomError::Store(e)),
            }
        };

        let deadline_secs = if op.client_deadline > 0 {
            op.client_deadline as u64
        } else {
            self.config.default_deadline_secs
        };

        let (msg_tx, msg_rx) = mpsc::channel(self.config.room_queue_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut state = RoomState::new(
            id.clone(),
            self.app_id.clone(),
            self.config.host_id,
            number,
            op.visible,
            op.joinable,
            op.watchable,
            op.search_group,
            op.max_players,
            Duration::from_secs(deadline_secs),
            public_props,
            private_props,
            self.config.evbuf_size,
            self.store.clone(),
            self.clone(),
        );

        let res = match state.join_client(master).await {
            Ok(res) => res,
            Err(e) => {
                let _ = self.store.delete_room(&self.app_id, &id).await;
                return Err(e);
            }
        };

        let room = Arc::new(Room::new(
            id.clone(),
            self.app_id.clone(),
            msg_tx,
            shutdown_tx,
        ));
        self.rooms.insert(id.clone(), room);
        tokio::spawn(room_loop(state, msg_rx, shutdown_rx));

        tracing::info!(app_id = %self.app_id, room_id = %id, number = ?number, "room created");
        Ok(res)
    }

    /// Admits a player into a live room. The mutation happens on the room
    /// loop; this only posts the request and awaits the reply.
    pub async fn join_room(&self, room_id: &str, info: ClientInfo) -> Result<JoinedRoomRes, RoomError> {
        validate_client_id(&info.id)?;
        let room = self.get_room(room_id).ok_or(RoomError::RoomNotFound)?;
        room.join(info).await
    }

    /// Admits a read-only watcher into a live room.
    pub async fn watch_room(&self, room_id: &str, info: ClientInfo) -> Result<JoinedRoomRes, RoomError> {
        validate_client_id(&info.id)?;
        let room = self.get_room(room_id).ok_or(RoomError::RoomNotFound)?;
        room.watch(info).await
    }

    pub fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| r.value().clone())
    }

    /// Resolves a live session for the WebSocket upgrade.
    pub fn get_client(&self, room_id: &str, client_id: &str) -> Option<Arc<Client>> {
        self.clients
            .get(&(room_id.to_string(), client_id.to_string()))
            .map(|c| c.value().clone())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Asks every live room to stop.
    pub fn shutdown_all(&self) {
        for room in self.rooms.iter() {
            room.shutdown();
        }
    }

    pub(crate) fn register_client(&self, client: &Arc<Client>) {
        self.clients
            .insert((client.room_id.clone(), client.id.clone()), client.clone());
    }

    pub(crate) fn unregister_client(&self, room_id: &str, client_id: &str) {
        self.clients
            .remove(&(room_id.to_string(), client_id.to_string()));
    }

    pub(crate) fn remove_room(&self, room_id: &str) {
        self.rooms.remove(room_id);
    }

    pub(crate) fn ws_url(&self, room_id: &str) -> String {
        self.config.ws_url(room_id)
    }
}

fn validate_client_id(id: &str) -> Result<(), RoomError> {
    if id.is_empty() || id.len() > MAX_CLIENT_ID_LEN {
        return Err(RoomError::InvalidClientId);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::MemoryStore;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            app_ids: vec!["app".to_string()],
            port: 0,
            public_name: "localhost".to_string(),
            host_id: 1,
            max_room_num: 999,
            retry_count: 3,
            default_deadline_secs: 30,
            evbuf_size: 16,
            room_queue_size: 16,
        })
    }

    fn test_repo() -> Arc<Repository> {
        Repository::new(
            "app".to_string(),
            test_config(),
            Arc::new(MemoryStore::new()),
        )
    }

    fn client(id: &str) -> ClientInfo {
        ClientInfo {
            id: id.to_string(),
            props: Vec::new(),
        }
    }

    fn option(max_players: u16) -> RoomOption {
        RoomOption {
            visible: true,
            joinable: true,
            watchable: true,
            with_number: false,
            search_group: 1,
            max_players,
            client_deadline: 0,
            public_props: Vec::new(),
            private_props: Vec::new(),
        }
    }

    #[tokio::test]
    async fn create_room_admits_master() {
        let repo = test_repo();
        let res = repo.create_room(option(3), client("alice")).await.unwrap();

        assert_eq!(res.room_info.players, 1);
        assert_eq!(res.players.len(), 1);
        assert_eq!(res.players[0].id, "alice");
        assert_eq!(res.auth_key.len(), 32);
        assert!(res.url.ends_with(&format!("/room/{}", res.room_info.id)));
        assert!(repo.get_room(&res.room_info.id).is_some());
        assert!(repo.get_client(&res.room_info.id, "alice").is_some());
    }

    #[tokio::test]
    async fn join_checks_capacity_and_duplicates() {
        let repo = test_repo();
        let res = repo.create_room(option(2), client("alice")).await.unwrap();
        let room_id = res.room_info.id;

        assert!(matches!(
            repo.join_room(&room_id, client("alice")).await,
            Err(RoomError::DuplicatedClient(_))
        ));

        repo.join_room(&room_id, client("bob")).await.unwrap();
        assert!(matches!(
            repo.join_room(&room_id, client("carol")).await,
            Err(RoomError::RoomFull)
        ));
    }

    #[tokio::test]
    async fn join_rejects_unjoinable_but_create_admits_master() {
        let repo = test_repo();
        let mut op = option(4);
        op.joinable = false;
        let res = repo.create_room(op, client("alice")).await.unwrap();

        assert!(matches!(
            repo.join_room(&res.room_info.id, client("bob")).await,
            Err(RoomError::NotJoinable)
        ));
    }

    #[tokio::test]
    async fn watch_rejects_unwatchable() {
        let repo = test_repo();
        let mut op = option(4);
        op.watchable = false;
        let res = repo.create_room(op, client("alice")).await.unwrap();

        assert!(matches!(
            repo.watch_room(&res.room_info.id, client("viewer")).await,
            Err(RoomError::NotWatchable)
        ));
    }

    #[tokio::test]
    async fn watch_adds_watcher() {
        let repo = test_repo();
        let res = repo.create_room(option(4), client("alice")).await.unwrap();
        let watched = repo
            .watch_room(&res.room_info.id, client("viewer"))
            .await
            .unwrap();
        assert_eq!(watched.room_info.watchers, 1);
        assert!(repo.get_client(&res.room_info.id, "viewer").is_some());
    }

    #[tokio::test]
    async fn room_number_retry_exhausts() {
        let config = Arc::new(Config {
            max_room_num: 1,
            ..(*test_config()).clone()
        });
        let store: Arc<dyn RoomStore> = Arc::new(MemoryStore::new());
        let repo = Repository::new("app".to_string(), config, store);

        let mut op = option(4);
        op.with_number = true;
        let res = repo.create_room(op.clone(), client("alice")).await.unwrap();
        assert_eq!(res.room_info.number, Some(1));

        // The only number is taken; every retry collides.
        assert!(matches!(
            repo.create_room(op, client("bob")).await,
            Err(RoomError::NoRoomAvailable)
        ));
    }

    #[tokio::test]
    async fn join_unknown_room_fails() {
        let repo = test_repo();
        assert!(matches!(
            repo.join_room("deadbeef", client("bob")).await,
            Err(RoomError::RoomNotFound)
        ));
    }

    #[tokio::test]
    async fn rejects_bad_client_ids() {
        let repo = test_repo();
        assert!(matches!(
            repo.create_room(option(4), client("")).await,
            Err(RoomError::InvalidClientId)
        ));
        let long = "x".repeat(200);
        assert!(matches!(
            repo.create_room(option(4), client(&long)).await,
            Err(RoomError::InvalidClientId)
        ));
    }
}
