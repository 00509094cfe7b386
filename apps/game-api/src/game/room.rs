//! The authoritative per-room loop.
//!
//! One task per live room is the only writer of room state and of every
//! member's event buffer. Admissions from the control plane and messages
//! from peers all funnel through the same queue, so responses to message k
//! always precede events caused by message k+1 from the same sender.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};

use crate::binary::msg::{
    unmarshal_client_id, unmarshal_client_prop, unmarshal_ping_time, unmarshal_targets_and_data,
};
use crate::binary::types::marshal_ulong;
use crate::binary::{Dict, Event, Msg, MsgType, RegularMsg, RoomPropPayload, SystemEvent};
use crate::db::store::{RoomRow, RoomStore};
use crate::game::client::{Client, SeqCheck};
use crate::game::repository::{ClientInfo, JoinedRoomRes, Repository, RoomError, RoomInfo};

/// Coarse wakeup for the deadline scan.
const ROOM_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// One decoded message with its sender, as queued by peer readers.
pub struct RoomMsg {
    pub sender: Arc<Client>,
    pub msg: Msg,
}

pub enum RoomCommand {
    Msg(RoomMsg),
    Join {
        info: ClientInfo,
        reply: oneshot::Sender<Result<JoinedRoomRes, RoomError>>,
    },
    Watch {
        info: ClientInfo,
        reply: oneshot::Sender<Result<JoinedRoomRes, RoomError>>,
    },
}

/// Shared handle to a live room. The loop owns the state; this only
/// carries the queue and the shutdown signal.
pub struct Room {
    pub id: String,
    pub app_id: String,
    msg_tx: mpsc::Sender<RoomCommand>,
    shutdown: watch::Sender<bool>,
}

impl Room {
    pub(crate) fn new(
        id: String,
        app_id: String,
        msg_tx: mpsc::Sender<RoomCommand>,
        shutdown: watch::Sender<bool>,
    ) -> Room {
        Room {
            id,
            app_id,
            msg_tx,
            shutdown,
        }
    }

    pub async fn join(&self, info: ClientInfo) -> Result<JoinedRoomRes, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.msg_tx
            .send(RoomCommand::Join { info, reply: tx })
            .await
            .map_err(|_| RoomError::RoomClosed)?;
        rx.await.map_err(|_| RoomError::RoomClosed)?
    }

    pub async fn watch(&self, info: ClientInfo) -> Result<JoinedRoomRes, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.msg_tx
            .send(RoomCommand::Watch { info, reply: tx })
            .await
            .map_err(|_| RoomError::RoomClosed)?;
        rx.await.map_err(|_| RoomError::RoomClosed)?
    }

    /// Queue handle given to peer readers.
    pub(crate) fn msg_tx(&self) -> mpsc::Sender<RoomCommand> {
        self.msg_tx.clone()
    }

    /// Administrative cancellation; the loop closes every peer and exits.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

pub(crate) struct RoomState {
    pub id: String,
    pub app_id: String,
    pub host_id: u32,
    pub number: Option<u32>,
    pub visible: bool,
    pub joinable: bool,
    pub watchable: bool,
    pub search_group: u32,
    pub max_players: u16,
    pub client_deadline: Duration,
    pub public_props: Dict,
    pub private_props: Dict,
    pub created: DateTime<Utc>,

    master_id: String,
    /// Join order is preserved: the oldest player becomes the next master.
    players: Vec<Arc<Client>>,
    watchers: Vec<Arc<Client>>,
    /// client id -> marshaled ULong unix-millis of the last message seen.
    last_msg: Dict,

    evbuf_capacity: usize,
    store: Arc<dyn RoomStore>,
    repo: Arc<Repository>,
}

impl RoomState {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        app_id: String,
        host_id: u32,
        number: Option<u32>,
        visible: bool,
        joinable: bool,
        watchable: bool,
        search_group: u32,
        max_players: u16,
        client_deadline: Duration,
        public_props: Dict,
        private_props: Dict,
        evbuf_capacity: usize,
        store: Arc<dyn RoomStore>,
        repo: Arc<Repository>,
    ) -> RoomState {
        RoomState {
            id,
            app_id,
            host_id,
            number,
            visible,
            joinable,
            watchable,
            search_group,
            max_players,
            client_deadline,
            public_props,
            private_props,
            created: Utc::now(),
            master_id: String::new(),
            players: Vec::new(),
            watchers: Vec::new(),
            last_msg: Dict::new(),
            evbuf_capacity,
            store,
            repo,
        }
    }

    pub(crate) fn room_info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id.clone(),
            app_id: self.app_id.clone(),
            host_id: self.host_id,
            visible: self.visible,
            joinable: self.joinable,
            watchable: self.watchable,
            number: self.number,
            search_group: self.search_group,
            max_players: self.max_players,
            players: self.players.len() as u32,
            watchers: self.watchers.len() as u32,
            public_props: crate::binary::types::marshal_dict(&self.public_props),
            private_props: crate::binary::types::marshal_dict(&self.private_props),
            created: self.created,
        }
    }

    fn row(&self) -> RoomRow {
        RoomRow {
            id: self.id.clone(),
            app_id: self.app_id.clone(),
            host_id: self.host_id,
            visible: self.visible,
            joinable: self.joinable,
            watchable: self.watchable,
            number: self.number,
            search_group: self.search_group,
            max_players: self.max_players as u32,
            players: self.players.len() as u32,
            watchers: self.watchers.len() as u32,
            created: self.created,
        }
    }

    fn player_infos(&self) -> Vec<ClientInfo> {
        self.players
            .iter()
            .map(|c| ClientInfo {
                id: c.id.clone(),
                props: c.props_bytes(),
            })
            .collect()
    }

    fn find_member(&self, id: &str) -> Option<Arc<Client>> {
        self.players
            .iter()
            .chain(self.watchers.iter())
            .find(|c| c.id == id)
            .cloned()
    }

    fn broadcast(&self, ev: &Event) {
        for c in self.players.iter().chain(self.watchers.iter()) {
            c.send_event(ev.clone());
        }
    }

    async fn update_row(&self) {
        if let Err(e) = self.store.update_room(&self.row()).await {
            tracing::warn!(room_id = %self.id, error = %e, "room row update failed");
        }
    }

    /// Admits a player. Also used for the master when the room is created,
    /// which must succeed even for rooms that start out unjoinable.
    pub(crate) async fn join_client(&mut self, info: ClientInfo) -> Result<JoinedRoomRes, RoomError> {
        if !self.joinable && !self.players.is_empty() {
            return Err(RoomError::NotJoinable);
        }
        if self.players.len() >= self.max_players as usize {
            return Err(RoomError::RoomFull);
        }
        if self.players.iter().any(|c| c.id == info.id) {
            return Err(RoomError::DuplicatedClient(info.id));
        }
        let props = parse_props(&info.props)?;

        let auth_key = wsnet2_common::id::random_hex(32);
        let client = Client::new(
            info.id,
            self.id.clone(),
            true,
            props.clone(),
            auth_key.clone(),
            self.evbuf_capacity,
        );
        if self.players.is_empty() {
            self.master_id = client.id.clone();
        }
        self.players.push(client.clone());
        self.last_msg
            .insert(client.id.clone(), marshal_ulong(now_millis()));
        self.repo.register_client(&client);

        tracing::info!(room_id = %self.id, client_id = %client.id, "player joined");
        self.broadcast(&Event::joined(&client.id, &props));
        self.update_row().await;

        Ok(JoinedRoomRes {
            room_info: self.room_info(),
            players: self.player_infos(),
            auth_key,
            url: self.repo.ws_url(&self.id),
        })
    }

    /// Admits a read-only watcher. Watchers are counted, not announced.
    pub(crate) async fn watch_client(&mut self, info: ClientInfo) -> Result<JoinedRoomRes, RoomError> {
        if !self.watchable {
            return Err(RoomError::NotWatchable);
        }
        if self.watchers.iter().any(|c| c.id == info.id) {
            return Err(RoomError::DuplicatedClient(info.id));
        }
        let props = parse_props(&info.props)?;

        let auth_key = wsnet2_common::id::random_hex(32);
        let client = Client::new(
            info.id,
            self.id.clone(),
            false,
            props,
            auth_key.clone(),
            self.evbuf_capacity,
        );
        self.watchers.push(client.clone());
        self.repo.register_client(&client);

        tracing::info!(room_id = %self.id, client_id = %client.id, "watcher joined");
        self.update_row().await;

        Ok(JoinedRoomRes {
            room_info: self.room_info(),
            players: self.player_infos(),
            auth_key,
            url: self.repo.ws_url(&self.id),
        })
    }

    /// Removes a member with Leave semantics: every remaining member and
    /// the removed client observe a Left event, whatever the role. Master
    /// removal hands the role to the oldest remaining player before the
    /// Left event, so the event carries the new master.
    async fn remove_client(&mut self, client: &Arc<Client>, cause: &str) {
        let was_player = if let Some(i) = self.players.iter().position(|c| c.id == client.id) {
            self.players.remove(i);
            true
        } else if let Some(i) = self.watchers.iter().position(|c| c.id == client.id) {
            self.watchers.remove(i);
            false
        } else {
            return;
        };

        tracing::info!(room_id = %self.id, client_id = %client.id, %cause, "client removed");

        if was_player {
            self.last_msg.remove(&client.id);
            if client.id == self.master_id && !self.players.is_empty() {
                self.master_id = self.players[0].id.clone();
                let ev = Event::master_switched(&self.master_id);
                self.broadcast(&ev);
                client.send_event(ev);
            }
        }
        let ev = Event::left(&client.id, &self.master_id);
        self.broadcast(&ev);
        client.send_event(ev);

        client.flush_events().await;
        client.close_peer(cause).await;
        client.mark_done();
        self.repo.unregister_client(&self.id, &client.id);
        self.update_row().await;
    }

    /// Removes every member whose idle time passed the room deadline.
    /// Returns true when the room should tear down.
    async fn scan_deadlines(&mut self) -> bool {
        if self.client_deadline.is_zero() {
            return false;
        }
        let expired: Vec<Arc<Client>> = self
            .players
            .iter()
            .chain(self.watchers.iter())
            .filter(|c| c.idle_for() >= self.client_deadline)
            .cloned()
            .collect();
        for c in expired {
            self.remove_client(&c, "deadline exceeded").await;
        }
        self.players.is_empty()
    }

    async fn handle_command(&mut self, cmd: RoomCommand) -> bool {
        match cmd {
            RoomCommand::Join { info, reply } => {
                let _ = reply.send(self.join_client(info).await);
                false
            }
            RoomCommand::Watch { info, reply } => {
                let _ = reply.send(self.watch_client(info).await);
                false
            }
            RoomCommand::Msg(rm) => self.handle_msg(rm).await,
        }
    }

    async fn handle_msg(&mut self, rm: RoomMsg) -> bool {
        let sender = rm.sender;
        if sender.is_done() {
            // Queued behind its own removal.
            return false;
        }
        if sender.is_player {
            self.last_msg
                .insert(sender.id.clone(), marshal_ulong(now_millis()));
        }

        match rm.msg {
            Msg::Nonregular {
                mtype: MsgType::Ping,
                payload,
            } => {
                self.msg_ping(&sender, &payload).await;
                false
            }
            Msg::Nonregular { mtype, .. } => {
                tracing::warn!(room_id = %self.id, client_id = %sender.id, ?mtype, "unhandled nonregular message");
                false
            }
            Msg::Regular(msg) => match sender.accept_msg_seq(msg.sequence_num) {
                SeqCheck::Duplicate => {
                    tracing::debug!(
                        room_id = %self.id,
                        client_id = %sender.id,
                        seq = msg.sequence_num,
                        "duplicate message dropped"
                    );
                    false
                }
                SeqCheck::Gap => {
                    tracing::warn!(
                        room_id = %self.id,
                        client_id = %sender.id,
                        seq = msg.sequence_num,
                        last = sender.last_msg_seq(),
                        "message sequence gap"
                    );
                    sender.close_peer_with_error("message sequence gap").await;
                    false
                }
                SeqCheck::Accept => self.dispatch_regular(sender, msg).await,
            },
        }
    }

    async fn dispatch_regular(&mut self, sender: Arc<Client>, msg: RegularMsg) -> bool {
        match msg.mtype {
            MsgType::Leave => {
                self.remove_client(&sender, "leave").await;
                self.players.is_empty()
            }
            MsgType::RoomProp => {
                self.msg_room_prop(&sender, &msg).await;
                false
            }
            MsgType::ClientProp => {
                self.msg_client_prop(&sender, &msg).await;
                false
            }
            MsgType::Targets => {
                self.msg_targets(&sender, &msg).await;
                false
            }
            MsgType::ToMaster => self.msg_to_master(&sender, &msg),
            MsgType::Broadcast => {
                self.broadcast(&Event::message(&sender.id, &msg.payload));
                false
            }
            MsgType::Kick => self.msg_kick(&sender, &msg).await,
            MsgType::SwitchMaster => {
                self.msg_switch_master(&sender, &msg).await;
                false
            }
            MsgType::Ping => false,
        }
    }

    async fn msg_ping(&self, sender: &Arc<Client>, payload: &[u8]) {
        let ping_time = match unmarshal_ping_time(payload) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(room_id = %self.id, client_id = %sender.id, error = %e, "bad ping payload");
                sender.close_peer_invalid_payload(&e.to_string()).await;
                return;
            }
        };
        let pong = SystemEvent::pong(ping_time, self.watchers.len() as u32, &self.last_msg);
        sender.send_system_event(&pong).await;
    }

    async fn msg_room_prop(&mut self, sender: &Arc<Client>, msg: &RegularMsg) {
        if sender.id != self.master_id {
            sender.send_event(Event::permission_denied(msg));
            return;
        }
        let rpp = match RoomPropPayload::unmarshal(&msg.payload) {
            Ok(rpp) => rpp,
            Err(e) => {
                tracing::error!(room_id = %self.id, client_id = %sender.id, error = %e, "bad room prop payload");
                sender.close_peer_invalid_payload(&e.to_string()).await;
                return;
            }
        };

        self.visible = rpp.visible;
        self.joinable = rpp.joinable;
        self.watchable = rpp.watchable;
        self.search_group = rpp.search_group;
        self.max_players = rpp.max_players;
        if rpp.client_deadline > 0 {
            self.client_deadline = Duration::from_secs(rpp.client_deadline as u64);
        }
        self.public_props.merge_diff(&rpp.public_props);
        self.private_props.merge_diff(&rpp.private_props);

        // Members get the tail bytes exactly as the master sent them.
        self.broadcast(&Event::room_prop(rpp.event_payload));
        sender.send_event(Event::succeeded(msg));
        self.update_row().await;
    }

    async fn msg_client_prop(&mut self, sender: &Arc<Client>, msg: &RegularMsg) {
        if !sender.is_player {
            sender.send_event(Event::permission_denied(msg));
            return;
        }
        let diff = match unmarshal_client_prop(&msg.payload) {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(room_id = %self.id, client_id = %sender.id, error = %e, "bad client prop payload");
                sender.close_peer_invalid_payload(&e.to_string()).await;
                return;
            }
        };
        sender.merge_props(&diff);
        self.broadcast(&Event::client_prop(&sender.id, &msg.payload));
        sender.send_event(Event::succeeded(msg));
    }

    async fn msg_targets(&mut self, sender: &Arc<Client>, msg: &RegularMsg) {
        let (targets, body) = match unmarshal_targets_and_data(&msg.payload) {
            Ok(td) => td,
            Err(e) => {
                tracing::error!(room_id = %self.id, client_id = %sender.id, error = %e, "bad targets payload");
                sender.close_peer_invalid_payload(&e.to_string()).await;
                return;
            }
        };

        let ev = Event::message(&sender.id, &body);
        let mut missing = Vec::new();
        for target in targets {
            match self.find_member(&target) {
                Some(c) => c.send_event(ev.clone()),
                None => missing.push(target),
            }
        }
        if !missing.is_empty() {
            sender.send_event(Event::target_not_found(msg, &missing));
        }
    }

    /// Returns true when the master is missing from the players: a broken
    /// invariant that tears the room down.
    fn msg_to_master(&mut self, sender: &Arc<Client>, msg: &RegularMsg) -> bool {
        match self.players.iter().find(|c| c.id == self.master_id) {
            Some(master) => {
                master.send_event(Event::message(&sender.id, &msg.payload));
                false
            }
            None => {
                tracing::error!(room_id = %self.id, master_id = %self.master_id, "master is not a player");
                true
            }
        }
    }

    async fn msg_kick(&mut self, sender: &Arc<Client>, msg: &RegularMsg) -> bool {
        if sender.id != self.master_id {
            sender.send_event(Event::permission_denied(msg));
            return false;
        }
        let target_id = match unmarshal_client_id(&msg.payload) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(room_id = %self.id, client_id = %sender.id, error = %e, "bad kick payload");
                sender.close_peer_invalid_payload(&e.to_string()).await;
                return false;
            }
        };
        match self.find_member(&target_id) {
            Some(target) => {
                self.remove_client(&target, "kicked by master").await;
                sender.send_event(Event::succeeded(msg));
                self.players.is_empty()
            }
            None => {
                sender.send_event(Event::target_not_found(msg, &[target_id]));
                false
            }
        }
    }

    async fn msg_switch_master(&mut self, sender: &Arc<Client>, msg: &RegularMsg) {
        if sender.id != self.master_id {
            sender.send_event(Event::permission_denied(msg));
            return;
        }
        let target_id = match unmarshal_client_id(&msg.payload) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(room_id = %self.id, client_id = %sender.id, error = %e, "bad switch master payload");
                sender.close_peer_invalid_payload(&e.to_string()).await;
                return;
            }
        };
        if self.players.iter().any(|c| c.id == target_id) {
            self.master_id = target_id;
            self.broadcast(&Event::master_switched(&self.master_id));
            sender.send_event(Event::succeeded(msg));
        } else {
            sender.send_event(Event::target_not_found(msg, &[target_id]));
        }
    }

    async fn teardown(&mut self, reason: &str) {
        tracing::info!(room_id = %self.id, %reason, "room teardown");
        let players: Vec<Arc<Client>> = self.players.drain(..).collect();
        let watchers: Vec<Arc<Client>> = self.watchers.drain(..).collect();
        for c in players.into_iter().chain(watchers) {
            c.flush_events().await;
            c.close_peer("room closed").await;
            c.mark_done();
            self.repo.unregister_client(&self.id, &c.id);
        }
        self.repo.remove_room(&self.id);
        if let Err(e) = self.store.delete_room(&self.app_id, &self.id).await {
            tracing::warn!(room_id = %self.id, error = %e, "room row delete failed");
        }
    }
}

/// Runs a room until shutdown, queue closure, or the last player leaving.
pub(crate) async fn room_loop(
    mut state: RoomState,
    mut rx: mpsc::Receiver<RoomCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tracing::info!(room_id = %state.id, app_id = %state.app_id, "room loop start");
    let mut tick = tokio::time::interval(ROOM_TICK_INTERVAL);

    let reason = loop {
        tokio::select! {
            biased;
            _ = crate::game::wait_until_true(&mut shutdown_rx) => break "shutdown",
            _ = tick.tick() => {
                if state.scan_deadlines().await {
                    break "no players left";
                }
            }
            cmd = rx.recv() => match cmd {
                None => break "queue closed",
                Some(cmd) => {
                    if state.handle_command(cmd).await {
                        break "no players left";
                    }
                }
            }
        }
    };

    state.teardown(reason).await;
    tracing::info!(room_id = %state.id, "room loop end");
}

pub(crate) fn parse_props(bytes: &[u8]) -> Result<Dict, RoomError> {
    if bytes.is_empty() {
        return Ok(Dict::new());
    }
    match crate::binary::types::unmarshal_as(bytes, crate::binary::Type::Dict) {
        Ok((crate::binary::Value::Dict(d), _)) => Ok(d),
        Ok(_) => unreachable!(),
        Err(e) => Err(RoomError::InvalidProps(e)),
    }
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis() as u64
}
