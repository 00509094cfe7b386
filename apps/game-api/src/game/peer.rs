//! One live WebSocket connection.
//!
//! A peer is attached to a client session and may be replaced mid-session:
//! the connection task only produces messages, the session owns the slot.
//!
//! Close codes 1000 (normal) and 1001 (going away) are terminal for the
//! client; 1011 (internal error) invites a fresh upgrade carrying the last
//! seen event sequence.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

use crate::binary::{unmarshal_msg, SystemEvent};
use crate::game::client::Client;
use crate::game::evbuf::{EvBuf, EvBufError};
use crate::game::room::{RoomCommand, RoomMsg};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;
pub const CLOSE_INTERNAL_ERR: u16 = 1011;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer already closed")]
    Closed,
    #[error("websocket write failed: {0}")]
    Write(axum::Error),
}

struct Writer {
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
    /// Highest event sequence already delivered on this connection.
    ev_seq_num: u32,
}

pub struct Peer {
    client_id: String,
    room_id: String,
    writer: Mutex<Writer>,
    detached: watch::Sender<bool>,
}

impl Peer {
    pub fn new(client_id: String, room_id: String, sink: SplitSink<WebSocket, Message>) -> Arc<Peer> {
        Arc::new(Peer {
            client_id,
            room_id,
            writer: Mutex::new(Writer {
                sink,
                closed: false,
                ev_seq_num: 0,
            }),
            detached: watch::channel(false).0,
        })
    }

    /// Sets the replay point. Called once by the session before any event
    /// is delivered on this connection.
    pub async fn seed_ev_seq(&self, last_ev_seq: u32) {
        self.writer.lock().await.ev_seq_num = last_ev_seq;
    }

    /// Sends PeerReady carrying the last accepted message sequence.
    pub async fn send_ready(&self, last_msg_seq: u32) -> Result<(), PeerError> {
        let mut w = self.writer.lock().await;
        if w.closed {
            return Err(PeerError::Closed);
        }
        let ev = SystemEvent::peer_ready(last_msg_seq);
        if let Err(e) = w.sink.send(Message::Binary(ev.marshal().into())).await {
            self.close_locked(&mut w, CLOSE_INTERNAL_ERR, "write failed").await;
            return Err(PeerError::Write(e));
        }
        Ok(())
    }

    /// Sends one system event. A write failure closes the peer so the
    /// client can reconnect.
    pub async fn send_system_event(&self, ev: &SystemEvent) -> Result<(), PeerError> {
        let mut w = self.writer.lock().await;
        if w.closed {
            return Ok(());
        }
        if let Err(e) = w.sink.send(Message::Binary(ev.marshal().into())).await {
            tracing::error!(
                room_id = %self.room_id,
                client_id = %self.client_id,
                error = %e,
                "system event write failed"
            );
            self.close_locked(&mut w, CLOSE_INTERNAL_ERR, "write failed").await;
            return Err(PeerError::Write(e));
        }
        Ok(())
    }

    /// Flushes buffered events past this connection's replay point.
    ///
    /// A replay point that has been evicted is unrecoverable: the peer is
    /// closed with 1001 and the error surfaces so the session gives up on
    /// it. A plain write failure closes with 1011 and returns Ok, so a
    /// replacement peer may pick up from the same position.
    pub async fn send_events(&self, evbuf: &EvBuf) -> Result<(), EvBufError> {
        let mut w = self.writer.lock().await;
        if w.closed {
            return Ok(());
        }

        let evs = match evbuf.read(w.ev_seq_num) {
            Ok(evs) => evs,
            Err(e) => {
                tracing::warn!(
                    room_id = %self.room_id,
                    client_id = %self.client_id,
                    error = %e,
                    "replay point unrecoverable"
                );
                let reason = e.to_string();
                self.close_locked(&mut w, CLOSE_GOING_AWAY, &reason).await;
                return Err(e);
            }
        };

        let mut seq = w.ev_seq_num;
        for ev in &evs {
            seq += 1;
            let frame = ev.marshal(seq);
            if let Err(e) = w.sink.send(Message::Binary(frame.into())).await {
                tracing::error!(
                    room_id = %self.room_id,
                    client_id = %self.client_id,
                    error = %e,
                    "event write failed"
                );
                self.close_locked(&mut w, CLOSE_INTERNAL_ERR, "write failed").await;
                return Ok(());
            }
        }
        w.ev_seq_num = seq;
        Ok(())
    }

    /// Graceful close; the client must not reconnect.
    pub async fn close(&self, msg: &str) {
        self.close_with(CLOSE_NORMAL, msg).await;
    }

    pub async fn close_going_away(&self, msg: &str) {
        self.close_with(CLOSE_GOING_AWAY, msg).await;
    }

    pub async fn close_invalid_payload(&self, msg: &str) {
        self.close_with(CLOSE_INVALID_PAYLOAD, msg).await;
    }

    /// Close after a server-side failure; the client may retry with a
    /// fresh upgrade.
    pub async fn close_with_client_error(&self, msg: &str) {
        self.close_with(CLOSE_INTERNAL_ERR, msg).await;
    }

    /// Signals the reader task that the session let go of this peer.
    /// `send_replace` updates the value even before the reader subscribes.
    pub fn detach(&self) {
        self.detached.send_replace(true);
    }

    fn is_detached(&self) -> bool {
        *self.detached.subscribe().borrow()
    }

    async fn close_with(&self, code: u16, msg: &str) {
        let mut w = self.writer.lock().await;
        self.close_locked(&mut w, code, msg).await;
    }

    async fn close_locked(&self, w: &mut Writer, code: u16, msg: &str) {
        if w.closed {
            tracing::debug!(
                room_id = %self.room_id,
                client_id = %self.client_id,
                %msg,
                "peer already closed"
            );
            return;
        }
        tracing::debug!(
            room_id = %self.room_id,
            client_id = %self.client_id,
            code,
            %msg,
            "peer close"
        );
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: msg.to_string().into(),
        }));
        let _ = w.sink.send(frame).await;
        w.closed = true;
    }

    /// Forward-only read loop: decodes each binary frame and hands it to
    /// the room queue annotated with the sender. A full queue blocks the
    /// read, pushing backpressure onto the network.
    ///
    /// Exits on detach, client teardown, or any read error; always detaches
    /// from the client on the way out.
    pub async fn msg_loop(
        self: &Arc<Peer>,
        client: &Arc<Client>,
        mut stream: SplitStream<WebSocket>,
        room_tx: mpsc::Sender<RoomCommand>,
    ) {
        tracing::debug!(room_id = %self.room_id, client_id = %self.client_id, "peer msg loop start");
        let mut detached = self.detached.subscribe();
        let mut done = client.done_rx();

        loop {
            tokio::select! {
                _ = crate::game::wait_until_true(&mut detached) => break,
                _ = crate::game::wait_until_true(&mut done) => break,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        client.touch();
                        let msg = match unmarshal_msg(&data) {
                            Ok(msg) => msg,
                            Err(e) => {
                                tracing::error!(
                                    room_id = %self.room_id,
                                    client_id = %self.client_id,
                                    error = %e,
                                    "message decode failed"
                                );
                                let reason = e.to_string();
                                self.close_invalid_payload(&reason).await;
                                break;
                            }
                        };
                        let envelope = RoomCommand::Msg(RoomMsg {
                            sender: client.clone(),
                            msg,
                        });
                        if room_tx.send(envelope).await.is_err() {
                            // Room already torn down.
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        match frame {
                            Some(cf) if u16::from(cf.code) == CLOSE_NORMAL
                                || u16::from(cf.code) == CLOSE_GOING_AWAY =>
                            {
                                tracing::info!(
                                    room_id = %self.room_id,
                                    client_id = %self.client_id,
                                    code = u16::from(cf.code),
                                    "peer closed by client"
                                );
                            }
                            Some(cf) => {
                                tracing::warn!(
                                    room_id = %self.room_id,
                                    client_id = %self.client_id,
                                    code = u16::from(cf.code),
                                    "peer closed unexpectedly"
                                );
                            }
                            None => {
                                tracing::info!(
                                    room_id = %self.room_id,
                                    client_id = %self.client_id,
                                    "peer closed by client"
                                );
                            }
                        }
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        if !self.is_detached() {
                            tracing::error!(
                                room_id = %self.room_id,
                                client_id = %self.client_id,
                                error = %e,
                                "peer read error"
                            );
                            self.close_with_client_error("read failed").await;
                        }
                        break;
                    }
                    None => break,
                }
            }
        }

        client.detach_peer(self).await;
        tracing::debug!(room_id = %self.room_id, client_id = %self.client_id, "peer msg loop finish");
    }
}
