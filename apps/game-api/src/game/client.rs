//! Per-member logical presence in a room, outliving any single peer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use crate::auth::{self, AuthError};
use crate::binary::types::marshal_dict;
use crate::binary::{Dict, Event, SystemEvent};
use crate::game::evbuf::{EvBuf, EvBufError};
use crate::game::peer::{Peer, PeerError};

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("client already left the room")]
    Gone,
    #[error("peer ready failed: {0}")]
    Ready(PeerError),
    #[error("replay failed: {0}")]
    Replay(EvBufError),
}

/// Outcome of checking an inbound 24-bit message sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    Accept,
    /// Resent after a reattach; already processed.
    Duplicate,
    /// The sender skipped ahead; the stream is broken.
    Gap,
}

pub struct Client {
    pub id: String,
    pub room_id: String,
    pub is_player: bool,

    auth_key: String,
    evbuf: EvBuf,
    peer: tokio::sync::Mutex<Option<Arc<Peer>>>,
    done: watch::Sender<bool>,
    /// Last inbound message sequence accepted by the room loop.
    last_msg_seq: AtomicU32,
    last_active: Mutex<Instant>,
    props: Mutex<Dict>,
}

impl Client {
    pub fn new(
        id: String,
        room_id: String,
        is_player: bool,
        props: Dict,
        auth_key: String,
        evbuf_capacity: usize,
    ) -> Arc<Client> {
        let client = Arc::new(Client {
            id,
            room_id,
            is_player,
            auth_key,
            evbuf: EvBuf::with_capacity(evbuf_capacity),
            peer: tokio::sync::Mutex::new(None),
            done: watch::channel(false).0,
            last_msg_seq: AtomicU32::new(0),
            last_active: Mutex::new(Instant::now()),
            props: Mutex::new(props),
        });
        client.spawn_event_pump();
        client
    }

    /// Attaches a new peer, replacing (and gracefully closing) any current
    /// one. Concurrent attaches are serialized by the slot lock; the latest
    /// wins. Sends PeerReady then replays buffered events from
    /// `last_ev_seq + 1`.
    pub async fn attach_peer(&self, peer: Arc<Peer>, last_ev_seq: u32) -> Result<(), AttachError> {
        if self.is_done() {
            return Err(AttachError::Gone);
        }

        let mut slot = self.peer.lock().await;
        if let Some(old) = slot.take() {
            tracing::debug!(room_id = %self.room_id, client_id = %self.id, "replacing attached peer");
            old.detach();
            old.close("peer replaced").await;
        }

        peer.seed_ev_seq(last_ev_seq).await;
        peer.send_ready(self.last_msg_seq())
            .await
            .map_err(AttachError::Ready)?;
        peer.send_events(&self.evbuf)
            .await
            .map_err(AttachError::Replay)?;

        self.touch();
        *slot = Some(peer);
        Ok(())
    }

    /// Clears the peer slot, but only if `peer` is still the attached one.
    pub async fn detach_peer(&self, peer: &Arc<Peer>) {
        let mut slot = self.peer.lock().await;
        if let Some(cur) = slot.as_ref() {
            if Arc::ptr_eq(cur, peer) {
                *slot = None;
                peer.detach();
            }
        }
    }

    /// Verifies the bearer token from the upgrade request against this
    /// session's key material.
    pub fn valid_auth_data(&self, bearer: &str) -> Result<(), AuthError> {
        auth::valid_auth_data(&self.auth_key, &self.id, bearer)
    }

    /// Queues one event for delivery; the event pump flushes it to the
    /// attached peer. Called only from the room loop.
    pub fn send_event(&self, ev: Event) {
        self.evbuf.append(ev);
    }

    /// Writes one unsequenced event straight to the attached peer, if any.
    pub async fn send_system_event(&self, ev: &SystemEvent) {
        let peer = self.peer.lock().await.clone();
        if let Some(p) = peer {
            let _ = p.send_system_event(ev).await;
        }
    }

    /// Synchronously drains the event buffer to the attached peer. Used on
    /// removal so the final events land before the close frame.
    pub async fn flush_events(&self) {
        let peer = self.peer.lock().await.clone();
        if let Some(p) = peer {
            let _ = p.send_events(&self.evbuf).await;
        }
    }

    /// Closes the attached peer, if any, with a normal close.
    pub async fn close_peer(&self, msg: &str) {
        let peer = self.peer.lock().await.clone();
        if let Some(p) = peer {
            p.close(msg).await;
        }
    }

    /// Closes the attached peer after a client-side protocol error;
    /// the client may attach a fresh peer.
    pub async fn close_peer_with_error(&self, msg: &str) {
        let peer = self.peer.lock().await.clone();
        if let Some(p) = peer {
            p.close_with_client_error(msg).await;
        }
    }

    pub async fn close_peer_invalid_payload(&self, msg: &str) {
        let peer = self.peer.lock().await.clone();
        if let Some(p) = peer {
            p.close_invalid_payload(msg).await;
        }
    }

    pub fn last_msg_seq(&self) -> u32 {
        self.last_msg_seq.load(Ordering::Acquire)
    }

    /// Checks and records an inbound message sequence. Called only from
    /// the room loop; sequences never wrap within a session.
    pub fn accept_msg_seq(&self, seq: u32) -> SeqCheck {
        let last = self.last_msg_seq.load(Ordering::Acquire);
        if seq <= last {
            return SeqCheck::Duplicate;
        }
        if seq != last + 1 {
            return SeqCheck::Gap;
        }
        self.last_msg_seq.store(seq, Ordering::Release);
        SeqCheck::Accept
    }

    /// Resets the idle deadline. Called on every inbound frame and on
    /// peer attach.
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    pub fn props(&self) -> Dict {
        self.props.lock().clone()
    }

    pub fn props_bytes(&self) -> Vec<u8> {
        marshal_dict(&self.props.lock())
    }

    /// Applies a diff to this client's props. Called only from the room
    /// loop.
    pub fn merge_props(&self, diff: &Dict) {
        self.props.lock().merge_diff(diff);
    }

    /// Ends the session. The event pump stops and attached readers exit.
    /// `send_replace` updates the value even with no live subscriber.
    pub fn mark_done(&self) {
        self.done.send_replace(true);
    }

    pub fn is_done(&self) -> bool {
        *self.done.subscribe().borrow()
    }

    pub fn done_rx(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    /// Flushes the event buffer to whichever peer is attached, waking on
    /// every append. An unrecoverable replay position only logs: the peer
    /// has already closed itself with 1001, and the session is cleaned up
    /// by the room deadline if no fresh peer arrives.
    fn spawn_event_pump(self: &Arc<Self>) {
        let client = self.clone();
        tokio::spawn(async move {
            let mut done = client.done_rx();
            loop {
                tokio::select! {
                    _ = crate::game::wait_until_true(&mut done) => break,
                    _ = client.evbuf.notified() => {
                        let peer = client.peer.lock().await.clone();
                        if let Some(p) = peer {
                            if let Err(e) = p.send_events(&client.evbuf).await {
                                tracing::warn!(
                                    room_id = %client.room_id,
                                    client_id = %client.id,
                                    error = %e,
                                    "event pump lost replay position"
                                );
                            }
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> Arc<Client> {
        Client::new(
            "c1".into(),
            "room1".into(),
            true,
            Dict::new(),
            "key".into(),
            8,
        )
    }

    #[tokio::test]
    async fn msg_seq_accepts_contiguous_only() {
        let c = test_client();
        assert_eq!(c.accept_msg_seq(1), SeqCheck::Accept);
        assert_eq!(c.accept_msg_seq(2), SeqCheck::Accept);
        assert_eq!(c.accept_msg_seq(2), SeqCheck::Duplicate);
        assert_eq!(c.accept_msg_seq(1), SeqCheck::Duplicate);
        assert_eq!(c.accept_msg_seq(5), SeqCheck::Gap);
        // A gap does not advance the accepted sequence.
        assert_eq!(c.last_msg_seq(), 2);
        assert_eq!(c.accept_msg_seq(3), SeqCheck::Accept);
    }

    #[tokio::test]
    async fn touch_resets_idle_time() {
        let c = test_client();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(c.idle_for() >= Duration::from_millis(10));
        c.touch();
        assert!(c.idle_for() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn merge_props_applies_diff() {
        let c = test_client();
        let mut diff = Dict::new();
        diff.insert("hp", crate::binary::types::marshal_int(10));
        c.merge_props(&diff);
        assert_eq!(
            c.props().get("hp"),
            Some(&crate::binary::types::marshal_int(10)[..])
        );

        let mut del = Dict::new();
        del.insert("hp", Vec::new());
        c.merge_props(&del);
        assert!(c.props().get("hp").is_none());
    }

    #[tokio::test]
    async fn done_marks_session_over() {
        let c = test_client();
        assert!(!c.is_done());
        c.mark_done();
        assert!(c.is_done());
    }
}
