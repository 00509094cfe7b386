//! The room runtime: event buffers, peers, client sessions, the per-room
//! loop, and the registry that admits them.

pub mod client;
pub mod evbuf;
pub mod peer;
pub mod repository;
pub mod room;

pub use client::Client;
pub use evbuf::EvBuf;
pub use peer::Peer;
pub use repository::{ClientInfo, JoinedRoomRes, Repository, RoomError, RoomInfo, RoomOption};
pub use room::Room;

/// Waits until a `watch::Receiver<bool>` observes `true`, without ever
/// yielding a `watch::Ref` across an `.await` point. `wait_for` would work
/// too, but its returned guard is not `Send`, which poisons the `Send`-ness
/// of any `tokio::select!` future it's polled alongside.
pub(crate) async fn wait_until_true(rx: &mut tokio::sync::watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}
