//! Events from the game node to clients over the WebSocket.
//!
//! Regular and response events carry a per-session sequence number:
//! `| 8bit EvType | 32bit-be sequence number | payload ... |`
//!
//! System events (PeerReady, Pong) omit it:
//! `| 8bit EvType | payload ... |`

use super::msg::RegularMsg;
use super::types::{marshal_dict, marshal_str8, marshal_strings, marshal_uint, marshal_ulong, put24, put32, Dict};

/// EvType values at or above this are sequenced.
pub const REGULAR_EV_TYPE: u8 = 30;
/// EvType values at or above this are responses to a specific message.
pub const RESPONSE_EV_TYPE: u8 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EvType {
    /// Peer handshake done. Payload: 24bit-be last accepted msg sequence.
    PeerReady = 1,
    /// Ping answer. Payload: ULong echo, UInt watcher count,
    /// Dict of player id -> last message unix-millis.
    Pong = 2,

    /// A player entered. Payload: str8 client id, Dict props.
    Joined = 30,
    /// A player left. Payload: str8 client id, str8 master client id.
    Left = 31,
    /// Room properties changed. Payload: verbatim tail of the RoomProp
    /// message starting at the client deadline field.
    RoomProp = 32,
    /// A client's properties changed. Payload: str8 client id, Dict diff.
    ClientProp = 33,
    /// The master role moved. Payload: str8 new master client id.
    MasterSwitched = 34,
    /// Relayed message. Payload: str8 sender id, opaque body.
    Message = 35,

    /// Payload: 24bit-be msg sequence number.
    Succeeded = 128,
    /// Payload: 24bit-be msg sequence number, original msg payload.
    PermissionDenied = 129,
    /// Payload: 24bit-be msg sequence number, List of unresolved client
    /// ids, original msg payload.
    TargetNotFound = 130,
}

/// A sequenced event, buffered per session for replay.
#[derive(Debug, Clone)]
pub struct Event {
    pub ev_type: EvType,
    pub payload: Vec<u8>,
}

impl Event {
    /// Frames the event with the sequence number assigned at delivery.
    pub fn marshal(&self, seq_num: u32) -> Vec<u8> {
        let mut buf = vec![0u8; self.payload.len() + 5];
        buf[0] = self.ev_type as u8;
        put32(&mut buf[1..5], seq_num);
        buf[5..].copy_from_slice(&self.payload);
        buf
    }

    pub fn joined(client_id: &str, props: &Dict) -> Event {
        let mut payload = marshal_str8(client_id);
        payload.extend_from_slice(&marshal_dict(props));
        Event {
            ev_type: EvType::Joined,
            payload,
        }
    }

    pub fn left(client_id: &str, master_id: &str) -> Event {
        let mut payload = marshal_str8(client_id);
        payload.extend_from_slice(&marshal_str8(master_id));
        Event {
            ev_type: EvType::Left,
            payload,
        }
    }

    /// The payload is the verbatim tail of the originating message, so
    /// members see exactly the bytes the master sent.
    pub fn room_prop(event_payload: Vec<u8>) -> Event {
        Event {
            ev_type: EvType::RoomProp,
            payload: event_payload,
        }
    }

    pub fn client_prop(client_id: &str, props_diff: &[u8]) -> Event {
        let mut payload = marshal_str8(client_id);
        payload.extend_from_slice(props_diff);
        Event {
            ev_type: EvType::ClientProp,
            payload,
        }
    }

    pub fn master_switched(master_id: &str) -> Event {
        Event {
            ev_type: EvType::MasterSwitched,
            payload: marshal_str8(master_id),
        }
    }

    pub fn message(sender_id: &str, body: &[u8]) -> Event {
        let mut payload = marshal_str8(sender_id);
        payload.extend_from_slice(body);
        Event {
            ev_type: EvType::Message,
            payload,
        }
    }

    pub fn succeeded(msg: &RegularMsg) -> Event {
        let mut payload = vec![0u8; 3];
        put24(&mut payload, msg.sequence_num);
        Event {
            ev_type: EvType::Succeeded,
            payload,
        }
    }

    /// Echoes the offending message back so the client can see what was
    /// rejected.
    pub fn permission_denied(msg: &RegularMsg) -> Event {
        let mut payload = vec![0u8; 3 + msg.payload.len()];
        put24(&mut payload, msg.sequence_num);
        payload[3..].copy_from_slice(&msg.payload);
        Event {
            ev_type: EvType::PermissionDenied,
            payload,
        }
    }

    /// Lists the unresolved client ids, then echoes the original payload.
    pub fn target_not_found(msg: &RegularMsg, client_ids: &[String]) -> Event {
        let mut payload = vec![0u8; 3];
        put24(&mut payload, msg.sequence_num);
        payload.extend_from_slice(&marshal_strings(client_ids));
        payload.extend_from_slice(&msg.payload);
        Event {
            ev_type: EvType::TargetNotFound,
            payload,
        }
    }
}

/// An unsequenced event, written straight to the peer.
#[derive(Debug, Clone)]
pub struct SystemEvent {
    pub ev_type: EvType,
    pub payload: Vec<u8>,
}

impl SystemEvent {
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.payload.len() + 1];
        buf[0] = self.ev_type as u8;
        buf[1..].copy_from_slice(&self.payload);
        buf
    }

    /// Tells the client the last message sequence the server accepted, so
    /// it resumes sending from the next one.
    pub fn peer_ready(last_msg_seq: u32) -> SystemEvent {
        let mut payload = vec![0u8; 3];
        put24(&mut payload, last_msg_seq);
        SystemEvent {
            ev_type: EvType::PeerReady,
            payload,
        }
    }

    pub fn pong(ping_time: u64, watchers: u32, last_msg: &Dict) -> SystemEvent {
        let mut payload = marshal_ulong(ping_time);
        payload.extend_from_slice(&marshal_uint(watchers));
        payload.extend_from_slice(&marshal_dict(last_msg));
        SystemEvent {
            ev_type: EvType::Pong,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::msg::MsgType;
    use crate::binary::types::{get24, unmarshal, Type, Value};

    fn regular(seq: u32, payload: &[u8]) -> RegularMsg {
        RegularMsg {
            mtype: MsgType::Broadcast,
            sequence_num: seq,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn event_frame_layout() {
        let ev = Event::message("abc", &[7, 8]);
        let frame = ev.marshal(0x01020304);
        assert_eq!(frame[0], EvType::Message as u8);
        assert_eq!(&frame[1..5], &[1, 2, 3, 4]);
        // str8 "abc" then the body.
        assert_eq!(&frame[5..], &[Type::Str8 as u8, 3, b'a', b'b', b'c', 7, 8]);
    }

    #[test]
    fn system_event_frame_has_no_sequence() {
        let ev = SystemEvent::peer_ready(0x000102);
        let frame = ev.marshal();
        assert_eq!(frame[0], EvType::PeerReady as u8);
        assert_eq!(get24(&frame[1..]), 0x000102);
        assert_eq!(frame.len(), 4);
    }

    #[test]
    fn succeeded_carries_msg_sequence() {
        let ev = Event::succeeded(&regular(0x0a0b0c, &[1, 2]));
        assert_eq!(ev.ev_type, EvType::Succeeded);
        assert_eq!(get24(&ev.payload), 0x0a0b0c);
        assert_eq!(ev.payload.len(), 3);
    }

    #[test]
    fn permission_denied_echoes_payload() {
        let ev = Event::permission_denied(&regular(5, &[1, 2, 3]));
        assert_eq!(get24(&ev.payload), 5);
        assert_eq!(&ev.payload[3..], &[1, 2, 3]);
    }

    #[test]
    fn target_not_found_lists_ids_then_echoes() {
        let missing = vec!["z".to_string()];
        let ev = Event::target_not_found(&regular(9, &[4, 5]), &missing);
        assert_eq!(get24(&ev.payload), 9);
        let (v, n) = unmarshal(&ev.payload[3..]).unwrap();
        match v {
            Value::List(l) => assert_eq!(l, vec![crate::binary::types::marshal_str8("z")]),
            other => panic!("expected list, got {other:?}"),
        }
        assert_eq!(&ev.payload[3 + n..], &[4, 5]);
    }

    #[test]
    fn pong_payload_shape() {
        let mut last = Dict::new();
        last.insert("a", marshal_ulong(111));
        let ev = SystemEvent::pong(42, 3, &last);
        let p = &ev.payload;
        let (v, n) = unmarshal(p).unwrap();
        assert_eq!(v, Value::ULong(42));
        let (v, m) = unmarshal(&p[n..]).unwrap();
        assert_eq!(v, Value::UInt(3));
        let (v, _) = unmarshal(&p[n + m..]).unwrap();
        assert_eq!(v, Value::Dict(last));
    }
}
