//! Messages from clients over the WebSocket.
//!
//! Regular message binary format:
//! `| 8bit MsgType | 24bit-be sequence number | payload ... |`
//!
//! Non-regular messages (only Ping) omit the sequence number:
//! `| 8bit MsgType | payload ... |`

use super::types::{get24, unmarshal, unmarshal_as, CodecError, Dict, Type, Value};

/// MsgType values below this carry no sequence number.
pub const REGULAR_MSG_TYPE: u8 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Keep-alive; answered with a Pong system event.
    Ping = 1,

    /// Voluntary exit. Payload: (empty)
    Leave = 30,
    /// Room property change, master only. Payload:
    /// Byte flags (1=visible, 2=joinable, 4=watchable), UInt search group,
    /// UShort max players, UShort client deadline (seconds),
    /// Dict public props diff, Dict private props diff.
    RoomProp = 31,
    /// Sender's own property change. Payload: Dict (modified keys only)
    ClientProp = 32,
    /// Message to specific clients. Payload: List of str8 ids, then body.
    Targets = 33,
    /// Message to the master client. Payload: body
    ToMaster = 34,
    /// Message to every member. Payload: body
    Broadcast = 35,
    /// Remove a client, master only. Payload: str8 client id
    Kick = 36,
    /// Hand the master role over, master only. Payload: str8 client id
    SwitchMaster = 37,
}

impl MsgType {
    pub fn from_byte(b: u8) -> Result<MsgType, CodecError> {
        Ok(match b {
            1 => MsgType::Ping,
            30 => MsgType::Leave,
            31 => MsgType::RoomProp,
            32 => MsgType::ClientProp,
            33 => MsgType::Targets,
            34 => MsgType::ToMaster,
            35 => MsgType::Broadcast,
            36 => MsgType::Kick,
            37 => MsgType::SwitchMaster,
            _ => return Err(CodecError::UnknownMsgType(b)),
        })
    }

    pub fn is_regular(self) -> bool {
        self as u8 >= REGULAR_MSG_TYPE
    }
}

/// A sequenced message (MsgType >= 30).
#[derive(Debug, Clone)]
pub struct RegularMsg {
    pub mtype: MsgType,
    pub sequence_num: u32,
    pub payload: Vec<u8>,
}

/// One decoded client message.
#[derive(Debug, Clone)]
pub enum Msg {
    Nonregular { mtype: MsgType, payload: Vec<u8> },
    Regular(RegularMsg),
}

impl Msg {
    pub fn mtype(&self) -> MsgType {
        match self {
            Msg::Nonregular { mtype, .. } => *mtype,
            Msg::Regular(m) => m.mtype,
        }
    }
}

/// Parses one binary frame into a message.
pub fn unmarshal_msg(data: &[u8]) -> Result<Msg, CodecError> {
    if data.is_empty() {
        return Err(CodecError::Short { need: 1, have: 0 });
    }
    let mtype = MsgType::from_byte(data[0])?;
    let data = &data[1..];

    if !mtype.is_regular() {
        return Ok(Msg::Nonregular {
            mtype,
            payload: data.to_vec(),
        });
    }

    if data.len() < 3 {
        return Err(CodecError::Short {
            need: 3,
            have: data.len(),
        });
    }
    Ok(Msg::Regular(RegularMsg {
        mtype,
        sequence_num: get24(data),
        payload: data[3..].to_vec(),
    }))
}

/// Flag bits in the RoomProp payload.
pub const ROOM_PROP_FLAG_VISIBLE: u8 = 1;
pub const ROOM_PROP_FLAG_JOINABLE: u8 = 2;
pub const ROOM_PROP_FLAG_WATCHABLE: u8 = 4;

/// Decoded RoomProp payload.
///
/// `event_payload` is the original byte slice starting at the client
/// deadline field, forwarded verbatim to members as the RoomProp event
/// payload. Sliced off before the tail is parsed so the echo is bit-exact.
#[derive(Debug, Clone)]
pub struct RoomPropPayload {
    pub event_payload: Vec<u8>,

    pub visible: bool,
    pub joinable: bool,
    pub watchable: bool,
    pub search_group: u32,
    pub max_players: u16,
    pub client_deadline: u16,
    pub public_props: Dict,
    pub private_props: Dict,
}

impl RoomPropPayload {
    pub fn unmarshal(payload: &[u8]) -> Result<RoomPropPayload, CodecError> {
        const MSG: &str = "RoomProp";

        let (v, n) = unmarshal_as(payload, Type::Byte)
            .map_err(|e| e.in_payload(MSG, "flags"))?;
        let flags = match v {
            Value::Byte(b) => b,
            _ => unreachable!(),
        };
        let payload = &payload[n..];

        let (v, n) = unmarshal_as(payload, Type::UInt)
            .map_err(|e| e.in_payload(MSG, "search group"))?;
        let search_group = match v {
            Value::UInt(g) => g,
            _ => unreachable!(),
        };
        let payload = &payload[n..];

        let (v, n) = unmarshal_as(payload, Type::UShort)
            .map_err(|e| e.in_payload(MSG, "max players"))?;
        let max_players = match v {
            Value::UShort(m) => m,
            _ => unreachable!(),
        };
        let payload = &payload[n..];

        // Everything from here on is echoed to clients.
        let event_payload = payload.to_vec();

        let (v, n) = unmarshal_as(payload, Type::UShort)
            .map_err(|e| e.in_payload(MSG, "client deadline"))?;
        let client_deadline = match v {
            Value::UShort(d) => d,
            _ => unreachable!(),
        };
        let payload = &payload[n..];

        let (v, n) = unmarshal_as(payload, Type::Dict)
            .map_err(|e| e.in_payload(MSG, "public props"))?;
        let public_props = match v {
            Value::Dict(d) => d,
            _ => unreachable!(),
        };
        let payload = &payload[n..];

        let (v, _) = unmarshal_as(payload, Type::Dict)
            .map_err(|e| e.in_payload(MSG, "private props"))?;
        let private_props = match v {
            Value::Dict(d) => d,
            _ => unreachable!(),
        };

        Ok(RoomPropPayload {
            event_payload,
            visible: flags & ROOM_PROP_FLAG_VISIBLE != 0,
            joinable: flags & ROOM_PROP_FLAG_JOINABLE != 0,
            watchable: flags & ROOM_PROP_FLAG_WATCHABLE != 0,
            search_group,
            max_players,
            client_deadline,
            public_props,
            private_props,
        })
    }
}

/// Parses a ClientProp payload: a single diff Dict.
pub fn unmarshal_client_prop(payload: &[u8]) -> Result<Dict, CodecError> {
    let (v, _) = unmarshal_as(payload, Type::Dict)
        .map_err(|e| e.in_payload("ClientProp", "props"))?;
    match v {
        Value::Dict(d) => Ok(d),
        _ => unreachable!(),
    }
}

/// Parses a Targets payload: a List of client-id strings, then the opaque
/// body which is relayed untouched.
pub fn unmarshal_targets_and_data(payload: &[u8]) -> Result<(Vec<String>, Vec<u8>), CodecError> {
    let (v, n) = unmarshal_as(payload, Type::List)
        .map_err(|e| e.in_payload("Targets", "targets"))?;
    let list = match v {
        Value::List(l) => l,
        _ => unreachable!(),
    };

    let mut targets = Vec::with_capacity(list.len());
    for elem in &list {
        let (v, _) = unmarshal(elem).map_err(|e| e.in_payload("Targets", "target id"))?;
        match v {
            Value::Str(s) => targets.push(s),
            other => {
                return Err(CodecError::UnexpectedTag {
                    want: Type::Str8,
                    got: other.type_of(),
                }
                .in_payload("Targets", "target id"))
            }
        }
    }

    Ok((targets, payload[n..].to_vec()))
}

/// Parses a str8 client id payload (Kick, SwitchMaster).
pub fn unmarshal_client_id(payload: &[u8]) -> Result<String, CodecError> {
    let (v, _) = unmarshal_as(payload, Type::Str8)
        .map_err(|e| e.in_payload("Kick/SwitchMaster", "client id"))?;
    match v {
        Value::Str(s) => Ok(s),
        _ => unreachable!(),
    }
}

/// Parses a Ping payload: a tagged ULong client timestamp.
pub fn unmarshal_ping_time(payload: &[u8]) -> Result<u64, CodecError> {
    let (v, _) = unmarshal_as(payload, Type::ULong)
        .map_err(|e| e.in_payload("Ping", "timestamp"))?;
    match v {
        Value::ULong(t) => Ok(t),
        _ => unreachable!(),
    }
}
