//! Typed binary wire format: values, client messages, server events.

pub mod event;
pub mod msg;
pub mod types;

pub use event::{Event, EvType, SystemEvent};
pub use msg::{unmarshal_msg, Msg, MsgType, RegularMsg, RoomPropPayload};
pub use types::{CodecError, Dict, List, Type, Value};
