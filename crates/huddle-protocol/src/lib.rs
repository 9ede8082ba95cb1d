//! Shared protocol definitions for Huddle
//!
//! The signaling message catalog exchanged between clients and the relay,
//! plus the data types both sides agree on.

mod messages;
mod types;

pub use messages::{ClientMessage, ServerMessage};
pub use types::{
    DeviceKind, DeviceState, IceServerConfig, Identity, Member, StreamIds,
};
