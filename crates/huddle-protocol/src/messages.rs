use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{DeviceKind, DeviceState, Identity, Member, StreamIds};

/// Messages sent from client to relay via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Enter a room's call. Idempotent per connection.
    Join {
        room_id: Uuid,
        group_code: String,
        identity: Identity,
        device_state: DeviceState,
    },

    /// Session description offer, relayed verbatim to one member.
    /// Carries the sender's identity so the receiver can register the
    /// member before any membership broadcast reaches it, and the
    /// sender's stream IDs so the receiver can classify inbound streams.
    Offer {
        receiver_id: Uuid,
        sdp: String,
        stream_ids: StreamIds,
        identity: Identity,
        device_state: DeviceState,
    },

    /// Session description answer, relayed verbatim to one member.
    Answer {
        receiver_id: Uuid,
        sdp: String,
        stream_ids: StreamIds,
    },

    /// ICE candidate, relayed verbatim to one member.
    Candidate { receiver_id: Uuid, candidate: String },

    /// Toggle one device flag; the relay updates the member record
    /// (keyed by identity, which survives reconnects) and broadcasts.
    SetDeviceState {
        room_id: Uuid,
        identity_id: String,
        kind: DeviceKind,
        value: bool,
    },

    /// Leave the current room explicitly.
    Leave,

    /// Observe a group's meeting membership without joining a call.
    SubscribeGroup { group_code: String },

    /// Stop observing a group.
    UnsubscribeGroup { group_code: String },

    /// Ping to keep connection alive
    Ping,
}

/// Messages sent from relay to client via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection: the transport-assigned
    /// connection ID the client is addressed by.
    Welcome { connection_id: Uuid },

    /// Unicast to a joiner: the members already in the room, excluding
    /// the joiner itself. Each of these will offer to the joiner once
    /// the join broadcast reaches it; the joiner only answers.
    MembershipSnapshot { room_id: Uuid, members: Vec<Member> },

    /// Broadcast to the room's group channel whenever membership
    /// changes: the full updated member list.
    MembershipUpdate { room_id: Uuid, members: Vec<Member> },

    /// Relayed offer, augmented with the sender's connection ID.
    Offer {
        sender_id: Uuid,
        sdp: String,
        stream_ids: StreamIds,
        identity: Identity,
        device_state: DeviceState,
    },

    /// Relayed answer, augmented with the sender's connection ID.
    Answer {
        sender_id: Uuid,
        sdp: String,
        stream_ids: StreamIds,
    },

    /// Relayed ICE candidate, augmented with the sender's connection ID.
    Candidate { sender_id: Uuid, candidate: String },

    /// A member toggled a device; broadcast to the room.
    DeviceStateChanged {
        room_id: Uuid,
        identity_id: String,
        kind: DeviceKind,
        value: bool,
    },

    /// A member left (explicitly or by disconnect); every remaining
    /// member tears down its peer connection to this one.
    PeerLeft { room_id: Uuid, connection_id: Uuid },

    /// Pong response to ping
    Pong,

    /// Error message
    Error { message: String },
}
