use crate::state::AppState;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{ClientMessage, Member, ServerMessage};
use tokio::sync::mpsc;
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Hand the client its transport-assigned connection ID up front;
    // everything it sends is addressed by this ID from now on.
    let connection_id = Uuid::new_v4();
    if sender
        .send(Message::Text(
            serde_json::to_string(&ServerMessage::Welcome { connection_id })
                .unwrap()
                .into(),
        ))
        .await
        .is_err()
    {
        return;
    }

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.connections.add_connection(connection_id, tx).await;

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("Invalid message from {}: {}", connection_id, e);
                        continue;
                    }
                };

                handle_client_message(&state, connection_id, client_msg).await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!("WebSocket error for connection {}: {}", connection_id, e);
                break;
            }
            _ => {}
        }
    }

    // Abrupt disconnect tears down membership exactly like an explicit
    // leave: one PeerLeft, one membership broadcast.
    leave_current_room(&state, connection_id).await;
    state.connections.remove_connection(connection_id).await;
    send_task.abort();

    tracing::debug!("Connection {} closed", connection_id);
}

async fn handle_client_message(state: &AppState, connection_id: Uuid, message: ClientMessage) {
    match message {
        ClientMessage::Join {
            room_id,
            group_code,
            identity,
            device_state,
        } => {
            // Switching rooms is an implicit leave: the old room gets the
            // same PeerLeft and membership broadcast an explicit leave
            // would have produced.
            if state
                .rooms
                .room_of(connection_id)
                .await
                .is_some_and(|current| current != room_id)
            {
                leave_current_room(state, connection_id).await;
            }

            let member = Member {
                connection_id,
                identity,
                device_state,
            };

            let Some(joined) = state.rooms.join(room_id, &group_code, member).await else {
                // Duplicate join for this connection: nothing changes,
                // nothing is broadcast, no renegotiation is triggered.
                tracing::debug!("Duplicate join from {} for room {}", connection_id, room_id);
                return;
            };

            state.connections.join_room(connection_id, room_id).await;
            state
                .connections
                .subscribe_group(connection_id, &joined.group_code)
                .await;

            // Snapshot first so the joiner learns its peers before it
            // observes its own membership broadcast.
            state
                .connections
                .send_to_connection(
                    connection_id,
                    &ServerMessage::MembershipSnapshot {
                        room_id,
                        members: joined.snapshot,
                    },
                )
                .await;
            state
                .connections
                .broadcast_to_group(
                    &joined.group_code,
                    &ServerMessage::MembershipUpdate {
                        room_id,
                        members: joined.members,
                    },
                )
                .await;

            tracing::info!("Connection {} joined room {}", connection_id, room_id);
        }
        // The relay never interprets offer/answer/candidate payloads; it
        // only stamps the sender and routes by destination connection.
        ClientMessage::Offer {
            receiver_id,
            sdp,
            stream_ids,
            identity,
            device_state,
        } => {
            state
                .connections
                .send_to_connection(
                    receiver_id,
                    &ServerMessage::Offer {
                        sender_id: connection_id,
                        sdp,
                        stream_ids,
                        identity,
                        device_state,
                    },
                )
                .await;
        }
        ClientMessage::Answer {
            receiver_id,
            sdp,
            stream_ids,
        } => {
            state
                .connections
                .send_to_connection(
                    receiver_id,
                    &ServerMessage::Answer {
                        sender_id: connection_id,
                        sdp,
                        stream_ids,
                    },
                )
                .await;
        }
        ClientMessage::Candidate {
            receiver_id,
            candidate,
        } => {
            state
                .connections
                .send_to_connection(
                    receiver_id,
                    &ServerMessage::Candidate {
                        sender_id: connection_id,
                        candidate,
                    },
                )
                .await;
        }
        ClientMessage::SetDeviceState {
            room_id,
            identity_id,
            kind,
            value,
        } => {
            let updated = state
                .rooms
                .set_device_state(room_id, &identity_id, kind, value)
                .await;
            if updated.is_none() {
                tracing::debug!(
                    "Device-state change for unknown member {} in room {}",
                    identity_id,
                    room_id
                );
                return;
            }

            state
                .connections
                .broadcast_to_room(
                    room_id,
                    &ServerMessage::DeviceStateChanged {
                        room_id,
                        identity_id,
                        kind,
                        value,
                    },
                )
                .await;
        }
        ClientMessage::Leave => {
            leave_current_room(state, connection_id).await;
        }
        ClientMessage::SubscribeGroup { group_code } => {
            state
                .connections
                .subscribe_group(connection_id, &group_code)
                .await;
        }
        ClientMessage::UnsubscribeGroup { group_code } => {
            state
                .connections
                .unsubscribe_group(connection_id, &group_code)
                .await;
        }
        ClientMessage::Ping => {
            state
                .connections
                .send_to_connection(connection_id, &ServerMessage::Pong)
                .await;
        }
    }
}

/// Remove the connection from its room (if any), then announce the new
/// membership to the group channel and the departure to the remaining
/// call participants.
async fn leave_current_room(state: &AppState, connection_id: Uuid) {
    let Some(departure) = state.rooms.remove_connection(connection_id).await else {
        return;
    };

    state
        .connections
        .leave_room(connection_id, departure.room_id)
        .await;

    state
        .connections
        .broadcast_to_group(
            &departure.group_code,
            &ServerMessage::MembershipUpdate {
                room_id: departure.room_id,
                members: departure.remaining,
            },
        )
        .await;
    state
        .connections
        .broadcast_to_room(
            departure.room_id,
            &ServerMessage::PeerLeft {
                room_id: departure.room_id,
                connection_id,
            },
        )
        .await;

    tracing::info!(
        "Connection {} left room {}",
        connection_id,
        departure.room_id
    );
}
