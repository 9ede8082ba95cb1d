use huddle_protocol::ServerMessage;
use std::collections::{HashMap, HashSet};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub subscribed_groups: HashSet<String>,
    pub room: Option<Uuid>,
}

/// Tracks live WebSocket connections and who listens to what.
///
/// Every send is fire-and-forget: a message addressed to a connection that
/// is gone is logged and dropped, never surfaced to the sender.
pub struct ConnectionManager {
    /// Map from connection ID to message sender channel
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
    /// Map from connection ID to connection info
    connection_info: RwLock<HashMap<Uuid, ConnectionInfo>>,
    /// Map from room ID to connection IDs participating in that call
    room_subscribers: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    /// Map from group code to connection IDs observing that group's calls
    group_subscribers: RwLock<HashMap<String, HashSet<Uuid>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            connection_info: RwLock::new(HashMap::new()),
            room_subscribers: RwLock::new(HashMap::new()),
            group_subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(
        &self,
        connection_id: Uuid,
        sender: mpsc::UnboundedSender<String>,
    ) {
        self.senders.write().await.insert(connection_id, sender);
        self.connection_info
            .write()
            .await
            .insert(connection_id, ConnectionInfo::default());

        tracing::debug!("Connection {} registered", connection_id);
    }

    pub async fn remove_connection(&self, connection_id: Uuid) {
        let info = self.connection_info.write().await.remove(&connection_id);

        if let Some(info) = info {
            if let Some(room_id) = info.room {
                if let Some(subs) = self.room_subscribers.write().await.get_mut(&room_id) {
                    subs.remove(&connection_id);
                }
            }
            for code in &info.subscribed_groups {
                if let Some(subs) = self.group_subscribers.write().await.get_mut(code) {
                    subs.remove(&connection_id);
                }
            }
        }

        self.senders.write().await.remove(&connection_id);
        tracing::debug!("Connection {} removed", connection_id);
    }

    /// Enter a room's broadcast domain (call participants only).
    pub async fn join_room(&self, connection_id: Uuid, room_id: Uuid) {
        if let Some(info) = self.connection_info.write().await.get_mut(&connection_id) {
            info.room = Some(room_id);
        }
        self.room_subscribers
            .write()
            .await
            .entry(room_id)
            .or_default()
            .insert(connection_id);
    }

    pub async fn leave_room(&self, connection_id: Uuid, room_id: Uuid) {
        if let Some(info) = self.connection_info.write().await.get_mut(&connection_id) {
            info.room = None;
        }
        if let Some(subs) = self.room_subscribers.write().await.get_mut(&room_id) {
            subs.remove(&connection_id);
        }
    }

    /// Observe a group's membership announcements.
    pub async fn subscribe_group(&self, connection_id: Uuid, group_code: &str) {
        if let Some(info) = self.connection_info.write().await.get_mut(&connection_id) {
            info.subscribed_groups.insert(group_code.to_string());
        }
        self.group_subscribers
            .write()
            .await
            .entry(group_code.to_string())
            .or_default()
            .insert(connection_id);
    }

    pub async fn unsubscribe_group(&self, connection_id: Uuid, group_code: &str) {
        if let Some(info) = self.connection_info.write().await.get_mut(&connection_id) {
            info.subscribed_groups.remove(group_code);
        }
        if let Some(subs) = self.group_subscribers.write().await.get_mut(group_code) {
            subs.remove(&connection_id);
        }
    }

    pub async fn broadcast_to_room(&self, room_id: Uuid, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let subscribers = self.room_subscribers.read().await;
        let senders = self.senders.read().await;

        if let Some(subs) = subscribers.get(&room_id) {
            for conn_id in subs {
                if let Some(sender) = senders.get(conn_id) {
                    if sender.send(json.clone()).is_err() {
                        tracing::debug!("Dropped room broadcast to dead connection {}", conn_id);
                    }
                }
            }
        }
    }

    pub async fn broadcast_to_group(&self, group_code: &str, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let subscribers = self.group_subscribers.read().await;
        let senders = self.senders.read().await;

        if let Some(subs) = subscribers.get(group_code) {
            for conn_id in subs {
                if let Some(sender) = senders.get(conn_id) {
                    if sender.send(json.clone()).is_err() {
                        tracing::debug!("Dropped group broadcast to dead connection {}", conn_id);
                    }
                }
            }
        }
    }

    pub async fn send_to_connection(&self, connection_id: Uuid, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let senders = self.senders.read().await;
        match senders.get(&connection_id) {
            Some(sender) => {
                if sender.send(json).is_err() {
                    tracing::debug!("Dropped message to dead connection {}", connection_id);
                }
            }
            None => {
                // Stale target: the receiver disconnected while the
                // message was in flight. Valid discard, not an error.
                tracing::debug!("Dropped message to unknown connection {}", connection_id);
            }
        }
    }

    pub async fn is_connected(&self, connection_id: Uuid) -> bool {
        self.senders.read().await.contains_key(&connection_id)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
