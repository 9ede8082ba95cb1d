//! Room membership table
//!
//! Process-wide map from room ID to the ordered member list of its call.
//! Every mutation funnels through the registry, so a room has a single
//! writer at a time while distinct rooms proceed independently. Observers
//! only ever see cloned snapshots of the member list, never the live one.

use huddle_protocol::{DeviceKind, Member};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

struct Room {
    /// Group channel the room's membership changes are announced on.
    /// Recorded at first join; both explicit leave and abrupt disconnect
    /// broadcast to it, so the two paths behave identically.
    group_code: String,
    members: Vec<Member>,
}

/// Result of a successful join.
pub struct Joined {
    pub group_code: String,
    /// Members that were already in the room, excluding the joiner.
    pub snapshot: Vec<Member>,
    /// Full updated member list, including the joiner.
    pub members: Vec<Member>,
}

/// Result of removing a member.
pub struct Departure {
    pub room_id: Uuid,
    pub group_code: String,
    pub remaining: Vec<Member>,
}

pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<RwLock<Room>>>>,
    /// Reverse index: which room a connection is currently in.
    connection_rooms: RwLock<HashMap<Uuid, Uuid>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            connection_rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a member into a room, creating the room on first join.
    ///
    /// Idempotent per connection: a duplicate join returns `None` and
    /// must not re-broadcast or re-negotiate anything. A connection that
    /// is still tracked in a different room is vacated from it first, so
    /// switching rooms never leaves a ghost member behind.
    pub async fn join(
        &self,
        room_id: Uuid,
        group_code: &str,
        member: Member,
    ) -> Option<Joined> {
        if self
            .room_of(member.connection_id)
            .await
            .is_some_and(|current| current != room_id)
        {
            self.remove_connection(member.connection_id).await;
        }

        let room = {
            let mut rooms = self.rooms.write().await;
            rooms
                .entry(room_id)
                .or_insert_with(|| {
                    Arc::new(RwLock::new(Room {
                        group_code: group_code.to_string(),
                        members: Vec::new(),
                    }))
                })
                .clone()
        };

        let mut room = room.write().await;
        if room
            .members
            .iter()
            .any(|m| m.connection_id == member.connection_id)
        {
            return None;
        }

        let snapshot = room.members.clone();
        let connection_id = member.connection_id;
        room.members.push(member);
        let members = room.members.clone();
        let group_code = room.group_code.clone();
        drop(room);

        self.connection_rooms
            .write()
            .await
            .insert(connection_id, room_id);

        Some(Joined {
            group_code,
            snapshot,
            members,
        })
    }

    /// Update one device flag on the member carrying `identity_id`.
    /// Returns the updated member list, or `None` if the room or member
    /// does not exist.
    pub async fn set_device_state(
        &self,
        room_id: Uuid,
        identity_id: &str,
        kind: DeviceKind,
        value: bool,
    ) -> Option<Vec<Member>> {
        let room = self.rooms.read().await.get(&room_id)?.clone();
        let mut room = room.write().await;

        let member = room
            .members
            .iter_mut()
            .find(|m| m.identity.identity_id == identity_id)?;
        member.device_state.set(kind, value);

        Some(room.members.clone())
    }

    /// Remove a connection from whatever room it is in. The room entry is
    /// deleted once its member list empties. Returns `None` if the
    /// connection was not in any room.
    pub async fn remove_connection(&self, connection_id: Uuid) -> Option<Departure> {
        let room_id = self
            .connection_rooms
            .write()
            .await
            .remove(&connection_id)?;

        let room = self.rooms.read().await.get(&room_id)?.clone();
        let (group_code, remaining) = {
            let mut room = room.write().await;
            room.members.retain(|m| m.connection_id != connection_id);
            (room.group_code.clone(), room.members.clone())
        };

        if remaining.is_empty() {
            let mut rooms = self.rooms.write().await;
            // Re-check under the outer lock; a concurrent join may have
            // repopulated the room in the meantime.
            if let Some(entry) = rooms.get(&room_id) {
                if entry.read().await.members.is_empty() {
                    rooms.remove(&room_id);
                }
            }
        }

        Some(Departure {
            room_id,
            group_code,
            remaining,
        })
    }

    /// Which room a connection is currently in, if any.
    pub async fn room_of(&self, connection_id: Uuid) -> Option<Uuid> {
        self.connection_rooms
            .read()
            .await
            .get(&connection_id)
            .copied()
    }

    /// Snapshot of a room's member list.
    pub async fn members(&self, room_id: Uuid) -> Option<Vec<Member>> {
        let room = self.rooms.read().await.get(&room_id)?.clone();
        let room = room.read().await;
        Some(room.members.clone())
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::{DeviceState, Identity};

    fn member(name: &str) -> Member {
        Member {
            connection_id: Uuid::new_v4(),
            identity: Identity {
                identity_id: name.to_string(),
                display_name: name.to_string(),
                avatar_url: None,
            },
            device_state: DeviceState::default(),
        }
    }

    #[tokio::test]
    async fn join_creates_room_and_snapshot_excludes_caller() {
        let registry = RoomRegistry::new();
        let room_id = Uuid::new_v4();

        let alice = member("alice");
        let joined = registry.join(room_id, "g-1", alice.clone()).await.unwrap();
        assert!(joined.snapshot.is_empty());
        assert_eq!(joined.members, vec![alice.clone()]);

        let bob = member("bob");
        let joined = registry.join(room_id, "g-1", bob.clone()).await.unwrap();
        assert_eq!(joined.snapshot, vec![alice.clone()]);
        assert_eq!(joined.members.len(), 2);
        assert_eq!(registry.room_of(bob.connection_id).await, Some(room_id));
    }

    #[tokio::test]
    async fn duplicate_join_is_a_no_op() {
        let registry = RoomRegistry::new();
        let room_id = Uuid::new_v4();
        let alice = member("alice");

        assert!(registry.join(room_id, "g-1", alice.clone()).await.is_some());
        assert!(registry.join(room_id, "g-1", alice.clone()).await.is_none());
        assert_eq!(registry.members(room_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn device_state_update_is_keyed_by_identity() {
        let registry = RoomRegistry::new();
        let room_id = Uuid::new_v4();
        registry.join(room_id, "g-1", member("alice")).await.unwrap();
        registry.join(room_id, "g-1", member("bob")).await.unwrap();

        let members = registry
            .set_device_state(room_id, "alice", DeviceKind::Mic, false)
            .await
            .unwrap();
        let alice = members
            .iter()
            .find(|m| m.identity.identity_id == "alice")
            .unwrap();
        let bob = members
            .iter()
            .find(|m| m.identity.identity_id == "bob")
            .unwrap();
        assert!(!alice.device_state.mic);
        assert!(bob.device_state.mic);

        assert!(
            registry
                .set_device_state(room_id, "carol", DeviceKind::Cam, false)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn room_is_deleted_once_empty() {
        let registry = RoomRegistry::new();
        let room_id = Uuid::new_v4();
        let alice = member("alice");
        let bob = member("bob");
        registry.join(room_id, "g-1", alice.clone()).await.unwrap();
        registry.join(room_id, "g-1", bob.clone()).await.unwrap();

        let departure = registry.remove_connection(alice.connection_id).await.unwrap();
        assert_eq!(departure.room_id, room_id);
        assert_eq!(departure.remaining.len(), 1);
        assert_eq!(registry.room_count().await, 1);

        let departure = registry.remove_connection(bob.connection_id).await.unwrap();
        assert!(departure.remaining.is_empty());
        assert_eq!(registry.room_count().await, 0);
        assert!(registry.remove_connection(bob.connection_id).await.is_none());
    }

    #[tokio::test]
    async fn joining_another_room_vacates_the_previous_one() {
        let registry = RoomRegistry::new();
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();
        let alice = member("alice");
        let bob = member("bob");
        registry.join(room_a, "g-1", alice.clone()).await.unwrap();
        registry.join(room_a, "g-1", bob.clone()).await.unwrap();

        registry.join(room_b, "g-2", alice.clone()).await.unwrap();

        assert_eq!(registry.room_of(alice.connection_id).await, Some(room_b));
        let room_a_members = registry.members(room_a).await.unwrap();
        assert_eq!(room_a_members.len(), 1);
        assert_eq!(room_a_members[0].connection_id, bob.connection_id);

        // Switching out of a now-empty room garbage-collects it.
        registry.join(room_a, "g-1", alice.clone()).await.unwrap();
        assert_eq!(registry.room_of(alice.connection_id).await, Some(room_a));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn rooms_are_independent() {
        let registry = RoomRegistry::new();
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();
        let alice = member("alice");
        registry.join(room_a, "g-1", alice.clone()).await.unwrap();
        registry.join(room_b, "g-2", member("bob")).await.unwrap();

        registry.remove_connection(alice.connection_id).await.unwrap();
        assert_eq!(registry.room_count().await, 1);
        assert_eq!(registry.members(room_b).await.unwrap().len(), 1);
    }
}
