//! Presence registry: who is online, and who is in which entity's room.
//!
//! ## Layout
//!
//! ```text
//! connections: user ──► {conn, conn, …}          (multi-device, never collapsed)
//! rooms:       entity ──► user ──► {conn, …}      (user-level membership on top,
//!                                                  per-connection joins underneath)
//! joined:      conn ──► {entity, …}               (reverse index for disconnect)
//! ```
//!
//! Invariants:
//! - a user key exists in `connections` iff that user has a live connection;
//! - a room exists iff at least one live connection has joined it and not left;
//! - a user is a member of a room iff one of their connections is in it.
//!
//! The registry is plain data with no interior locking. `CollabHub` owns the
//! single instance and serializes every call behind its one mutex.

use std::collections::{BTreeSet, HashMap, HashSet};

use uuid::Uuid;

/// Result of `join`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// User-level membership before this join.
    pub previous: BTreeSet<Uuid>,
    /// True when the user was not a member before (first device in the room).
    pub newly_present: bool,
}

/// Result of `leave`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// User-level membership before this leave.
    pub previous: BTreeSet<Uuid>,
    /// True when no connection of the user remains in the room.
    pub departed: bool,
    /// True when the room became empty and its entry was removed.
    pub room_closed: bool,
}

/// Result of `unregister_connection`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnection {
    /// The user has no live connection left.
    pub fully_offline: bool,
    /// Rooms this connection was the user's last presence in.
    pub departed_rooms: Vec<Uuid>,
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    connections: HashMap<Uuid, HashSet<Uuid>>,
    rooms: HashMap<Uuid, HashMap<Uuid, HashSet<Uuid>>>,
    joined: HashMap<Uuid, HashSet<Uuid>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_connection(&mut self, user_id: Uuid, conn_id: Uuid) {
        self.connections.entry(user_id).or_default().insert(conn_id);
    }

    /// Drop a connection and every room join it holds.
    ///
    /// Unknown connections are a no-op and report nothing.
    pub fn unregister_connection(&mut self, user_id: Uuid, conn_id: Uuid) -> Disconnection {
        let Some(conns) = self.connections.get_mut(&user_id) else {
            return Disconnection::default();
        };
        if !conns.remove(&conn_id) {
            return Disconnection::default();
        }
        let fully_offline = conns.is_empty();
        if fully_offline {
            self.connections.remove(&user_id);
        }

        let mut departed_rooms: Vec<Uuid> = Vec::new();
        if let Some(entities) = self.joined.remove(&conn_id) {
            for entity_id in entities {
                if self.remove_from_room(entity_id, user_id, conn_id).departed {
                    departed_rooms.push(entity_id);
                }
            }
        }
        departed_rooms.sort();

        Disconnection {
            fully_offline,
            departed_rooms,
        }
    }

    /// Add a connection of `user_id` to the room. Set semantics: joining twice
    /// from the same connection changes nothing.
    pub fn join(&mut self, entity_id: Uuid, user_id: Uuid, conn_id: Uuid) -> JoinOutcome {
        let room = self.rooms.entry(entity_id).or_default();
        let previous: BTreeSet<Uuid> = room.keys().copied().collect();
        let newly_present = !room.contains_key(&user_id);

        room.entry(user_id).or_default().insert(conn_id);
        self.joined.entry(conn_id).or_default().insert(entity_id);

        JoinOutcome {
            previous,
            newly_present,
        }
    }

    /// Remove a connection of `user_id` from the room. Leaving a room the
    /// connection never joined is a no-op.
    pub fn leave(&mut self, entity_id: Uuid, user_id: Uuid, conn_id: Uuid) -> LeaveOutcome {
        if let Some(entities) = self.joined.get_mut(&conn_id) {
            entities.remove(&entity_id);
            if entities.is_empty() {
                self.joined.remove(&conn_id);
            }
        }
        self.remove_from_room(entity_id, user_id, conn_id)
    }

    fn remove_from_room(&mut self, entity_id: Uuid, user_id: Uuid, conn_id: Uuid) -> LeaveOutcome {
        let Some(room) = self.rooms.get_mut(&entity_id) else {
            return LeaveOutcome {
                previous: BTreeSet::new(),
                departed: false,
                room_closed: false,
            };
        };
        let previous: BTreeSet<Uuid> = room.keys().copied().collect();

        let mut departed = false;
        if let Some(conns) = room.get_mut(&user_id) {
            if conns.remove(&conn_id) && conns.is_empty() {
                room.remove(&user_id);
                departed = true;
            }
        }

        let room_closed = room.is_empty();
        if room_closed {
            self.rooms.remove(&entity_id);
        }

        LeaveOutcome {
            previous,
            departed,
            room_closed,
        }
    }

    /// Users currently present in the room (empty if there is no room).
    pub fn members_of(&self, entity_id: Uuid) -> BTreeSet<Uuid> {
        self.rooms
            .get(&entity_id)
            .map(|room| room.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Every connection joined to the room.
    pub fn connections_in(&self, entity_id: Uuid) -> Vec<Uuid> {
        self.rooms
            .get(&entity_id)
            .map(|room| room.values().flatten().copied().collect())
            .unwrap_or_default()
    }

    /// Every live connection of a user.
    pub fn connections_of(&self, user_id: Uuid) -> Vec<Uuid> {
        self.connections
            .get(&user_id)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, conn_id: Uuid) -> BTreeSet<Uuid> {
        self.joined
            .get(&conn_id)
            .map(|entities| entities.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn has_room(&self, entity_id: Uuid) -> bool {
        self.rooms.contains_key(&entity_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn online_users(&self) -> usize {
        self.connections.len()
    }
}
