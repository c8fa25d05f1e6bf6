//! Process-wide owner of presence and room state.
//!
//! One `CollabHub` is created per server and handed to every session as an
//! `Arc`. The presence registry and the broadcaster's outbound table sit
//! behind a single mutex, so all registry and room mutations form one
//! serialized domain even on a multi-threaded runtime. The lock is only ever
//! held for synchronous map work and `try_send` calls, never across `.await`.
//!
//! Presence changes that other members must hear about go through the
//! `*_and_announce` methods, which queue `entity-joined` / `entity-left`
//! under the same guard as the registry change. Watchers therefore see
//! announcements in the order the registry changed.
//!
//! State is process-local. Several server processes behind a load balancer
//! would each see only their own connections; sharing presence between them
//! needs an external presence/broadcast backend that this hub does not provide.

use std::collections::BTreeSet;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::broadcast::{BroadcastStats, Outbound, RoomBroadcaster};
use crate::identity::Identity;
use crate::presence::{Disconnection, JoinOutcome, LeaveOutcome, PresenceRegistry};
use crate::protocol::ServerEvent;

#[derive(Default)]
struct HubState {
    presence: PresenceRegistry,
    broadcaster: RoomBroadcaster,
}

impl HubState {
    fn announce(&self, entity_id: Uuid, event: &ServerEvent, exclude: Option<Uuid>) -> usize {
        let targets = self.presence.connections_in(entity_id);
        self.broadcaster.broadcast(targets, event, exclude)
    }

    fn left(entity_id: Uuid, identity: &Identity) -> ServerEvent {
        ServerEvent::EntityLeft {
            entity_id,
            user_id: identity.user_id,
            username: identity.username.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Default)]
pub struct CollabHub {
    state: Mutex<HubState>,
}

impl CollabHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a connection live and attach its outbound queue.
    pub fn register(&self, user_id: Uuid, conn_id: Uuid, outbound: Outbound) {
        let mut state = self.state.lock();
        state.presence.register_connection(user_id, conn_id);
        state.broadcaster.attach(conn_id, outbound);
    }

    /// Drop a connection from presence, from every room it joined, and from
    /// the outbound table. `entity-left` is queued for every room where it
    /// was the user's last connection, under the same lock.
    pub fn unregister_and_announce(&self, identity: &Identity, conn_id: Uuid) -> Disconnection {
        let mut state = self.state.lock();
        state.broadcaster.detach(conn_id);
        let disconnection = state.presence.unregister_connection(identity.user_id, conn_id);
        for entity_id in &disconnection.departed_rooms {
            state.announce(*entity_id, &HubState::left(*entity_id, identity), Some(conn_id));
        }
        disconnection
    }

    /// Join, and queue `entity-joined` to the rest of the room when the user
    /// was not present before.
    pub fn join_and_announce(&self, entity_id: Uuid, identity: &Identity, conn_id: Uuid) -> JoinOutcome {
        let mut state = self.state.lock();
        let outcome = state.presence.join(entity_id, identity.user_id, conn_id);
        if outcome.newly_present {
            let joined = ServerEvent::EntityJoined {
                entity_id,
                user_id: identity.user_id,
                username: identity.username.clone(),
                timestamp: Utc::now(),
            };
            state.announce(entity_id, &joined, Some(conn_id));
        }
        outcome
    }

    /// Leave, and queue `entity-left` when no connection of the user remains.
    pub fn leave_and_announce(&self, entity_id: Uuid, identity: &Identity, conn_id: Uuid) -> LeaveOutcome {
        let mut state = self.state.lock();
        let outcome = state.presence.leave(entity_id, identity.user_id, conn_id);
        if outcome.departed {
            state.announce(entity_id, &HubState::left(entity_id, identity), Some(conn_id));
        }
        outcome
    }

    pub fn join(&self, entity_id: Uuid, user_id: Uuid, conn_id: Uuid) -> JoinOutcome {
        self.state.lock().presence.join(entity_id, user_id, conn_id)
    }

    /// Fan `event` out to the room's connections, optionally skipping one.
    pub fn broadcast(&self, entity_id: Uuid, event: &ServerEvent, exclude: Option<Uuid>) -> usize {
        self.state.lock().announce(entity_id, event, exclude)
    }

    /// Every connection in the room, originator included.
    pub fn send_to_entity(&self, entity_id: Uuid, event: &ServerEvent) -> usize {
        self.broadcast(entity_id, event, None)
    }

    /// Every live connection of one user, across devices.
    pub fn send_to_user(&self, user_id: Uuid, event: &ServerEvent) -> usize {
        let state = self.state.lock();
        let targets = state.presence.connections_of(user_id);
        state.broadcaster.broadcast(targets, event, None)
    }

    pub fn send_to_connection(&self, conn_id: Uuid, event: &ServerEvent) -> bool {
        self.state.lock().broadcaster.send_to(conn_id, event)
    }

    pub fn members_of(&self, entity_id: Uuid) -> BTreeSet<Uuid> {
        self.state.lock().presence.members_of(entity_id)
    }

    pub fn has_room(&self, entity_id: Uuid) -> bool {
        self.state.lock().presence.has_room(entity_id)
    }

    pub fn room_count(&self) -> usize {
        self.state.lock().presence.room_count()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.state.lock().presence.is_online(user_id)
    }

    pub fn online_users(&self) -> usize {
        self.state.lock().presence.online_users()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.state.lock().broadcaster.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::outbound_channel;

    #[tokio::test]
    async fn test_broadcast_reaches_room_only() {
        let hub = CollabHub::new();
        let entity = Uuid::new_v4();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (a_conn, b_conn, c_conn) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (a_tx, mut a_rx) = outbound_channel(8);
        let (b_tx, mut b_rx) = outbound_channel(8);
        let (c_tx, mut c_rx) = outbound_channel(8);
        hub.register(alice, a_conn, a_tx);
        hub.register(bob, b_conn, b_tx);
        hub.register(carol, c_conn, c_tx);

        hub.join(entity, alice, a_conn);
        hub.join(entity, bob, b_conn);

        let event = ServerEvent::StopTyping { entity_id: entity, user_id: alice };
        assert_eq!(hub.broadcast(entity, &event, Some(a_conn)), 1);
        assert!(b_rx.recv().await.is_some());
        assert!(a_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());

        assert_eq!(hub.send_to_entity(entity, &event), 2);
    }

    #[tokio::test]
    async fn test_send_to_user_reaches_every_device() {
        let hub = CollabHub::new();
        let user = Uuid::new_v4();
        let (phone, laptop) = (Uuid::new_v4(), Uuid::new_v4());
        let (p_tx, mut p_rx) = outbound_channel(4);
        let (l_tx, mut l_rx) = outbound_channel(4);
        hub.register(user, phone, p_tx);
        hub.register(user, laptop, l_tx);

        let event = ServerEvent::Error { message: "ping".into() };
        assert_eq!(hub.send_to_user(user, &event), 2);
        assert!(p_rx.recv().await.is_some());
        assert!(l_rx.recv().await.is_some());
    }

    fn identity(name: &str) -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            username: name.into(),
            status: crate::identity::AccountStatus::Active,
        }
    }

    #[test]
    fn test_unregister_detaches_and_cleans_rooms() {
        let hub = CollabHub::new();
        let alice = identity("alice");
        let (user, conn, entity) = (alice.user_id, Uuid::new_v4(), Uuid::new_v4());
        let (tx, _rx) = outbound_channel(4);
        hub.register(user, conn, tx);
        hub.join(entity, user, conn);
        assert!(hub.has_room(entity));

        let out = hub.unregister_and_announce(&alice, conn);
        assert!(out.fully_offline);
        assert_eq!(out.departed_rooms, vec![entity]);
        assert!(!hub.has_room(entity));
        assert!(!hub.is_online(user));
        assert_eq!(hub.broadcast_stats().attached, 0);
        assert!(!hub.send_to_connection(conn, &ServerEvent::Error { message: "x".into() }));
    }

    #[test]
    fn test_announcements_follow_presence_changes() {
        let hub = CollabHub::new();
        let (alice, bob) = (identity("alice"), identity("bob"));
        let entity = Uuid::new_v4();
        let (watch, phone, laptop) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (w_tx, mut w_rx) = outbound_channel(8);
        let (p_tx, mut p_rx) = outbound_channel(8);
        let (l_tx, _l_rx) = outbound_channel(8);
        hub.register(bob.user_id, watch, w_tx);
        hub.register(alice.user_id, phone, p_tx);
        hub.register(alice.user_id, laptop, l_tx);
        assert!(hub.join_and_announce(entity, &bob, watch).previous.is_empty());

        let decode = |frame: std::sync::Arc<str>| ServerEvent::decode(&frame).unwrap();

        assert!(hub.join_and_announce(entity, &alice, phone).newly_present);
        assert!(matches!(decode(w_rx.try_recv().unwrap()), ServerEvent::EntityJoined { user_id, .. } if user_id == alice.user_id));
        assert!(p_rx.try_recv().is_err(), "joiner is not told about itself");

        // Second device: no announcement.
        assert!(!hub.join_and_announce(entity, &alice, laptop).newly_present);
        assert!(w_rx.try_recv().is_err());

        assert!(!hub.leave_and_announce(entity, &alice, phone).departed);
        assert!(w_rx.try_recv().is_err());

        let out = hub.unregister_and_announce(&alice, laptop);
        assert_eq!(out.departed_rooms, vec![entity]);
        assert!(matches!(decode(w_rx.try_recv().unwrap()), ServerEvent::EntityLeft { user_id, .. } if user_id == alice.user_id));
        assert_eq!(hub.members_of(entity), BTreeSet::from([bob.user_id]));
    }
}
