//! Session lifecycle controller: one state machine per connection.
//!
//! ```text
//!  Connecting ──admit ok──► Authenticated ──activate──► Active ──disconnect──► Disconnected
//!      │                                                  │ ▲
//!      └──────────────── refused ─────────────────────────┼─┼──► Disconnected
//!                                                         │ │
//!                     join / leave / update / typing ─────┘ │
//!                                                           └── replies to the originator,
//!                                                               broadcasts via CollabHub
//! ```
//!
//! `handle` dispatches on `(state, event)`. Client events are only legal in
//! `Active`; anywhere else they are `SessionError::IllegalTransition`.
//! Cleanup (`disconnect`) is idempotent and also runs from `Drop`, so a
//! connection task that ends by error, panic, or cancellation still leaves
//! its rooms and announces the departure.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::broadcast::Outbound;
use crate::hub::CollabHub;
use crate::identity::{AuthError, ConnectionGate, Identity};
use crate::presence::Disconnection;
use crate::protocol::{Actor, ClientEvent, ServerEvent, UpdateIntent};
use crate::update::UpdatePipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticated => "authenticated",
            SessionState::Active => "active",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Connection refused: {0}")]
    Refused(#[from] AuthError),
    #[error("Cannot {action} while {state}")]
    IllegalTransition {
        state: SessionState,
        action: &'static str,
    },
}

pub struct Session {
    conn_id: Uuid,
    state: SessionState,
    identity: Option<Identity>,
    hub: Arc<CollabHub>,
    pipeline: UpdatePipeline,
}

impl Session {
    pub fn new(conn_id: Uuid, hub: Arc<CollabHub>, pipeline: UpdatePipeline) -> Self {
        Self {
            conn_id,
            state: SessionState::Connecting,
            identity: None,
            hub,
            pipeline,
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// `Connecting → Authenticated`, or straight to `Disconnected` on refusal.
    pub async fn authenticate(
        &mut self,
        gate: &ConnectionGate,
        token: Option<&str>,
    ) -> Result<&Identity, SessionError> {
        self.expect_state(SessionState::Connecting, "authenticate")?;

        match gate.admit(token).await {
            Ok(identity) => {
                self.state = SessionState::Authenticated;
                Ok(self.identity.insert(identity))
            }
            Err(e) => {
                log::warn!("Refused connection {}: {e}", self.conn_id);
                self.state = SessionState::Disconnected;
                Err(SessionError::Refused(e))
            }
        }
    }

    /// `Authenticated → Active`: the connection becomes visible to presence
    /// and starts receiving broadcasts through `outbound`.
    pub fn activate(&mut self, outbound: Outbound) -> Result<ServerEvent, SessionError> {
        self.expect_state(SessionState::Authenticated, "activate")?;
        let identity = self.active_identity("activate")?.clone();

        self.hub.register(identity.user_id, self.conn_id, outbound);
        self.state = SessionState::Active;
        log::info!("User connected: {} ({})", identity.username, self.conn_id);

        Ok(ServerEvent::Connected {
            user_id: identity.user_id,
            username: identity.username,
            connection_id: self.conn_id,
        })
    }

    /// Handle one inbound event. Returns the replies for this connection only;
    /// room broadcasts have already been queued when this returns.
    pub async fn handle(&mut self, event: ClientEvent) -> Result<Vec<ServerEvent>, SessionError> {
        match (self.state, event) {
            (SessionState::Active, ClientEvent::JoinEntity(r)) => self.on_join(r.entity_id),
            (SessionState::Active, ClientEvent::LeaveEntity(r)) => self.on_leave(r.entity_id),
            (SessionState::Active, ClientEvent::UpdateEntity(intent)) => self.on_update(intent).await,
            (SessionState::Active, ClientEvent::TypingStart(r)) => self.on_typing(r.entity_id, true),
            (SessionState::Active, ClientEvent::TypingStop(r)) => self.on_typing(r.entity_id, false),
            (state, event) => Err(SessionError::IllegalTransition {
                state,
                action: event.name(),
            }),
        }
    }

    fn on_join(&mut self, entity_id: Uuid) -> Result<Vec<ServerEvent>, SessionError> {
        let identity = self.active_identity("join-entity")?;
        let outcome = self.hub.join_and_announce(entity_id, identity, self.conn_id);

        if outcome.newly_present {
            log::info!("{} joined schedule {entity_id}", identity.username);
        } else {
            log::debug!("{} joined schedule {entity_id} from another device", identity.username);
        }

        let members = outcome
            .previous
            .into_iter()
            .filter(|user| *user != identity.user_id)
            .collect();
        Ok(vec![ServerEvent::RoomMembers { entity_id, members }])
    }

    fn on_leave(&mut self, entity_id: Uuid) -> Result<Vec<ServerEvent>, SessionError> {
        let identity = self.active_identity("leave-entity")?;
        let outcome = self.hub.leave_and_announce(entity_id, identity, self.conn_id);

        if outcome.departed {
            log::info!("{} left schedule {entity_id}", identity.username);
        }
        if outcome.room_closed {
            log::debug!("Room {entity_id} closed");
        }
        Ok(Vec::new())
    }

    async fn on_update(&mut self, intent: UpdateIntent) -> Result<Vec<ServerEvent>, SessionError> {
        let identity = self.active_identity("update-entity")?.clone();
        let UpdateIntent {
            entity_id,
            changes,
            expected_version,
        } = intent;

        let reply = match self
            .pipeline
            .apply_update(&identity, entity_id, &changes, expected_version)
            .await
        {
            Ok(schedule) => {
                let updated = ServerEvent::EntityUpdated {
                    entity_id,
                    changes,
                    version: schedule.version,
                    updated_by: Actor {
                        user_id: identity.user_id,
                        username: identity.username.clone(),
                    },
                    timestamp: Utc::now(),
                };
                self.hub.broadcast(entity_id, &updated, Some(self.conn_id));
                ServerEvent::UpdateAccepted {
                    entity_id,
                    version: schedule.version,
                    schedule,
                }
            }
            Err(e) => {
                if e.current_version().is_none() {
                    log::warn!("Update of {entity_id} by {} rejected: {e}", identity.username);
                }
                ServerEvent::UpdateRejected {
                    entity_id,
                    reason: e.reason(),
                    message: e.to_string(),
                    current_version: e.current_version(),
                }
            }
        };
        Ok(vec![reply])
    }

    fn on_typing(&mut self, entity_id: Uuid, started: bool) -> Result<Vec<ServerEvent>, SessionError> {
        let identity = self.active_identity("typing")?;
        let event = if started {
            ServerEvent::Typing {
                entity_id,
                user_id: identity.user_id,
                username: identity.username.clone(),
            }
        } else {
            ServerEvent::StopTyping {
                entity_id,
                user_id: identity.user_id,
            }
        };
        self.hub.broadcast(entity_id, &event, Some(self.conn_id));
        Ok(Vec::new())
    }

    /// `* → Disconnected`. Unregisters the connection and tells each room it
    /// was the user's last presence in that the user left. Safe to call twice.
    pub fn disconnect(&mut self) -> Disconnection {
        let was_active = self.state == SessionState::Active;
        self.state = SessionState::Disconnected;
        if !was_active {
            return Disconnection::default();
        }
        let Some(identity) = self.identity.as_ref() else {
            return Disconnection::default();
        };

        let disconnection = self.hub.unregister_and_announce(identity, self.conn_id);
        log::info!(
            "User disconnected: {} ({}), left {} room(s){}",
            identity.username,
            self.conn_id,
            disconnection.departed_rooms.len(),
            if disconnection.fully_offline { ", now offline" } else { "" }
        );
        disconnection
    }

    fn expect_state(&self, expected: SessionState, action: &'static str) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::IllegalTransition {
                state: self.state,
                action,
            })
        }
    }

    fn active_identity(&self, action: &'static str) -> Result<&Identity, SessionError> {
        self.identity.as_ref().ok_or(SessionError::IllegalTransition {
            state: self.state,
            action,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}
