//! Event protocol carried over the WebSocket transport.
//!
//! Wire format: one JSON text frame per event.
//! ```text
//! {"event": "update-entity",
//!  "payload": {"entityId": "…", "changes": {"title": "X"}, "expectedVersion": 0}}
//! ```
//!
//! Inbound events (`ClientEvent`) drive the session state machine; outbound
//! events (`ServerEvent`) are produced by the session and the room broadcaster.
//! Payload keys are camelCase so browser clients can consume them directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::{Schedule, ScheduleChanges};

/// Events sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Enter an entity's room.
    JoinEntity(EntityRef),
    /// Leave an entity's room.
    LeaveEntity(EntityRef),
    /// Propose field changes guarded by an expected version.
    UpdateEntity(UpdateIntent),
    TypingStart(EntityRef),
    TypingStop(EntityRef),
}

impl ClientEvent {
    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinEntity(_) => "join-entity",
            ClientEvent::LeaveEntity(_) => "leave-entity",
            ClientEvent::UpdateEntity(_) => "update-entity",
            ClientEvent::TypingStart(_) => "typing-start",
            ClientEvent::TypingStop(_) => "typing-stop",
        }
    }

    /// The entity this event targets.
    pub fn entity_id(&self) -> Uuid {
        match self {
            ClientEvent::JoinEntity(r)
            | ClientEvent::LeaveEntity(r)
            | ClientEvent::TypingStart(r)
            | ClientEvent::TypingStop(r) => r.entity_id,
            ClientEvent::UpdateEntity(intent) => intent.entity_id,
        }
    }

    /// Decode a client event from a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Encode to a text frame (used by clients and tests).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_id: Uuid,
}

/// A proposed edit. Consumed once by the update pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateIntent {
    pub entity_id: Uuid,
    pub changes: ScheduleChanges,
    /// `None` makes the write unconditional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

/// Who performed an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: Uuid,
    pub username: String,
}

/// Why an update did not commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    Conflict,
    NotFound,
    Forbidden,
    Invalid,
    Unavailable,
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Sent once the connection is admitted.
    #[serde(rename_all = "camelCase")]
    Connected {
        user_id: Uuid,
        username: String,
        connection_id: Uuid,
    },
    /// Refusal reason, followed by a close frame.
    ConnectError { message: String },
    #[serde(rename_all = "camelCase")]
    EntityJoined {
        entity_id: Uuid,
        user_id: Uuid,
        username: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    EntityLeft {
        entity_id: Uuid,
        user_id: Uuid,
        username: String,
        timestamp: DateTime<Utc>,
    },
    /// Snapshot of the other users present, sent to a connection on join.
    #[serde(rename_all = "camelCase")]
    RoomMembers { entity_id: Uuid, members: Vec<Uuid> },
    /// Post-commit broadcast to the rest of the room.
    #[serde(rename_all = "camelCase")]
    EntityUpdated {
        entity_id: Uuid,
        changes: ScheduleChanges,
        version: u64,
        updated_by: Actor,
        timestamp: DateTime<Utc>,
    },
    /// Commit acknowledgement for the originator.
    #[serde(rename_all = "camelCase")]
    UpdateAccepted {
        entity_id: Uuid,
        version: u64,
        schedule: Schedule,
    },
    #[serde(rename_all = "camelCase")]
    UpdateRejected {
        entity_id: Uuid,
        reason: RejectReason,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_version: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Typing {
        entity_id: Uuid,
        user_id: Uuid,
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    StopTyping { entity_id: Uuid, user_id: Uuid },
    /// A dropped inbound event; the connection stays open.
    Error { message: String },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::ConnectError { .. } => "connect-error",
            ServerEvent::EntityJoined { .. } => "entity-joined",
            ServerEvent::EntityLeft { .. } => "entity-left",
            ServerEvent::RoomMembers { .. } => "room-members",
            ServerEvent::EntityUpdated { .. } => "entity-updated",
            ServerEvent::UpdateAccepted { .. } => "update-accepted",
            ServerEvent::UpdateRejected { .. } => "update-rejected",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::StopTyping { .. } => "stop-typing",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Malformed event: {0}")]
    Malformed(String),
    #[error("Binary frames are not supported")]
    BinaryFrame,
    #[error("Event of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}
