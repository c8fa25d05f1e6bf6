//! # schedule-collab: real-time collaboration engine for shared schedules
//!
//! Authenticated WebSocket clients join per-schedule rooms, see who else is
//! present, relay typing indicators, and submit version-checked edits that
//! are committed once and fanned out to the rest of the room.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON text frames   ┌──────────────┐
//! │ CollabClient │ ◄──────────────────► │ CollabServer │
//! │ (per device) │   {event, payload}   │  (central)   │
//! └──────────────┘                      └──────┬───────┘
//!                                              │ one Session per connection
//!                          ┌───────────────────┼─────────────────────┐
//!                          ▼                   ▼                     ▼
//!                   ConnectionGate         CollabHub           UpdatePipeline
//!                   (JWT → Identity)   ┌──────┴───────┐      (permission + CAS)
//!                                      │ Presence     │             │
//!                                      │ Registry     │             ▼
//!                                      │ RoomBroad-   │       ScheduleStore
//!                                      │ caster       │   (memory | RocksDB)
//!                                      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: client/server event envelopes
//! - [`identity`]: token verification and the connection gate
//! - [`presence`]: who is online and who is in which room
//! - [`broadcast`]: fire-and-forget fan-out over bounded outbound queues
//! - [`hub`]: the single lock around presence and fan-out
//! - [`update`]: conflict-checked update pipeline
//! - [`session`]: per-connection lifecycle state machine
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client
//! - [`store`]: schedule model and storage backends

pub mod broadcast;
pub mod client;
pub mod hub;
pub mod identity;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;
pub mod update;

// Re-exports for convenience
pub use broadcast::{outbound_channel, BroadcastStats, Outbound, OutboundRx, RoomBroadcaster};
pub use client::{ClientError, CollabClient, ConnectionState};
pub use hub::CollabHub;
pub use identity::{
    issue_token, AccountStatus, AuthError, ConnectionGate, Identity, IdentityProvider,
    InMemoryUserDirectory, JwtIdentityProvider, UserDirectory, UserRecord,
};
pub use presence::{Disconnection, JoinOutcome, LeaveOutcome, PresenceRegistry};
pub use protocol::{Actor, ClientEvent, EntityRef, ProtocolError, RejectReason, ServerEvent, UpdateIntent};
pub use server::{seed_dev_users, CollabServer, DevUser, ServerConfig, ServerError, ServerStats};
pub use session::{Session, SessionError, SessionState};
pub use store::{
    MemoryStore, NewSchedule, Participant, Permission, RocksStore, Schedule, ScheduleChanges,
    ScheduleStatus, ScheduleStore, StoreConfig, StoreError, ValidationError, WriteOutcome,
};
pub use update::{UpdateError, UpdatePipeline};
