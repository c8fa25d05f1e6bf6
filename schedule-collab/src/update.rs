//! Conflict-checked update pipeline.
//!
//! ```text
//! UpdateIntent ─► validate fields ─► read (exists? caller may edit?)
//!                                         │
//!                                         ▼
//!                    store.conditional_write(id, changes, expected_version)
//!                          │                          │
//!                   Committed(v+1)            Conflict{current_version}
//! ```
//!
//! The read only serves the permission check. The version decision is made
//! inside the store's conditional write, never against the value read here,
//! so a writer that read version `v` and lost the race is still rejected.
//! The pipeline never merges, retries, or overwrites on conflict.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::identity::Identity;
use crate::protocol::RejectReason;
use crate::store::{Schedule, ScheduleChanges, ScheduleStore, StoreError, ValidationError, WriteOutcome};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpdateError {
    /// The stored version moved past the caller's expected version.
    #[error("Schedule was modified by someone else; refresh and retry (current version {current_version})")]
    Conflict { current_version: u64 },
    #[error("Schedule not found: {0}")]
    NotFound(Uuid),
    #[error("Not allowed to edit this schedule")]
    Forbidden,
    #[error("Invalid update: {0}")]
    Invalid(#[from] ValidationError),
    /// Any other persistence failure; the update did not commit.
    #[error("Update not committed: {0}")]
    Store(StoreError),
}

impl UpdateError {
    pub fn reason(&self) -> RejectReason {
        match self {
            UpdateError::Conflict { .. } => RejectReason::Conflict,
            UpdateError::NotFound(_) => RejectReason::NotFound,
            UpdateError::Forbidden => RejectReason::Forbidden,
            UpdateError::Invalid(_) => RejectReason::Invalid,
            UpdateError::Store(_) => RejectReason::Unavailable,
        }
    }

    pub fn current_version(&self) -> Option<u64> {
        match self {
            UpdateError::Conflict { current_version } => Some(*current_version),
            _ => None,
        }
    }
}

impl From<StoreError> for UpdateError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => UpdateError::NotFound(id),
            StoreError::Invalid(v) => UpdateError::Invalid(v),
            other => UpdateError::Store(other),
        }
    }
}

#[derive(Clone)]
pub struct UpdatePipeline {
    store: Arc<dyn ScheduleStore>,
}

impl UpdatePipeline {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    /// Commit `changes` iff the stored version still equals `expected_version`.
    /// With `expected_version = None` the write is unconditional.
    /// Returns the committed document, whose version is the stored one + 1.
    pub async fn apply_update(
        &self,
        actor: &Identity,
        entity_id: Uuid,
        changes: &ScheduleChanges,
        expected_version: Option<u64>,
    ) -> Result<Schedule, UpdateError> {
        changes.validate()?;

        let current = self.store.read(entity_id).await?;
        match current.permission_of(actor.user_id) {
            Some(permission) if permission.can_edit() => {}
            _ => return Err(UpdateError::Forbidden),
        }

        match self
            .store
            .conditional_write(entity_id, changes, expected_version)
            .await?
        {
            WriteOutcome::Committed(schedule) => {
                log::info!(
                    "{} committed schedule {entity_id} at version {}",
                    actor.username,
                    schedule.version
                );
                Ok(schedule)
            }
            WriteOutcome::Conflict { current_version } => {
                log::warn!(
                    "{} lost update on schedule {entity_id}: expected {:?}, stored {current_version}",
                    actor.username,
                    expected_version
                );
                Err(UpdateError::Conflict { current_version })
            }
        }
    }
}
