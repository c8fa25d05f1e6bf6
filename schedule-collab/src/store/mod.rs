//! Persistence contract for versioned schedule documents.
//!
//! ```text
//! ┌────────────────┐   read / conditional_write   ┌──────────────┐
//! │ UpdatePipeline │ ───────────────────────────► │ ScheduleStore│
//! └────────────────┘                              └──────┬───────┘
//!                                                        │
//!                                         ┌──────────────┴──────────────┐
//!                                         ▼                             ▼
//!                                  MemoryStore (tests,          RocksStore (durable,
//!                                  no storage path)             CF schedules + users)
//! ```
//!
//! The stored `version` is the single source of truth for conflict
//! detection. `conditional_write` must compare and mutate as one atomic
//! step: two writers holding the same expected version can never both commit.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

pub const MAX_TITLE_CHARS: usize = 100;
pub const MAX_DESCRIPTION_CHARS: usize = 500;

/// Access level of a participant on one schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Owner,
    Editor,
    Viewer,
}

impl Permission {
    pub fn can_edit(self) -> bool {
        matches!(self, Permission::Owner | Permission::Editor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: Uuid,
    pub permission: Permission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

/// The authoritative, persisted calendar entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub participants: Vec<Participant>,
    pub tags: Vec<String>,
    pub status: ScheduleStatus,
    /// Starts at 0, +1 on every accepted write.
    pub version: u64,
    pub share_token: Option<String>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Build a fresh version-0 document. The creator is always the first
    /// participant, as owner; any supplied entry for the creator is dropped.
    pub fn create(draft: NewSchedule, creator: Uuid) -> Result<Self, ValidationError> {
        let now = Utc::now();
        let mut participants = vec![Participant {
            user_id: creator,
            permission: Permission::Owner,
        }];
        participants.extend(draft.participants.into_iter().filter(|p| p.user_id != creator));

        let schedule = Self {
            id: Uuid::new_v4(),
            title: draft.title.trim().to_string(),
            description: draft.description,
            start_time: draft.start_time,
            end_time: draft.end_time,
            participants,
            tags: draft.tags,
            status: ScheduleStatus::Pending,
            version: 0,
            share_token: None,
            created_by: creator,
            created_at: now,
            updated_at: now,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    /// Permission of `user_id`, if they participate.
    pub fn permission_of(&self, user_id: Uuid) -> Option<Permission> {
        self.participants
            .iter()
            .find(|p| p.user_id == user_id)
            .map(|p| p.permission)
    }

    /// Document-level invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_title(&self.title)?;
        if let Some(description) = &self.description {
            validate_description(description)?;
        }
        if self.end_time <= self.start_time {
            return Err(ValidationError::EndBeforeStart);
        }
        Ok(())
    }

    /// Apply `changes` and bump the version. Leaves `self` untouched on error.
    pub fn apply(&mut self, changes: &ScheduleChanges) -> Result<(), ValidationError> {
        let mut next = self.clone();
        if let Some(title) = &changes.title {
            next.title = title.trim().to_string();
        }
        if let Some(description) = &changes.description {
            next.description = Some(description.clone());
        }
        if let Some(start) = changes.start_time {
            next.start_time = start;
        }
        if let Some(end) = changes.end_time {
            next.end_time = end;
        }
        if let Some(tags) = &changes.tags {
            next.tags = tags.clone();
        }
        if let Some(status) = changes.status {
            next.status = status;
        }
        if let Some(token) = &changes.share_token {
            next.share_token = Some(token.clone());
        }
        next.validate()?;

        next.version += 1;
        next.updated_at = Utc::now();
        *self = next;
        Ok(())
    }
}

/// Input for `ScheduleStore::create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSchedule {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
}

/// Proposed field changes. `None` leaves a field untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ScheduleStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_token: Option<String>,
}

impl ScheduleChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.tags.is_none()
            && self.status.is_none()
            && self.share_token.is_none()
    }

    /// Field-local checks that need no stored document.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::NoChanges);
        }
        if let Some(title) = &self.title {
            validate_title(title)?;
        }
        if let Some(description) = &self.description {
            validate_description(description)?;
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if end <= start {
                return Err(ValidationError::EndBeforeStart);
            }
        }
        Ok(())
    }
}

fn validate_title(title: &str) -> Result<(), ValidationError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyTitle);
    }
    if trimmed.chars().count() > MAX_TITLE_CHARS {
        return Err(ValidationError::TitleTooLong(MAX_TITLE_CHARS));
    }
    Ok(())
}

fn validate_description(description: &str) -> Result<(), ValidationError> {
    if description.trim().chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(ValidationError::DescriptionTooLong(MAX_DESCRIPTION_CHARS));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("No fields to update")]
    NoChanges,
    #[error("Title must not be empty")]
    EmptyTitle,
    #[error("Title is limited to {0} characters")]
    TitleTooLong(usize),
    #[error("Description is limited to {0} characters")]
    DescriptionTooLong(usize),
    #[error("End time must be after start time")]
    EndBeforeStart,
}

/// Result of a conditional write that reached the store.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Committed(Schedule),
    /// Expected version did not match; carries the stored version.
    Conflict { current_version: u64 },
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Schedule not found: {0}")]
    NotFound(Uuid),
    #[error("Invalid document: {0}")]
    Invalid(#[from] ValidationError),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// The persistence collaborator.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn read(&self, id: Uuid) -> Result<Schedule, StoreError>;

    /// Apply `changes` iff the stored version equals `expected_version`
    /// (always, when `None`). On commit the version is exactly one higher.
    async fn conditional_write(
        &self,
        id: Uuid,
        changes: &ScheduleChanges,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome, StoreError>;

    async fn create(&self, draft: NewSchedule, creator: Uuid) -> Result<Schedule, StoreError>;
}
