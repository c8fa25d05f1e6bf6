//! In-process schedule store.
//!
//! Used when no storage path is configured, and as the test double for the
//! update pipeline. Every operation takes the single map lock, so the
//! version compare and the mutation in `conditional_write` cannot interleave
//! with another writer.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{NewSchedule, Schedule, ScheduleChanges, ScheduleStore, StoreError, WriteOutcome};

#[derive(Default)]
pub struct MemoryStore {
    schedules: Mutex<HashMap<Uuid, Schedule>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a prepared document as-is (fixtures, imports).
    pub fn insert(&self, schedule: Schedule) {
        self.schedules.lock().insert(schedule.id, schedule);
    }

    pub fn len(&self) -> usize {
        self.schedules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.lock().is_empty()
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn read(&self, id: Uuid) -> Result<Schedule, StoreError> {
        self.schedules
            .lock()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn conditional_write(
        &self,
        id: Uuid,
        changes: &ScheduleChanges,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome, StoreError> {
        let mut schedules = self.schedules.lock();
        let schedule = schedules.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if let Some(expected) = expected_version {
            if expected != schedule.version {
                return Ok(WriteOutcome::Conflict {
                    current_version: schedule.version,
                });
            }
        }

        schedule.apply(changes)?;
        Ok(WriteOutcome::Committed(schedule.clone()))
    }

    async fn create(&self, draft: NewSchedule, creator: Uuid) -> Result<Schedule, StoreError> {
        let schedule = Schedule::create(draft, creator)?;
        self.schedules.lock().insert(schedule.id, schedule.clone());
        Ok(schedule)
    }
}
