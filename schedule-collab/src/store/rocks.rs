//! RocksDB-backed schedule and user store.
//!
//! Column families:
//! - `schedules`: bincode-encoded `Schedule`, keyed by the 16 id bytes
//! - `users`:     bincode-encoded `UserRecord`, keyed by the 16 id bytes
//!
//! Conditional writes hold `write_lock` across read → compare → batch write,
//! which makes them a compare-and-set against this process's view of the
//! database. The store is process-local like the presence registry.
//!
//! RocksDB calls block (and fsync when `sync_writes` is on), so the async
//! trait methods hand them to tokio's blocking pool. The synchronous methods
//! are for setup code and tests that are not on a runtime worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::{NewSchedule, Schedule, ScheduleChanges, ScheduleStore, StoreError, WriteOutcome};
use crate::identity::{UserDirectory, UserRecord};

const CF_SCHEDULES: &str = "schedules";
const CF_USERS: &str = "users";

const COLUMN_FAMILIES: &[&str] = &[CF_SCHEDULES, CF_USERS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true, a committed version must survive a crash)
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("schedule_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Cheap to clone; clones share one database handle.
#[derive(Clone)]
pub struct RocksStore {
    inner: Arc<RocksInner>,
}

struct RocksInner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes every read-modify-write.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened schedule store at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(RocksInner {
                db,
                config,
                write_lock: Mutex::new(()),
            }),
        })
    }

    /// Both column families hold small point-looked-up values.
    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Insert or replace a user record.
    pub fn put_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        self.inner.put_user(user)
    }

    pub fn load_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, StoreError> {
        self.inner.load_user(user_id)
    }

    pub fn load_schedule(&self, id: Uuid) -> Result<Schedule, StoreError> {
        self.inner.load_schedule(id)
    }

    /// All stored schedule ids.
    pub fn list_schedules(&self) -> Result<Vec<Uuid>, StoreError> {
        self.inner.list_schedules()
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.inner.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// Run `op` against the database on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&RocksInner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StoreError::Database(format!("Store task failed: {e}")))?
    }
}

impl RocksInner {
    // ─── Users ────────────────────────────────────────────────────────

    fn put_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_USERS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, user.user_id.as_bytes(), encode(user)?);
        self.write(batch)
    }

    fn load_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, StoreError> {
        let cf = self.cf(CF_USERS)?;
        match self.db.get_cf(&cf, user_id.as_bytes())? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    // ─── Schedules ────────────────────────────────────────────────────

    fn load_schedule(&self, id: Uuid) -> Result<Schedule, StoreError> {
        let cf = self.cf(CF_SCHEDULES)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(id)),
        }
    }

    fn list_schedules(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_SCHEDULES)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("Invalid UUID key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }

    fn save_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let cf = self.cf(CF_SCHEDULES)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, schedule.id.as_bytes(), encode(schedule)?);
        self.write(batch)
    }

    /// Compare-and-set under `write_lock`.
    fn compare_and_apply(
        &self,
        id: Uuid,
        changes: &ScheduleChanges,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome, StoreError> {
        let _guard = self.write_lock.lock();

        let mut schedule = self.load_schedule(id)?;
        if let Some(expected) = expected_version {
            if expected != schedule.version {
                return Ok(WriteOutcome::Conflict {
                    current_version: schedule.version,
                });
            }
        }

        schedule.apply(changes)?;
        self.save_schedule(&schedule)?;
        Ok(WriteOutcome::Committed(schedule))
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

#[async_trait]
impl ScheduleStore for RocksStore {
    async fn read(&self, id: Uuid) -> Result<Schedule, StoreError> {
        self.blocking(move |db| db.load_schedule(id)).await
    }

    async fn conditional_write(
        &self,
        id: Uuid,
        changes: &ScheduleChanges,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome, StoreError> {
        let changes = changes.clone();
        self.blocking(move |db| db.compare_and_apply(id, &changes, expected_version))
            .await
    }

    async fn create(&self, draft: NewSchedule, creator: Uuid) -> Result<Schedule, StoreError> {
        let schedule = Schedule::create(draft, creator)?;
        self.blocking(move |db| {
            let _guard = db.write_lock.lock();
            db.save_schedule(&schedule)?;
            Ok(schedule)
        })
        .await
    }
}

#[async_trait]
impl UserDirectory for RocksStore {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, StoreError> {
        self.blocking(move |db| db.load_user(user_id)).await
    }
}
