//! Persistence layer.
//!
//! RULE: Only the store talks to the database.
//! The service calls `DrawBackend` methods; it never executes SQL.
//!
//! Every mutation of a bucket goes through `commit`, which writes the
//! bucket state, the draw event, the cooldown reservation, statistics
//! and audit entries in one transaction, guarded by the expected
//! revision. Either all of it becomes visible or none of it does.

use crate::{
    bucket::BucketState,
    clock::millis_to_datetime,
    config::ProbabilityConfig,
    cooldown::CooldownEntry,
    error::{PersistenceError, StoreResult},
    event::{AuditEntry, DrawEvent},
    types::CloserId,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

mod bucket;
mod cooldown;
mod history;

/// Everything one bucket mutation writes.
#[derive(Debug, Clone)]
pub struct BucketCommit {
    /// Revision the state had when loaded. `None`: the bucket must not
    /// exist yet.
    pub expected_revision: Option<u64>,
    /// New state. Its `revision` field is ignored; the store assigns
    /// `expected_revision + 1` (or 1 for a new bucket).
    pub state:    BucketState,
    pub event:    Option<DrawEvent>,
    pub cooldown: Option<CooldownEntry>,
    /// Newly applied config, stored under its version.
    pub config:   Option<(u64, ProbabilityConfig)>,
    pub audit:    Vec<AuditEntry>,
}

impl BucketCommit {
    pub fn new(expected_revision: Option<u64>, state: BucketState) -> Self {
        Self {
            expected_revision,
            state,
            event: None,
            cooldown: None,
            config: None,
            audit: Vec::new(),
        }
    }
}

/// The durable store the draw service is built on.
///
/// Implementations must make `commit` atomic and must reject it with
/// `RevisionConflict` when the stored revision differs from
/// `expected_revision`.
pub trait DrawBackend: Send + Sync {
    fn load_bucket(&self, bucket_key: &str) -> StoreResult<Option<BucketState>>;

    fn load_config(&self, bucket_key: &str, version: u64) -> StoreResult<Option<ProbabilityConfig>>;

    /// Highest stored config version and its config.
    fn latest_config(&self, bucket_key: &str) -> StoreResult<Option<(u64, ProbabilityConfig)>>;

    fn load_cooldown(
        &self,
        bucket_key: &str,
        actor_id:   &str,
        tier:       &str,
    ) -> StoreResult<Option<CooldownEntry>>;

    /// Atomically apply `commit`. Returns the new revision.
    fn commit(&self, commit: &BucketCommit) -> StoreResult<u64>;

    /// Most recent events first, at most `limit`.
    fn recent_events(&self, bucket_key: &str, limit: usize) -> StoreResult<Vec<DrawEvent>>;

    /// Full event log in sequence order.
    fn event_log(&self, bucket_key: &str) -> StoreResult<Vec<DrawEvent>>;

    fn draw_counts(&self, bucket_key: &str) -> StoreResult<BTreeMap<CloserId, u64>>;

    /// Most recent audit entries first, at most `limit`.
    fn audit_log(&self, bucket_key: &str, limit: usize) -> StoreResult<Vec<AuditEntry>>;

    /// Delete cooldown entries expired at `now`. Returns how many.
    fn prune_cooldowns(&self, bucket_key: &str, now: DateTime<Utc>) -> StoreResult<usize>;
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl SqliteStore {
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        // Other processes may hold the write lock briefly.
        conn.busy_timeout(Duration::from_secs(2))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open(":memory:")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Open a migrated store in one call.
    pub fn open_migrated(path: &str) -> StoreResult<Self> {
        let store = if path == ":memory:" {
            Self::in_memory()?
        } else {
            Self::open(path)?
        };
        store.migrate()?;
        Ok(store)
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file.
    pub fn reopen(&self) -> StoreResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> StoreResult<()> {
        self.conn()
            .execute_batch(include_str!("../../../migrations/001_draw_foundation.sql"))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-transaction leaves nothing behind: the transaction
        // rolled back when it was dropped.
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn commit(&self, commit: &BucketCommit) -> StoreResult<u64> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let bucket_key = &commit.state.bucket_key;

        let stored: Option<u64> = tx
            .query_row(
                "SELECT revision FROM bucket_state WHERE bucket_key = ?1",
                params![bucket_key],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(|r| r as u64);
        if stored != commit.expected_revision {
            return Err(PersistenceError::RevisionConflict {
                bucket:   bucket_key.clone(),
                expected: commit.expected_revision,
            });
        }
        let revision = commit.expected_revision.map_or(1, |r| r + 1);

        if let Some((version, config)) = &commit.config {
            bucket::insert_config(&tx, bucket_key, *version, config, commit.state.updated_at)?;
        }
        bucket::write_state(&tx, &commit.state, revision)?;
        if let Some(event) = &commit.event {
            history::insert_event(&tx, event)?;
            history::bump_draw_count(&tx, bucket_key, &event.drawn_closer_id)?;
        }
        if let Some(entry) = &commit.cooldown {
            cooldown::upsert_cooldown(&tx, entry)?;
        }
        for entry in &commit.audit {
            history::insert_audit(&tx, entry)?;
        }

        tx.commit()?;
        Ok(revision)
    }
}

impl DrawBackend for SqliteStore {
    fn load_bucket(&self, bucket_key: &str) -> StoreResult<Option<BucketState>> {
        SqliteStore::load_bucket(self, bucket_key)
    }

    fn load_config(&self, bucket_key: &str, version: u64) -> StoreResult<Option<ProbabilityConfig>> {
        SqliteStore::load_config(self, bucket_key, version)
    }

    fn latest_config(&self, bucket_key: &str) -> StoreResult<Option<(u64, ProbabilityConfig)>> {
        SqliteStore::latest_config(self, bucket_key)
    }

    fn load_cooldown(
        &self,
        bucket_key: &str,
        actor_id:   &str,
        tier:       &str,
    ) -> StoreResult<Option<CooldownEntry>> {
        SqliteStore::load_cooldown(self, bucket_key, actor_id, tier)
    }

    fn commit(&self, commit: &BucketCommit) -> StoreResult<u64> {
        SqliteStore::commit(self, commit)
    }

    fn recent_events(&self, bucket_key: &str, limit: usize) -> StoreResult<Vec<DrawEvent>> {
        SqliteStore::recent_events(self, bucket_key, limit)
    }

    fn event_log(&self, bucket_key: &str) -> StoreResult<Vec<DrawEvent>> {
        SqliteStore::event_log(self, bucket_key)
    }

    fn draw_counts(&self, bucket_key: &str) -> StoreResult<BTreeMap<CloserId, u64>> {
        SqliteStore::draw_counts(self, bucket_key)
    }

    fn audit_log(&self, bucket_key: &str, limit: usize) -> StoreResult<Vec<AuditEntry>> {
        SqliteStore::audit_log(self, bucket_key, limit)
    }

    fn prune_cooldowns(&self, bucket_key: &str, now: DateTime<Utc>) -> StoreResult<usize> {
        SqliteStore::prune_cooldowns(self, bucket_key, now)
    }
}

// ── Row helpers ───────────────────────────────────────────────────

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(millis_to_datetime(row.get::<_, i64>(idx)?))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(millis_to_datetime))
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
