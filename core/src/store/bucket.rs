//! Store methods for bucket state and versioned configs.

use super::{json_col, opt_time_col, time_col, SqliteStore};
use crate::{
    bucket::BucketState,
    config::ProbabilityConfig,
    error::StoreResult,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

impl SqliteStore {
    // ── Bucket state ───────────────────────────────────────────

    pub fn load_bucket(&self, bucket_key: &str) -> StoreResult<Option<BucketState>> {
        let state = self
            .conn()
            .query_row(
                "SELECT bucket_key, composition_json, draws_since_reset, config_version,
                        revision, last_sequence, updated_at, last_reset_at
                 FROM bucket_state WHERE bucket_key = ?1",
                params![bucket_key],
                |row| {
                    Ok(BucketState {
                        bucket_key:        row.get(0)?,
                        composition:       json_col(row, 1)?,
                        draws_since_reset: row.get::<_, i64>(2)? as u32,
                        config_version:    row.get::<_, i64>(3)? as u64,
                        revision:          row.get::<_, i64>(4)? as u64,
                        last_sequence:     row.get::<_, i64>(5)? as u64,
                        updated_at:        time_col(row, 6)?,
                        last_reset_at:     opt_time_col(row, 7)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    /// Every bucket key with persisted state.
    #[doc(hidden)]
    pub fn bucket_keys(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT bucket_key FROM bucket_state ORDER BY bucket_key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    // ── Probability config ─────────────────────────────────────

    pub fn load_config(
        &self,
        bucket_key: &str,
        version:    u64,
    ) -> StoreResult<Option<ProbabilityConfig>> {
        let config = self
            .conn()
            .query_row(
                "SELECT config_json FROM probability_config
                 WHERE bucket_key = ?1 AND config_version = ?2",
                params![bucket_key, version as i64],
                |row| json_col(row, 0),
            )
            .optional()?;
        Ok(config)
    }

    pub fn latest_config(
        &self,
        bucket_key: &str,
    ) -> StoreResult<Option<(u64, ProbabilityConfig)>> {
        let latest = self
            .conn()
            .query_row(
                "SELECT config_version, config_json FROM probability_config
                 WHERE bucket_key = ?1
                 ORDER BY config_version DESC LIMIT 1",
                params![bucket_key],
                |row| Ok((row.get::<_, i64>(0)? as u64, json_col(row, 1)?)),
            )
            .optional()?;
        Ok(latest)
    }
}

// ── Transaction writers (called from SqliteStore::commit) ─────────

pub(super) fn write_state(
    conn:     &Connection,
    state:    &BucketState,
    revision: u64,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO bucket_state (
            bucket_key, composition_json, draws_since_reset, config_version,
            revision, last_sequence, updated_at, last_reset_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(bucket_key) DO UPDATE SET
            composition_json  = excluded.composition_json,
            draws_since_reset = excluded.draws_since_reset,
            config_version    = excluded.config_version,
            revision          = excluded.revision,
            last_sequence     = excluded.last_sequence,
            updated_at        = excluded.updated_at,
            last_reset_at     = excluded.last_reset_at",
        params![
            state.bucket_key,
            serde_json::to_string(&state.composition)?,
            state.draws_since_reset as i64,
            state.config_version as i64,
            revision as i64,
            state.last_sequence as i64,
            state.updated_at.timestamp_millis(),
            state.last_reset_at.map(|t| t.timestamp_millis()),
        ],
    )?;
    Ok(())
}

pub(super) fn insert_config(
    conn:       &Connection,
    bucket_key: &str,
    version:    u64,
    config:     &ProbabilityConfig,
    applied_at: DateTime<Utc>,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO probability_config (bucket_key, config_version, config_json, applied_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            bucket_key,
            version as i64,
            serde_json::to_string(config)?,
            applied_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}
