//! Store methods for cooldown reservations.

use super::{time_col, SqliteStore};
use crate::{cooldown::CooldownEntry, error::StoreResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

impl SqliteStore {
    pub fn load_cooldown(
        &self,
        bucket_key: &str,
        actor_id:   &str,
        tier:       &str,
    ) -> StoreResult<Option<CooldownEntry>> {
        let entry = self
            .conn()
            .query_row(
                "SELECT bucket_key, actor_id, tier, last_draw_at, expires_at
                 FROM cooldown_entry
                 WHERE bucket_key = ?1 AND actor_id = ?2 AND tier = ?3",
                params![bucket_key, actor_id, tier],
                |row| {
                    Ok(CooldownEntry {
                        bucket_key:   row.get(0)?,
                        actor_id:     row.get(1)?,
                        tier:         row.get(2)?,
                        last_draw_at: time_col(row, 3)?,
                        expires_at:   time_col(row, 4)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    pub fn prune_cooldowns(&self, bucket_key: &str, now: DateTime<Utc>) -> StoreResult<usize> {
        let removed = self.conn().execute(
            "DELETE FROM cooldown_entry WHERE bucket_key = ?1 AND expires_at <= ?2",
            params![bucket_key, now.timestamp_millis()],
        )?;
        Ok(removed)
    }

    /// Number of stored cooldown entries, expired or not (for tests).
    #[doc(hidden)]
    pub fn cooldown_count(&self, bucket_key: &str) -> StoreResult<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM cooldown_entry WHERE bucket_key = ?1",
            params![bucket_key],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

pub(super) fn upsert_cooldown(conn: &Connection, entry: &CooldownEntry) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO cooldown_entry (bucket_key, actor_id, tier, last_draw_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(bucket_key, actor_id, tier) DO UPDATE SET
            last_draw_at = excluded.last_draw_at,
            expires_at   = excluded.expires_at",
        params![
            entry.bucket_key,
            entry.actor_id,
            entry.tier,
            entry.last_draw_at.timestamp_millis(),
            entry.expires_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}
