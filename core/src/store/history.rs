//! Store methods for the append-only draw log, per-closer counters and
//! the audit trail.

use super::{json_col, limit_param, time_col, SqliteStore};
use crate::{
    error::StoreResult,
    event::{AuditEntry, AuditReason, DrawEvent},
    types::CloserId,
};
use rusqlite::{params, types::Type, Connection, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

const EVENT_COLUMNS: &str =
    "sequence_id, draw_id, bucket_key, drawn_at, tier, actor_id,
     drawn_closer_id, snapshot_json, config_version, reset_applied";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<DrawEvent> {
    let draw_id: String = row.get(1)?;
    Ok(DrawEvent {
        sequence_id:        row.get::<_, i64>(0)? as u64,
        draw_id:            Uuid::parse_str(&draw_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
        })?,
        bucket_key:         row.get(2)?,
        timestamp:          time_col(row, 3)?,
        tier:               row.get(4)?,
        actor_id:           row.get(5)?,
        drawn_closer_id:    row.get(6)?,
        post_draw_snapshot: json_col(row, 7)?,
        config_version:     row.get::<_, i64>(8)? as u64,
        reset_applied:      row.get::<_, i64>(9)? != 0,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let reason: String = row.get(2)?;
    Ok(AuditEntry {
        bucket_key:     row.get(0)?,
        recorded_at:    time_col(row, 1)?,
        reason:         AuditReason::parse(&reason).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                Type::Text,
                format!("unknown audit reason '{reason}'").into(),
            )
        })?,
        config_version: row.get::<_, i64>(3)? as u64,
        snapshot:       json_col(row, 4)?,
    })
}

impl SqliteStore {
    // ── Draw events ────────────────────────────────────────────

    pub fn recent_events(&self, bucket_key: &str, limit: usize) -> StoreResult<Vec<DrawEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM draw_event
             WHERE bucket_key = ?1
             ORDER BY sequence_id DESC LIMIT ?2"
        ))?;
        let events = stmt
            .query_map(params![bucket_key, limit_param(limit)], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn event_log(&self, bucket_key: &str) -> StoreResult<Vec<DrawEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM draw_event
             WHERE bucket_key = ?1
             ORDER BY sequence_id ASC"
        ))?;
        let events = stmt
            .query_map(params![bucket_key], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    #[doc(hidden)]
    pub fn event_count(&self, bucket_key: &str) -> StoreResult<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM draw_event WHERE bucket_key = ?1",
            params![bucket_key],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ── Statistics ─────────────────────────────────────────────

    pub fn draw_counts(&self, bucket_key: &str) -> StoreResult<BTreeMap<CloserId, u64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT closer_id, total_draws FROM closer_stats WHERE bucket_key = ?1",
        )?;
        let counts = stmt
            .query_map(params![bucket_key], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(counts)
    }

    // ── Audit ──────────────────────────────────────────────────

    pub fn audit_log(&self, bucket_key: &str, limit: usize) -> StoreResult<Vec<AuditEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT bucket_key, recorded_at, reason, config_version, snapshot_json
             FROM bucket_audit
             WHERE bucket_key = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![bucket_key, limit_param(limit)], audit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

// ── Transaction writers (called from SqliteStore::commit) ─────────

pub(super) fn insert_event(conn: &Connection, event: &DrawEvent) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO draw_event (
            bucket_key, sequence_id, draw_id, drawn_at, tier, actor_id,
            drawn_closer_id, snapshot_json, config_version, reset_applied
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            event.bucket_key,
            event.sequence_id as i64,
            event.draw_id.to_string(),
            event.timestamp.timestamp_millis(),
            event.tier,
            event.actor_id,
            event.drawn_closer_id,
            serde_json::to_string(&event.post_draw_snapshot)?,
            event.config_version as i64,
            event.reset_applied as i64,
        ],
    )?;
    Ok(())
}

pub(super) fn bump_draw_count(
    conn:       &Connection,
    bucket_key: &str,
    closer_id:  &str,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO closer_stats (bucket_key, closer_id, total_draws) VALUES (?1, ?2, 1)
         ON CONFLICT(bucket_key, closer_id) DO UPDATE SET
            total_draws = total_draws + 1",
        params![bucket_key, closer_id],
    )?;
    Ok(())
}

pub(super) fn insert_audit(conn: &Connection, entry: &AuditEntry) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO bucket_audit (bucket_key, recorded_at, reason, config_version, snapshot_json)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.bucket_key,
            entry.recorded_at.timestamp_millis(),
            entry.reason.as_str(),
            entry.config_version as i64,
            serde_json::to_string(&entry.snapshot)?,
        ],
    )?;
    Ok(())
}
