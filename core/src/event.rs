//! Append-only records produced by the draw core.
//!
//! RULE: Nothing in the core updates or deletes a DrawEvent or an
//! AuditEntry once committed. Retention is an external concern.

use crate::types::{ActorId, BucketKey, CloserId, Composition, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One committed draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawEvent {
    /// Per-bucket, strictly increasing, gap-free.
    pub sequence_id:        u64,
    /// Globally unique id for downstream consumers.
    pub draw_id:            Uuid,
    pub bucket_key:         BucketKey,
    pub timestamp:          DateTime<Utc>,
    pub tier:               Tier,
    pub actor_id:           ActorId,
    pub drawn_closer_id:    CloserId,
    /// Composition after the draw (after the rebuild, if one happened).
    pub post_draw_snapshot: Composition,
    pub config_version:     u64,
    /// This draw hit max_draws_before_reset and rebuilt the bucket.
    pub reset_applied:      bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditReason {
    ConfigApplied,
    ManualReset,
    AutoReset,
}

impl AuditReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigApplied => "config_applied",
            Self::ManualReset   => "manual_reset",
            Self::AutoReset     => "auto_reset",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "config_applied" => Some(Self::ConfigApplied),
            "manual_reset"   => Some(Self::ManualReset),
            "auto_reset"     => Some(Self::AutoReset),
            _ => None,
        }
    }
}

/// A bucket rebuild, recorded for administrators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub bucket_key:     BucketKey,
    pub recorded_at:    DateTime<Utc>,
    pub reason:         AuditReason,
    pub config_version: u64,
    /// Composition right after the rebuild.
    pub snapshot:       Composition,
}
