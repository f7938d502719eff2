//! Cooldown guard: minimum spacing between draws of one actor in one tier.
//!
//! Scope is (bucket, actor_id, tier). The check and the reservation are
//! made by the service while it holds the bucket lock, so two concurrent
//! requests from the same actor cannot both pass.

use crate::{
    config::ProbabilityConfig,
    types::{ActorId, BucketKey, Tier},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub bucket_key:   BucketKey,
    pub actor_id:     ActorId,
    pub tier:         Tier,
    pub last_draw_at: DateTime<Utc>,
    pub expires_at:   DateTime<Utc>,
}

impl CooldownEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum CooldownDecision {
    Allow,
    Reject {
        remaining_seconds: u64,
        expires_at:        DateTime<Utc>,
    },
}

pub struct CooldownGuard;

impl CooldownGuard {
    /// Absent or expired entries allow; live ones reject with the
    /// remaining window rounded up to whole seconds.
    pub fn check(entry: Option<&CooldownEntry>, now: DateTime<Utc>) -> CooldownDecision {
        match entry {
            Some(e) if !e.is_expired(now) => {
                let remaining_ms = (e.expires_at - now).num_milliseconds().max(0) as u64;
                CooldownDecision::Reject {
                    remaining_seconds: remaining_ms.div_ceil(1_000),
                    expires_at:        e.expires_at,
                }
            }
            _ => CooldownDecision::Allow,
        }
    }

    /// Entry recording a draw at `now`.
    pub fn reserve(
        bucket_key: &str,
        tier:       &str,
        actor_id:   &str,
        config:     &ProbabilityConfig,
        now:        DateTime<Utc>,
    ) -> CooldownEntry {
        let expires_at = now
            .checked_add_signed(config.cooldown_for(tier))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        CooldownEntry {
            bucket_key:   bucket_key.to_string(),
            actor_id:     actor_id.to_string(),
            tier:         tier.to_string(),
            last_draw_at: now,
            expires_at,
        }
    }
}
