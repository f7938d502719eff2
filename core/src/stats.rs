//! Read-only views over the persisted draw state.
//!
//! Reads do not take the bucket lock: each view comes from committed
//! data, which is never partially written.

use crate::{
    bucket::{BucketState, BucketStatus},
    error::CoreResult,
    event::{AuditEntry, DrawEvent},
    service::DrawService,
    store::DrawBackend,
    types::{BucketKey, CloserId, Composition, Weight, DEFAULT_BUCKET},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionView {
    pub bucket_key:        BucketKey,
    pub status:            BucketStatus,
    pub composition:       Composition,
    pub total_weight:      Weight,
    pub draws_since_reset: u32,
    /// `None` while the bucket is uninitialized.
    pub draws_until_reset: Option<u32>,
    pub config_version:    Option<u64>,
    pub updated_at:        Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub bucket_key:             BucketKey,
    /// Every closer of the current config appears, even at 0.
    pub total_draws_per_closer: BTreeMap<CloserId, u64>,
    pub total_draws:            u64,
    pub last_reset_at:          Option<DateTime<Utc>>,
}

impl Statistics {
    /// Share of all draws won by `closer_id`, in [0, 1].
    pub fn share_of(&self, closer_id: &str) -> f64 {
        if self.total_draws == 0 {
            return 0.0;
        }
        self.total_draws_per_closer.get(closer_id).copied().unwrap_or(0) as f64
            / self.total_draws as f64
    }
}

impl<B: DrawBackend> DrawService<B> {
    pub fn composition(&self) -> CoreResult<CompositionView> {
        self.composition_in(DEFAULT_BUCKET)
    }

    pub fn composition_in(&self, bucket_key: &str) -> CoreResult<CompositionView> {
        let Some(state) = self.backend.load_bucket(bucket_key)? else {
            return Ok(CompositionView {
                bucket_key:        bucket_key.to_string(),
                status:            BucketStatus::Uninitialized,
                composition:       Composition::new(),
                total_weight:      0.0,
                draws_since_reset: 0,
                draws_until_reset: None,
                config_version:    None,
                updated_at:        None,
            });
        };
        let config = self.config_for(&state)?;
        Ok(CompositionView {
            bucket_key:        state.bucket_key.clone(),
            status:            state.status(),
            total_weight:      state.total_weight(),
            draws_since_reset: state.draws_since_reset,
            draws_until_reset: Some(state.draws_until_reset(&config)),
            config_version:    Some(state.config_version),
            updated_at:        Some(state.updated_at),
            composition:       state.composition,
        })
    }

    /// Raw persisted state, if any.
    pub fn bucket_state(&self, bucket_key: &str) -> CoreResult<Option<BucketState>> {
        Ok(self.backend.load_bucket(bucket_key)?)
    }

    pub fn all_time_distribution(&self) -> CoreResult<Statistics> {
        self.all_time_distribution_in(DEFAULT_BUCKET)
    }

    /// Incremental per-closer counters; no history scan.
    pub fn all_time_distribution_in(&self, bucket_key: &str) -> CoreResult<Statistics> {
        let mut counts = self.backend.draw_counts(bucket_key)?;
        let state = self.backend.load_bucket(bucket_key)?;
        if let Some(state) = &state {
            for closer in state.composition.keys() {
                counts.entry(closer.clone()).or_insert(0);
            }
        }
        Ok(Statistics {
            bucket_key:             bucket_key.to_string(),
            total_draws:            counts.values().sum(),
            total_draws_per_closer: counts,
            last_reset_at:          state.and_then(|s| s.last_reset_at),
        })
    }

    pub fn recent_history(&self, limit: usize) -> CoreResult<Vec<DrawEvent>> {
        self.recent_history_in(DEFAULT_BUCKET, limit)
    }

    /// Most recent draws first. `limit` is clamped to
    /// `DrawSettings::max_history_limit`.
    pub fn recent_history_in(&self, bucket_key: &str, limit: usize) -> CoreResult<Vec<DrawEvent>> {
        let limit = limit.min(self.settings.max_history_limit);
        Ok(self.backend.recent_events(bucket_key, limit)?)
    }

    pub fn audit_log(&self, limit: usize) -> CoreResult<Vec<AuditEntry>> {
        self.audit_log_in(DEFAULT_BUCKET, limit)
    }

    pub fn audit_log_in(&self, bucket_key: &str, limit: usize) -> CoreResult<Vec<AuditEntry>> {
        let limit = limit.min(self.settings.max_history_limit);
        Ok(self.backend.audit_log(bucket_key, limit)?)
    }
}
