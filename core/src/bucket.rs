//! Bucket state and the bucket builder.
//!
//! A bucket is built from a ProbabilityConfig and then mutated one
//! closer at a time by draws. It is never partially rebuilt: every
//! rebuild replaces the whole composition with the config's weights.

use crate::{
    config::{ProbabilityConfig, WEIGHT_DECIMALS},
    error::CoreResult,
    types::{BucketKey, Composition, Weight},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub bucket_key:        BucketKey,
    pub composition:       Composition,
    pub draws_since_reset: u32,
    /// Version of the ProbabilityConfig this composition was built from.
    pub config_version:    u64,
    /// Optimistic-concurrency version, bumped by every committed write.
    pub revision:          u64,
    /// Sequence id of the last DrawEvent appended to this bucket.
    pub last_sequence:     u64,
    pub updated_at:        DateTime<Utc>,
    pub last_reset_at:     Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketStatus {
    /// No state persisted yet.
    Uninitialized,
    Active,
    /// Every weight is at 0; only a rebuild brings the bucket back.
    Exhausted,
}

impl BucketStatus {
    pub fn of(state: Option<&BucketState>) -> Self {
        match state {
            None => Self::Uninitialized,
            Some(s) if s.total_weight() > 0.0 => Self::Active,
            Some(_) => Self::Exhausted,
        }
    }
}

/// Build a fresh bucket from `config`.
///
/// Fails with `InvalidConfig` for an empty config or one whose
/// weights are all <= 0.
pub fn build(
    bucket_key:     &str,
    config:         &ProbabilityConfig,
    config_version: u64,
    now:            DateTime<Utc>,
) -> CoreResult<BucketState> {
    config.validate()?;
    Ok(BucketState {
        bucket_key:        bucket_key.to_string(),
        composition:       config.closers.clone(),
        draws_since_reset: 0,
        config_version,
        revision:          0,
        last_sequence:     0,
        updated_at:        now,
        last_reset_at:     Some(now),
    })
}

impl BucketState {
    /// Replace the composition with `config`'s base weights.
    /// Revision and event sequence carry over from `self`.
    pub fn rebuild(
        &self,
        config:         &ProbabilityConfig,
        config_version: u64,
        now:            DateTime<Utc>,
    ) -> CoreResult<Self> {
        let fresh = build(&self.bucket_key, config, config_version, now)?;
        Ok(Self {
            revision:      self.revision,
            last_sequence: self.last_sequence,
            ..fresh
        })
    }

    pub fn total_weight(&self) -> Weight {
        self.composition.values().filter(|w| **w > 0.0).sum()
    }

    pub fn status(&self) -> BucketStatus {
        BucketStatus::of(Some(self))
    }

    pub fn draws_until_reset(&self, config: &ProbabilityConfig) -> u32 {
        config
            .max_draws_before_reset
            .saturating_sub(self.draws_since_reset)
    }
}

/// Weight after one degressive step.
///
/// Never drops below `floor` and never rises: a weight already at or
/// under the floor is returned unchanged.
pub fn decay(weight: Weight, step: Weight, floor: Weight) -> Weight {
    if weight <= floor {
        return weight;
    }
    round_weight(weight - step).max(floor).min(weight)
}

pub fn round_weight(weight: Weight) -> Weight {
    let scale = 10f64.powi(WEIGHT_DECIMALS);
    (weight * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_respects_floor() {
        assert_eq!(decay(2.0, 1.0, 0.1), 1.0);
        assert_eq!(decay(1.0, 1.0, 0.1), 0.1);
        assert_eq!(decay(0.1, 1.0, 0.1), 0.1);
        assert_eq!(decay(0.5, 1.0, 0.0), 0.0);
    }

    #[test]
    fn decay_never_raises_a_weight() {
        // Already below the floor: left alone rather than lifted.
        assert_eq!(decay(0.05, 1.0, 0.1), 0.05);
        // Rounding must not push the result above the input.
        assert!(decay(0.16, 0.01, 0.0) <= 0.16);
    }

    #[test]
    fn decay_keeps_one_decimal() {
        assert_eq!(decay(9.0, 0.3, 0.1), 8.7);
        assert_eq!(decay(0.7, 0.3, 0.1), 0.4);
    }
}
