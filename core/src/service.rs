//! The draw service. One instance per process, shared via `Arc`.
//!
//! EXECUTION ORDER of a draw (fixed, all under the bucket guard):
//!   1. Acquire the bucket lock (bounded wait → DrawBusy).
//!   2. Load state; build it lazily from the latest config if absent.
//!   3. Cooldown check for (actor, tier) → CooldownActive.
//!   4. Eligibility check → BucketExhausted.
//!   5. Sample, decay, maybe reset (draw_engine).
//!   6. Commit state + event + cooldown + counters in one transaction.
//!      Tiers without a cooldown window write no cooldown entry.
//!   7. Release the lock, return the result.
//!
//! RULES:
//!   - Nothing is cached between calls; state is re-read under the lock,
//!     so a failed commit leaves no trace and a retry starts clean.
//!   - No internal retries beyond the bounded lock wait.

use crate::{
    bucket::{self, BucketState},
    clock::{Clock, SystemClock},
    config::{DrawSettings, ProbabilityConfig},
    cooldown::{CooldownDecision, CooldownGuard},
    draw_engine,
    error::{CoreResult, DrawError, PersistenceError},
    event::{AuditEntry, AuditReason, DrawEvent},
    lock::{BucketGuard, BucketLocks},
    store::{BucketCommit, DrawBackend, SqliteStore},
    types::{ActorId, BucketKey, CloserId, Tier, DEFAULT_BUCKET},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// What a successful draw hands back to the booking flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawResult {
    pub bucket_key:        BucketKey,
    pub drawn_closer_id:   CloserId,
    pub tier:              Tier,
    pub actor_id:          ActorId,
    pub timestamp:         DateTime<Utc>,
    pub draws_until_reset: u32,
    pub sequence_id:       u64,
    pub draw_id:           Uuid,
    pub config_version:    u64,
    pub reset_applied:     bool,
}

pub struct DrawService<B: DrawBackend = SqliteStore> {
    pub(crate) backend:  B,
    pub(crate) settings: DrawSettings,
    pub(crate) clock:    Arc<dyn Clock>,
    locks:               BucketLocks,
}

impl<B: DrawBackend> DrawService<B> {
    pub fn new(backend: B, settings: DrawSettings) -> Self {
        Self::with_clock(backend, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(backend: B, settings: DrawSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            locks: BucketLocks::new(settings.master_seed),
            backend,
            settings,
            clock,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn settings(&self) -> &DrawSettings {
        &self.settings
    }

    fn lock(&self, bucket_key: &str) -> CoreResult<BucketGuard> {
        self.locks.acquire(bucket_key, self.settings.lock_timeout())
    }

    // ── Draw ───────────────────────────────────────────────────

    /// Draw one closer from the default bucket.
    pub fn draw(&self, tier: &str, actor_id: &str) -> CoreResult<DrawResult> {
        self.draw_in(DEFAULT_BUCKET, tier, actor_id)
    }

    /// Draw one closer from `bucket_key`.
    pub fn draw_in(&self, bucket_key: &str, tier: &str, actor_id: &str) -> CoreResult<DrawResult> {
        let guard = self.lock(bucket_key)?;
        let now = self.clock.now();

        let (state, config, expected_revision) = match self.load_or_bootstrap(bucket_key, now) {
            Ok(loaded) => loaded,
            Err(e @ DrawError::BucketExhausted { .. }) => {
                // No config for this key: nothing to keep a slot for.
                self.locks.discard(guard);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let existing = self.backend.load_cooldown(bucket_key, actor_id, tier)?;
        if let CooldownDecision::Reject { remaining_seconds, .. } =
            CooldownGuard::check(existing.as_ref(), now)
        {
            log::debug!(
                "bucket={bucket_key} actor={actor_id} tier={tier} cooldown rejected ({remaining_seconds}s left)"
            );
            return Err(DrawError::CooldownActive {
                actor_id: actor_id.to_string(),
                tier: tier.to_string(),
                remaining_seconds,
            });
        }

        let total = state.total_weight();
        if total <= 0.0 {
            log::warn!("bucket={bucket_key} exhausted: no closer has a positive weight");
            return Err(DrawError::BucketExhausted { bucket: bucket_key.to_string() });
        }

        let r = guard.rng().below(total);
        let step = draw_engine::sample_and_apply(&state, &config, r, now)?;

        let event = DrawEvent {
            sequence_id:        step.state.last_sequence,
            draw_id:            Uuid::new_v4(),
            bucket_key:         bucket_key.to_string(),
            timestamp:          now,
            tier:               tier.to_string(),
            actor_id:           actor_id.to_string(),
            drawn_closer_id:    step.drawn.clone(),
            post_draw_snapshot: step.state.composition.clone(),
            config_version:     step.state.config_version,
            reset_applied:      step.reset_applied,
        };

        let mut commit = BucketCommit::new(expected_revision, step.state.clone());
        if config.cooldown_for(tier) > chrono::Duration::zero() {
            commit.cooldown = Some(CooldownGuard::reserve(bucket_key, tier, actor_id, &config, now));
        }
        commit.event = Some(event.clone());
        if step.reset_applied {
            commit.audit.push(AuditEntry {
                bucket_key:     bucket_key.to_string(),
                recorded_at:    now,
                reason:         AuditReason::AutoReset,
                config_version: step.state.config_version,
                snapshot:       step.state.composition.clone(),
            });
        }
        self.backend.commit(&commit).inspect_err(|e| {
            log::warn!("bucket={bucket_key} draw discarded, commit failed: {e}");
        })?;
        drop(guard);

        log::debug!(
            "bucket={bucket_key} seq={} r={r:.3}/{total:.1} drew {} ({:.1} -> {:.1})",
            event.sequence_id, step.drawn, step.weight_before, step.weight_after,
        );
        if step.reset_applied {
            log::info!(
                "bucket={bucket_key} reached {} draws, rebuilt from config v{}",
                config.max_draws_before_reset, step.state.config_version,
            );
        }

        Ok(DrawResult {
            bucket_key:        bucket_key.to_string(),
            drawn_closer_id:   step.drawn,
            tier:              tier.to_string(),
            actor_id:          actor_id.to_string(),
            timestamp:         now,
            draws_until_reset: step.state.draws_until_reset(&config),
            sequence_id:       event.sequence_id,
            draw_id:           event.draw_id,
            config_version:    step.state.config_version,
            reset_applied:     step.reset_applied,
        })
    }

    /// Current state and the config it was built from.
    /// An absent bucket is built from the latest stored config; the
    /// returned revision is then `None` so the commit creates it.
    fn load_or_bootstrap(
        &self,
        bucket_key: &str,
        now:        DateTime<Utc>,
    ) -> CoreResult<(BucketState, ProbabilityConfig, Option<u64>)> {
        if let Some(state) = self.backend.load_bucket(bucket_key)? {
            let config = self.config_for(&state)?;
            let revision = state.revision;
            return Ok((state, config, Some(revision)));
        }
        match self.backend.latest_config(bucket_key)? {
            Some((version, config)) => {
                log::info!("bucket={bucket_key} lazily built from config v{version}");
                let state = bucket::build(bucket_key, &config, version, now)?;
                Ok((state, config, None))
            }
            None => {
                log::warn!("bucket={bucket_key} has no config; apply one before drawing");
                Err(DrawError::BucketExhausted { bucket: bucket_key.to_string() })
            }
        }
    }

    pub(crate) fn config_for(&self, state: &BucketState) -> CoreResult<ProbabilityConfig> {
        self.backend
            .load_config(&state.bucket_key, state.config_version)?
            .ok_or_else(|| {
                DrawError::Persistence(PersistenceError::Corrupt {
                    bucket: state.bucket_key.clone(),
                    detail: format!("config v{} missing", state.config_version),
                })
            })
    }

    // ── Admin ──────────────────────────────────────────────────

    /// Replace the default bucket's config. Returns the new config version.
    pub fn apply_config(&self, config: ProbabilityConfig) -> CoreResult<u64> {
        self.apply_config_in(DEFAULT_BUCKET, config)
    }

    /// Validate, version and apply `config`, rebuilding the bucket in
    /// the same commit. An invalid config leaves the prior state as is.
    pub fn apply_config_in(&self, bucket_key: &str, config: ProbabilityConfig) -> CoreResult<u64> {
        config.validate().inspect_err(|e| {
            log::warn!("bucket={bucket_key} config rejected: {e}");
        })?;

        let _guard = self.lock(bucket_key)?;
        let now = self.clock.now();

        let current = self.backend.load_bucket(bucket_key)?;
        let latest_version = self
            .backend
            .latest_config(bucket_key)?
            .map(|(v, _)| v)
            .unwrap_or(0);
        let version = latest_version.max(current.as_ref().map_or(0, |s| s.config_version)) + 1;

        let state = match &current {
            Some(prev) => prev.rebuild(&config, version, now)?,
            None => bucket::build(bucket_key, &config, version, now)?,
        };

        let mut commit = BucketCommit::new(current.as_ref().map(|s| s.revision), state);
        commit.audit.push(AuditEntry {
            bucket_key:     bucket_key.to_string(),
            recorded_at:    now,
            reason:         AuditReason::ConfigApplied,
            config_version: version,
            snapshot:       config.closers.clone(),
        });
        commit.config = Some((version, config));
        self.backend.commit(&commit)?;

        log::info!(
            "bucket={bucket_key} config v{version} applied ({} closers)",
            commit.state.composition.len()
        );
        Ok(version)
    }

    /// Rebuild the default bucket now, whatever its draw count.
    pub fn reset_bucket(&self) -> CoreResult<BucketState> {
        self.reset_bucket_in(DEFAULT_BUCKET)
    }

    /// Rebuild `bucket_key` from its current config. Recorded in the
    /// audit log with reason `manual_reset`.
    pub fn reset_bucket_in(&self, bucket_key: &str) -> CoreResult<BucketState> {
        let _guard = self.lock(bucket_key)?;
        let now = self.clock.now();

        let (state, config, expected_revision) = self.load_or_bootstrap(bucket_key, now)?;
        let rebuilt = state.rebuild(&config, state.config_version, now)?;

        let mut commit = BucketCommit::new(expected_revision, rebuilt);
        commit.audit.push(AuditEntry {
            bucket_key:     bucket_key.to_string(),
            recorded_at:    now,
            reason:         AuditReason::ManualReset,
            config_version: state.config_version,
            snapshot:       commit.state.composition.clone(),
        });
        let revision = self.backend.commit(&commit)?;

        log::info!(
            "bucket={bucket_key} manual reset (was {} draws into the cycle)",
            state.draws_since_reset
        );
        Ok(BucketState { revision, ..commit.state })
    }

    // ── Cooldowns ──────────────────────────────────────────────

    /// Read-only preview of the cooldown decision for a default-bucket draw.
    pub fn cooldown_status(&self, tier: &str, actor_id: &str) -> CoreResult<CooldownDecision> {
        self.cooldown_status_in(DEFAULT_BUCKET, tier, actor_id)
    }

    pub fn cooldown_status_in(
        &self,
        bucket_key: &str,
        tier:       &str,
        actor_id:   &str,
    ) -> CoreResult<CooldownDecision> {
        let entry = self.backend.load_cooldown(bucket_key, actor_id, tier)?;
        Ok(CooldownGuard::check(entry.as_ref(), self.clock.now()))
    }

    /// Delete expired cooldown entries of `bucket_key`.
    pub fn prune_expired_cooldowns(&self, bucket_key: &str) -> CoreResult<usize> {
        let _guard = self.lock(bucket_key)?;
        let removed = self.backend.prune_cooldowns(bucket_key, self.clock.now())?;
        if removed > 0 {
            log::debug!("bucket={bucket_key} pruned {removed} expired cooldown entries");
        }
        Ok(removed)
    }
}
