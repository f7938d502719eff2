use crate::{
    error::{CoreResult, DrawError},
    types::{Composition, Tier, Weight},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Floor applied when a config file omits `min_weight_floor`.
/// Strictly positive: decay alone never excludes a closer.
pub const DEFAULT_MIN_WEIGHT_FLOOR: Weight = 0.1;

/// Decayed weights are kept at this many decimals.
pub const WEIGHT_DECIMALS: i32 = 1;

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_MAX_HISTORY_LIMIT: usize = 500;

/// Admin-supplied weighting for one bucket.
///
/// Weights are relative, not probabilities: `{Alex: 9, David: 9, Jose: 2}`
/// sums to 20 and is valid as-is. A weight of 0 excludes a closer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityConfig {
    pub closers: Composition,
    /// Draws after which the bucket is rebuilt from these base weights.
    pub max_draws_before_reset: u32,
    /// Weight removed from a closer each time they are drawn.
    pub degression_step: Weight,
    #[serde(default = "default_floor")]
    pub min_weight_floor: Weight,
    /// Cooldown per tier, in seconds.
    #[serde(default)]
    pub cooldown_by_tier: BTreeMap<Tier, u64>,
    /// Cooldown for tiers not listed in `cooldown_by_tier`.
    #[serde(default)]
    pub default_cooldown_secs: u64,
}

fn default_floor() -> Weight {
    DEFAULT_MIN_WEIGHT_FLOOR
}

impl ProbabilityConfig {
    /// Load from a JSON file, e.g. `data/probability_config.json`.
    /// In tests, use ProbabilityConfig::default_test().
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: Self = serde_json::from_str(&content)?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("{path}: {e}"))?;
        Ok(config)
    }

    /// Alex/David/Jose fixture with the documented tier defaults.
    pub fn default_test() -> Self {
        Self {
            closers: [
                ("Alex".to_string(), 9.0),
                ("David".to_string(), 9.0),
                ("Jose".to_string(), 2.0),
            ]
            .into(),
            max_draws_before_reset: 20,
            degression_step: 1.0,
            min_weight_floor: DEFAULT_MIN_WEIGHT_FLOOR,
            cooldown_by_tier: [("T1".to_string(), 0), ("T2".to_string(), 60)].into(),
            default_cooldown_secs: 0,
        }
    }

    pub fn with_closers<I, S>(mut self, closers: I) -> Self
    where
        I: IntoIterator<Item = (S, Weight)>,
        S: Into<String>,
    {
        self.closers = closers.into_iter().map(|(id, w)| (id.into(), w)).collect();
        self
    }

    pub fn total_weight(&self) -> Weight {
        self.closers.values().sum()
    }

    pub fn cooldown_for(&self, tier: &str) -> chrono::Duration {
        let secs = self
            .cooldown_by_tier
            .get(tier)
            .copied()
            .unwrap_or(self.default_cooldown_secs);
        // chrono panics beyond i64::MAX milliseconds.
        let secs = secs.min((i64::MAX / 1_000) as u64) as i64;
        chrono::Duration::seconds(secs)
    }

    /// Reject configs that cannot produce an eligible bucket.
    /// Runs before any state is touched.
    pub fn validate(&self) -> CoreResult<()> {
        if self.closers.is_empty() {
            return Err(DrawError::invalid_config("no closers configured"));
        }
        for (closer, weight) in &self.closers {
            if closer.trim().is_empty() {
                return Err(DrawError::invalid_config("empty closer id"));
            }
            if !weight.is_finite() || *weight < 0.0 {
                return Err(DrawError::invalid_config(format!(
                    "weight for '{closer}' must be a finite value >= 0, got {weight}"
                )));
            }
        }
        if self.closers.values().all(|w| *w <= 0.0) {
            return Err(DrawError::invalid_config("total weight must be positive"));
        }
        if self.max_draws_before_reset == 0 {
            return Err(DrawError::invalid_config("max_draws_before_reset must be >= 1"));
        }
        if !self.degression_step.is_finite() || self.degression_step < 0.0 {
            return Err(DrawError::invalid_config(format!(
                "degression_step must be a finite value >= 0, got {}",
                self.degression_step
            )));
        }
        // Weights live on the WEIGHT_DECIMALS grid, so a non-zero step must
        // be at least one grid unit and a whole number of them.
        let scaled = self.degression_step * 10f64.powi(WEIGHT_DECIMALS);
        let off_grid = (scaled - scaled.round()).abs() > 1e-9;
        if off_grid || (self.degression_step > 0.0 && scaled.round() == 0.0) {
            return Err(DrawError::invalid_config(format!(
                "degression_step must be a multiple of {}, got {}",
                10f64.powi(-WEIGHT_DECIMALS),
                self.degression_step
            )));
        }
        if !self.min_weight_floor.is_finite() || self.min_weight_floor < 0.0 {
            return Err(DrawError::invalid_config(format!(
                "min_weight_floor must be a finite value >= 0, got {}",
                self.min_weight_floor
            )));
        }
        Ok(())
    }
}

/// Runtime knobs of a [`crate::service::DrawService`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawSettings {
    /// Bounded wait for the per-bucket lock before `DrawBusy`.
    pub lock_timeout_ms: u64,
    /// Upper bound applied to `recent_history` / `audit_log` limits.
    pub max_history_limit: usize,
    /// Seed for reproducible draws. `None` seeds from OS entropy.
    pub master_seed: Option<u64>,
}

impl Default for DrawSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            max_history_limit: DEFAULT_MAX_HISTORY_LIMIT,
            master_seed: None,
        }
    }
}

impl DrawSettings {
    pub fn seeded(seed: u64) -> Self {
        Self { master_seed: Some(seed), ..Self::default() }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
