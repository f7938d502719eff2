//! The draw algorithm: weighted pick, degressive decay, periodic reset.
//!
//! Everything here is pure: given a state, a config and a sample `r`,
//! it returns the next state. Locking, cooldowns and persistence live
//! in the service.
//!
//! STEPS (fixed order):
//!   1. Cumulative ranges are rebuilt from the current composition,
//!      closers in ascending id order, zero weights skipped.
//!   2. The closer whose range [acc, acc + w) contains `r` is drawn.
//!   3. The drawn closer's weight decays by one step, floored.
//!   4. draws_since_reset advances; at max_draws_before_reset the
//!      composition is rebuilt from the config and the counter is 0.

use crate::{
    bucket::{decay, BucketState},
    config::ProbabilityConfig,
    error::{CoreResult, DrawError},
    types::{CloserId, Composition, Weight},
};
use chrono::{DateTime, Utc};

/// Outcome of one draw, before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawStep {
    pub drawn:         CloserId,
    pub weight_before: Weight,
    pub weight_after:  Weight,
    pub reset_applied: bool,
    pub state:         BucketState,
}

/// Select the closer whose cumulative range contains `r`.
///
/// `r` is expected in `[0, total)`. A value at or past the total (float
/// round-off) falls to the last eligible closer. `None` only when no
/// closer has a positive weight.
pub fn pick(composition: &Composition, r: f64) -> Option<&CloserId> {
    let mut acc = 0.0;
    let mut last = None;
    for (closer, weight) in composition.iter().filter(|(_, w)| **w > 0.0) {
        acc += weight;
        if r < acc {
            return Some(closer);
        }
        last = Some(closer);
    }
    last
}

/// Apply a draw of `drawn` to `state`.
pub fn apply_draw(
    state:  &BucketState,
    config: &ProbabilityConfig,
    drawn:  &str,
    now:    DateTime<Utc>,
) -> CoreResult<DrawStep> {
    let mut next = state.clone();
    let weight_before = next
        .composition
        .get(drawn)
        .copied()
        .ok_or_else(|| DrawError::BucketExhausted { bucket: state.bucket_key.clone() })?;
    let weight_after = decay(weight_before, config.degression_step, config.min_weight_floor);
    next.composition.insert(drawn.to_string(), weight_after);

    next.draws_since_reset += 1;
    next.last_sequence += 1;
    next.updated_at = now;

    let reset_applied = next.draws_since_reset >= config.max_draws_before_reset;
    if reset_applied {
        next = next.rebuild(config, state.config_version, now)?;
    }

    Ok(DrawStep {
        drawn: drawn.to_string(),
        weight_before,
        weight_after,
        reset_applied,
        state: next,
    })
}

/// Pick with sample `r` and apply the draw.
/// Fails with `BucketExhausted` when no closer is eligible.
pub fn sample_and_apply(
    state:  &BucketState,
    config: &ProbabilityConfig,
    r:      f64,
    now:    DateTime<Utc>,
) -> CoreResult<DrawStep> {
    let drawn = pick(&state.composition, r)
        .cloned()
        .ok_or_else(|| DrawError::BucketExhausted { bucket: state.bucket_key.clone() })?;
    apply_draw(state, config, &drawn, now)
}

/// Replay a sequence of drawn closers from `initial`, in order.
pub fn replay<'a, I>(
    initial: &BucketState,
    config:  &ProbabilityConfig,
    drawn:   I,
    now:     DateTime<Utc>,
) -> CoreResult<BucketState>
where
    I: IntoIterator<Item = &'a str>,
{
    drawn
        .into_iter()
        .try_fold(initial.clone(), |state, closer| {
            apply_draw(&state, config, closer, now).map(|step| step.state)
        })
}
