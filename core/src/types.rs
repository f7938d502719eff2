//! Shared primitive types used across the draw core.

use std::collections::BTreeMap;

/// Stable identifier of a closer (the staff member being drawn).
pub type CloserId = String;

/// Opaque identifier of the calling actor. Never authenticated here.
pub type ActorId = String;

/// Booking category with its own cooldown policy, e.g. "T1".
pub type Tier = String;

/// Key of one logical bucket. Each bucket owns its own lock.
pub type BucketKey = String;

/// Relative weight. Not a probability: sums need not equal 1.
pub type Weight = f64;

/// Closer weights, ordered by closer id so iteration is deterministic.
pub type Composition = BTreeMap<CloserId, Weight>;

/// Bucket used by [`crate::service::DrawService::draw`].
pub const DEFAULT_BUCKET: &str = "default";
