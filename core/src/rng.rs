//! Random number generation for draws.
//!
//! Each bucket gets its own RNG stream. With a master seed the stream is
//! derived from (master_seed XOR stable hash of the bucket key), so:
//!   - Adding a bucket never changes another bucket's stream.
//!   - A seeded service replays the exact same picks.
//! Without a master seed, streams are seeded from OS entropy.

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

pub struct DrawRng {
    inner: Pcg64Mcg,
}

impl DrawRng {
    pub fn seeded(seed: u64) -> Self {
        Self { inner: Pcg64Mcg::seed_from_u64(seed) }
    }

    pub fn from_entropy() -> Self {
        Self { inner: Pcg64Mcg::from_entropy() }
    }

    /// Stream for `bucket_key`, seeded or not.
    pub fn for_bucket(master_seed: Option<u64>, bucket_key: &str) -> Self {
        match master_seed {
            Some(seed) => Self::seeded(seed ^ stable_key_hash(bucket_key)),
            None => Self::from_entropy(),
        }
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll a float in [0.0, upper). `upper` must be positive.
    pub fn below(&mut self, upper: f64) -> f64 {
        let r = self.next_f64() * upper;
        // Guard against rounding up to `upper` itself.
        if r >= upper {
            f64::from_bits(upper.to_bits() - 1)
        } else {
            r
        }
    }
}

/// FNV-1a; stable across builds and platforms, unlike `DefaultHasher`.
fn stable_key_hash(key: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    key.bytes()
        .fold(OFFSET, |hash, b| (hash ^ b as u64).wrapping_mul(PRIME))
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
}
