//! Per-bucket critical sections with a bounded wait.
//!
//! RULE: Every read-check-modify-persist sequence on a bucket runs while
//! holding that bucket's guard. Guards for different bucket keys never
//! block each other.
//!
//! Each slot also owns the bucket's RNG stream, so a stream is only ever
//! advanced by the guard holder and draws stay reproducible under a seed.

use crate::{
    error::{CoreResult, DrawError},
    rng::DrawRng,
    types::BucketKey,
};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct BucketSlot {
    held:     Mutex<bool>,
    released: Condvar,
    rng:      Mutex<DrawRng>,
}

pub struct BucketLocks {
    master_seed: Option<u64>,
    slots:       Mutex<HashMap<BucketKey, Arc<BucketSlot>>>,
}

impl BucketLocks {
    pub fn new(master_seed: Option<u64>) -> Self {
        Self {
            master_seed,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, bucket_key: &str) -> Arc<BucketSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots
            .entry(bucket_key.to_string())
            .or_insert_with(|| {
                Arc::new(BucketSlot {
                    held:     Mutex::new(false),
                    released: Condvar::new(),
                    rng:      Mutex::new(DrawRng::for_bucket(self.master_seed, bucket_key)),
                })
            })
            .clone()
    }

    /// Enter the critical section for `bucket_key`, waiting at most
    /// `timeout`. Fails with `DrawBusy` when the wait runs out.
    pub fn acquire(&self, bucket_key: &str, timeout: Duration) -> CoreResult<BucketGuard> {
        let slot = self.slot(bucket_key);
        let started = Instant::now();
        let deadline = started + timeout;
        {
            let mut held = slot.held.lock().unwrap_or_else(|p| p.into_inner());
            while *held {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    let waited_ms = started.elapsed().as_millis() as u64;
                    log::warn!("bucket={bucket_key} lock wait expired after {waited_ms}ms");
                    return Err(DrawError::DrawBusy {
                        bucket: bucket_key.to_string(),
                        waited_ms,
                    });
                }
                held = slot
                    .released
                    .wait_timeout(held, remaining)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|p| p.into_inner().0);
            }
            *held = true;
        }
        Ok(BucketGuard {
            slot,
            bucket_key: bucket_key.to_string(),
        })
    }

    /// Release `guard` and drop its slot from the registry when nobody
    /// else holds or waits on it. Used for keys that turned out to have
    /// no bucket, so unknown keys do not accumulate slots.
    pub fn discard(&self, guard: BucketGuard) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        // Registry entry plus this guard; waiters hold their own clone.
        let unshared = Arc::strong_count(&guard.slot) == 2;
        if unshared
            && slots
                .get(&guard.bucket_key)
                .is_some_and(|slot| Arc::ptr_eq(slot, &guard.slot))
        {
            slots.remove(&guard.bucket_key);
        }
        drop(slots);
        drop(guard);
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Proof of holding a bucket's critical section. Released on drop.
pub struct BucketGuard {
    slot:       Arc<BucketSlot>,
    bucket_key: BucketKey,
}

impl BucketGuard {
    pub fn bucket_key(&self) -> &str {
        &self.bucket_key
    }

    /// The bucket's RNG stream.
    pub fn rng(&self) -> MutexGuard<'_, DrawRng> {
        self.slot.rng.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for BucketGuard {
    fn drop(&mut self) {
        let mut held = self.slot.held.lock().unwrap_or_else(|p| p.into_inner());
        *held = false;
        drop(held);
        self.slot.released.notify_one();
    }
}
