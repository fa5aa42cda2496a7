//! Striped Per-Key Locks
//!
//! Serializes records for the same object key so a GET-miss reconciliation
//! never interleaves with a SET of the same key. Keys hash onto a fixed,
//! power-of-two number of stripes; unrelated keys sharing a stripe merely
//! wait on each other.

use tokio::sync::{Mutex, MutexGuard};
use xxhash_rust::xxh3::xxh3_64;

/// Default number of stripes
pub const DEFAULT_STRIPES: usize = 256;

/// Fixed array of async mutexes indexed by key hash
#[derive(Debug)]
pub struct KeyLocks {
    stripes: Box<[Mutex<()>]>,
    mask: usize,
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

impl KeyLocks {
    /// Create `stripes` locks, rounded up to a power of two.
    pub fn new(stripes: usize) -> Self {
        let count = stripes.max(1).next_power_of_two();
        Self {
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
            mask: count - 1,
        }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Stripe index for `key`
    pub fn stripe_of(&self, key: &str) -> usize {
        (xxh3_64(key.as_bytes()) as usize) & self.mask
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_of(key)].lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_stripe_count_rounds_up() {
        assert_eq!(KeyLocks::new(0).stripe_count(), 1);
        assert_eq!(KeyLocks::new(100).stripe_count(), 128);
        assert_eq!(KeyLocks::default().stripe_count(), DEFAULT_STRIPES);
    }

    #[test]
    fn test_same_key_same_stripe() {
        let locks = KeyLocks::default();
        assert_eq!(locks.stripe_of("object"), locks.stripe_of("object"));
        assert!(locks.stripe_of("object") < locks.stripe_count());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyLocks::new(4));
        let guard = locks.lock("A").await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("A").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
