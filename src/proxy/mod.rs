//! Proxy Placement Engine
//!
//! A proxy owns a fixed pool of lambda slots, the key → placement table for
//! objects routed to it, and a side table of chunks displaced from their
//! slots. All state is safe to mutate from many concurrently dispatched
//! records:
//!
//! ```text
//!                  ┌──────────────────────── Proxy ────────────────────────┐
//!  key ──lock────▶ │ KeyLocks (striped)                                    │
//!                  │ placements: DashMap<key, [slot; d+p]>                 │
//!                  │ evicted:    DashMap<ChunkKey, Chunk>                  │
//!                  │ balancer:   remap / adapt (timed → balancer_cost)     │
//!                  │ slots:      [LambdaSlot; cluster]  (per-slot mutex)   │
//!                  └───────────────────────────────────────────────────────┘
//! ```
//!
//! Records for one key serialize on the key lock; records for different keys
//! sharing a slot serialize only on that slot's mutex.

mod balancer;
mod chunk;
mod lambda;
mod locks;

pub use balancer::{Balancer, BalancerKind, WEIGHTED_THRESHOLD};
pub use chunk::{Chunk, ChunkKey};
pub use lambda::LambdaSlot;
pub use locks::KeyLocks;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use dashmap::DashMap;
use tokio::sync::MutexGuard;
use tracing::{debug, trace};

use crate::domain::TraceRecord;
use crate::error::{Error, Result};

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Lambda slots owned by the proxy
    pub cluster_size: usize,
    /// Data shards per object
    pub data_shards: usize,
    /// Parity shards per object
    pub parity_shards: usize,
    /// Memory bound per slot in bytes, 0 for unlimited
    pub slot_capacity: u64,
    /// Placement policy
    pub balancer: BalancerKind,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            cluster_size: 300,
            data_shards: 4,
            parity_shards: 2,
            slot_capacity: 0,
            balancer: BalancerKind::None,
        }
    }
}

impl ProxyConfig {
    /// Shards per object (data + parity)
    pub fn shard_count(&self) -> usize {
        self.data_shards + self.parity_shards
    }
}

/// Simulated proxy and its lambda slot pool
#[derive(Debug)]
pub struct Proxy {
    id: usize,
    config: ProxyConfig,
    slots: Vec<LambdaSlot>,
    placements: DashMap<String, Vec<usize>>,
    evicted: DashMap<ChunkKey, Chunk>,
    balancer: Balancer,
    /// Nanoseconds spent in remap/adapt
    balancer_cost_ns: AtomicU64,
    /// Number of committed placement writes
    placement_writes: AtomicU64,
    key_locks: KeyLocks,
}

impl Proxy {
    pub fn new(id: usize, config: ProxyConfig) -> Result<Self> {
        if config.data_shards == 0 {
            return Err(Error::Config("data shard count must be positive".into()));
        }
        if config.cluster_size < config.shard_count() {
            return Err(Error::Config(format!(
                "cluster of {} slots cannot host {} distinct shards",
                config.cluster_size,
                config.shard_count()
            )));
        }

        let slots = (0..config.cluster_size)
            .map(|i| LambdaSlot::new(i, config.slot_capacity))
            .collect();
        let balancer = Balancer::new(config.balancer, config.cluster_size);
        debug!(
            "Proxy {} created: {} slots, balancer {}",
            id, config.cluster_size, config.balancer
        );

        Ok(Self {
            id,
            config,
            slots,
            placements: DashMap::new(),
            evicted: DashMap::new(),
            balancer,
            balancer_cost_ns: AtomicU64::new(0),
            placement_writes: AtomicU64::new(0),
            key_locks: KeyLocks::default(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn shard_count(&self) -> usize {
        self.config.shard_count()
    }

    pub fn balancer_kind(&self) -> BalancerKind {
        self.balancer.kind()
    }

    // =========================================================================
    // Placement Table
    // =========================================================================

    /// Committed placement of `key`, if any
    pub fn placements(&self, key: &str) -> Option<Vec<usize>> {
        self.placements.get(key).map(|p| p.value().clone())
    }

    /// Adjust a raw placement through the balancer.
    pub fn remap(&self, raw: &[usize], obj: &TraceRecord) -> Vec<usize> {
        let started = Instant::now();
        let placement = self.balancer.remap(raw, obj);
        self.charge(started.elapsed());
        if placement != raw {
            trace!("Remapped {}: {:?} -> {:?}", obj.key, raw, placement);
        }
        placement
    }

    /// Feed a committed chunk back into the balancer.
    pub fn adapt(&self, slot: usize, chunk: &Chunk) {
        let started = Instant::now();
        self.balancer.adapt(slot, chunk);
        self.charge(started.elapsed());
    }

    /// Commit `placement` for `key`.
    ///
    /// Rejects placements that do not hold exactly one distinct, in-range
    /// slot per shard.
    pub fn set_placements(&self, key: &str, placement: Vec<usize>) -> Result<()> {
        self.check_placement(&placement)?;
        self.placements.insert(key.to_string(), placement);
        self.placement_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Check that `placement` could be committed.
    pub fn check_placement(&self, placement: &[usize]) -> Result<()> {
        if placement.len() != self.shard_count() {
            return Err(Error::Internal(format!(
                "placement {:?} has {} slots, expected {}",
                placement,
                placement.len(),
                self.shard_count()
            )));
        }
        if let Some(&slot) = placement.iter().find(|&&s| s >= self.slots.len()) {
            return Err(Error::Internal(format!(
                "slot {} out of range for cluster of {}",
                slot,
                self.slots.len()
            )));
        }
        let distinct: HashSet<usize> = placement.iter().copied().collect();
        if distinct.len() != placement.len() {
            return Err(Error::Internal(format!(
                "placement {:?} reuses a slot",
                placement
            )));
        }
        Ok(())
    }

    /// Number of placements committed so far
    pub fn placement_writes(&self) -> u64 {
        self.placement_writes.load(Ordering::Relaxed)
    }

    pub fn num_placements(&self) -> usize {
        self.placements.len()
    }

    // =========================================================================
    // Evicted Side Table
    // =========================================================================

    /// Pop a parked chunk. Each parked chunk is revived at most once.
    pub fn get_evicted(&self, key: &ChunkKey) -> Option<Chunk> {
        self.evicted.remove(key).map(|(_, chunk)| chunk)
    }

    /// Whether a chunk is parked under `key`
    pub fn is_evicted(&self, key: &ChunkKey) -> bool {
        self.evicted.contains_key(key)
    }

    /// Park a chunk displaced from its slot.
    pub fn park(&self, chunk: Chunk) {
        trace!("Parking chunk {}", chunk.key);
        self.evicted.insert(chunk.key.clone(), chunk);
    }

    /// Snapshot of all parked chunks
    pub fn all_evicts(&self) -> Vec<Chunk> {
        self.evicted.iter().map(|e| e.value().clone()).collect()
    }

    // =========================================================================
    // Slot Operations
    // =========================================================================

    pub fn slots(&self) -> &[LambdaSlot] {
        &self.slots
    }

    /// Resolve slot `idx`, initializing it on first reference.
    pub fn validate_lambda(&self, idx: usize) -> Result<&LambdaSlot> {
        let slot = self.slot(idx)?;
        slot.validate();
        Ok(slot)
    }

    fn slot(&self, idx: usize) -> Result<&LambdaSlot> {
        self.slots.get(idx).ok_or_else(|| {
            Error::Internal(format!(
                "slot {} out of range for proxy {} ({} slots)",
                idx,
                self.id,
                self.slots.len()
            ))
        })
    }

    /// Host `chunk` in slot `idx`. Chunks displaced to respect the slot
    /// capacity are parked in the evicted table.
    pub fn add_chunk(&self, idx: usize, chunk: Chunk) -> Result<()> {
        self.validate_lambda(idx)?.add_chunk(chunk, |displaced| {
            debug!("Slot {} of proxy {} evicted {}", idx, self.id, displaced.key);
            self.park(displaced);
        });
        Ok(())
    }

    /// Remove a chunk from slot `idx` without parking it.
    pub fn del_chunk(&self, idx: usize, key: &ChunkKey) -> Result<Option<Chunk>> {
        Ok(self.slot(idx)?.del_chunk(key))
    }

    pub fn get_chunk(&self, idx: usize, key: &ChunkKey) -> Result<Option<Chunk>> {
        Ok(self.slot(idx)?.get_chunk(key))
    }

    /// Apply `f` to a chunk resident in slot `idx`. False if not resident.
    pub fn update_chunk<F>(&self, idx: usize, key: &ChunkKey, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Chunk),
    {
        Ok(self.slot(idx)?.update_chunk(key, f))
    }

    /// Mark slot `idx` active in the minute containing `at`.
    pub fn activate(&self, idx: usize, at: NaiveDateTime) -> Result<()> {
        self.slot(idx)?.activate(at);
        Ok(())
    }

    /// Whether every shard of `obj` is resident at its committed slot
    pub fn validate(&self, obj: &TraceRecord) -> bool {
        let Some(placement) = self.placements(&obj.key) else {
            return false;
        };
        placement.iter().enumerate().all(|(shard, &idx)| {
            self.slots
                .get(idx)
                .is_some_and(|slot| slot.contains(&ChunkKey::new(shard, obj.key.as_str())))
        })
    }

    // =========================================================================
    // Concurrency & Accounting
    // =========================================================================

    /// Wait for exclusive access to `key` within this proxy.
    pub async fn lock_key(&self, key: &str) -> MutexGuard<'_, ()> {
        self.key_locks.lock(key).await
    }

    /// Cumulative time spent in the balancer
    pub fn balancer_cost(&self) -> Duration {
        Duration::from_nanos(self.balancer_cost_ns.load(Ordering::Relaxed))
    }

    fn charge(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.balancer_cost_ns.fetch_add(nanos, Ordering::Relaxed);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::NaiveDate;

    fn proxy(cluster_size: usize, slot_capacity: u64) -> Proxy {
        Proxy::new(
            0,
            ProxyConfig {
                cluster_size,
                slot_capacity,
                ..ProxyConfig::default()
            },
        )
        .unwrap()
    }

    fn record(key: &str, size: u64) -> TraceRecord {
        let ts = NaiveDate::from_ymd_opt(2017, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        TraceRecord::new(key, size, 4, ts)
    }

    #[test]
    fn test_cluster_too_small_rejected() {
        let err = Proxy::new(
            0,
            ProxyConfig {
                cluster_size: 5,
                ..ProxyConfig::default()
            },
        )
        .unwrap_err();
        assert_matches!(err, Error::Config(_));
    }

    #[test]
    fn test_set_placements_enforces_shape() {
        let p = proxy(8, 0);
        assert!(p.set_placements("A", vec![0, 1, 2]).is_err());
        assert!(p.set_placements("A", vec![0, 1, 2, 3, 4, 8]).is_err());
        assert!(p.set_placements("A", vec![0, 1, 2, 3, 4, 4]).is_err());
        assert!(p.placements("A").is_none());
        assert_eq!(p.placement_writes(), 0);

        p.set_placements("A", vec![7, 1, 2, 3, 4, 5]).unwrap();
        assert_eq!(p.placements("A"), Some(vec![7, 1, 2, 3, 4, 5]));
        assert_eq!(p.placements("A"), p.placements("A"));
        assert_eq!(p.placement_writes(), 1);
    }

    #[test]
    fn test_evicted_revived_at_most_once() {
        let p = proxy(8, 0);
        let key = ChunkKey::new(2, "A");
        p.park(Chunk::new(key.clone(), 10));
        assert!(p.is_evicted(&key));
        assert_eq!(p.get_evicted(&key).map(|c| c.size), Some(10));
        assert!(p.get_evicted(&key).is_none());
    }

    #[test]
    fn test_capacity_overflow_parks_chunks() {
        let p = proxy(8, 20);
        p.add_chunk(0, Chunk::new(ChunkKey::new(0, "A"), 10)).unwrap();
        p.add_chunk(0, Chunk::new(ChunkKey::new(0, "B"), 10)).unwrap();
        p.add_chunk(0, Chunk::new(ChunkKey::new(0, "C"), 10)).unwrap();

        assert_eq!(p.slots()[0].mem_used(), 20);
        assert!(p.is_evicted(&ChunkKey::new(0, "A")));
        assert_eq!(p.all_evicts().len(), 1);
    }

    #[test]
    fn test_displaced_chunk_always_visible_to_readers() {
        use std::sync::atomic::AtomicUsize;

        const ROUNDS: usize = 2000;
        let p = proxy(6, 30);
        let added = AtomicUsize::new(0);
        let key = |i: usize| ChunkKey::new(0, format!("k{}", i));

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..ROUNDS {
                    p.add_chunk(0, Chunk::new(key(i), 10)).unwrap();
                    added.store(i + 1, Ordering::Release);
                }
            });
            for _ in 0..3 {
                s.spawn(|| loop {
                    let upto = added.load(Ordering::Acquire);
                    for i in upto.saturating_sub(5)..upto {
                        let k = key(i);
                        let found = p.get_chunk(0, &k).unwrap().is_some() || p.is_evicted(&k);
                        assert!(found, "chunk {} in neither slot nor evicted table", k);
                    }
                    if upto == ROUNDS {
                        break;
                    }
                });
            }
        });

        assert_eq!(p.slots()[0].num_chunks(), 3);
        assert_eq!(p.all_evicts().len(), ROUNDS - 3);
        assert!(p.slots()[0].is_consistent());
    }

    #[test]
    fn test_validate_requires_every_shard() {
        let p = proxy(8, 0);
        let obj = record("A", 40);
        assert!(!p.validate(&obj));

        let placement = vec![0, 1, 2, 3, 4, 5];
        for (shard, &idx) in placement.iter().enumerate() {
            p.add_chunk(idx, Chunk::new(ChunkKey::new(shard, "A"), obj.chunk_size))
                .unwrap();
        }
        p.set_placements("A", placement).unwrap();
        assert!(p.validate(&obj));

        p.del_chunk(3, &ChunkKey::new(3, "A")).unwrap();
        assert!(!p.validate(&obj));
    }

    #[test]
    fn test_out_of_range_slot_is_error() {
        let p = proxy(8, 0);
        assert!(p.validate_lambda(8).is_err());
        assert!(p.activate(99, record("A", 1).timestamp).is_err());
        assert!(p.validate_lambda(7).unwrap().is_initialized());
    }

    #[test]
    fn test_identity_remap_without_balancer() {
        let p = proxy(8, 0);
        let raw = vec![5, 3, 1, 0, 2, 7];
        assert_eq!(p.remap(&raw, &record("A", 40)), raw);
    }
}
