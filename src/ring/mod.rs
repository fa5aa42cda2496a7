//! Consistent Hashing with Bounded Loads
//!
//! Routes object keys to proxies. The hash space is cut into a fixed number
//! of partitions; each partition is owned by the first member clockwise on a
//! ring of virtual nodes whose current load is still below
//! `ceil(partitions / members * load)`. Membership is fixed at construction,
//! so the ring is immutable and lock-free afterwards.

use std::collections::HashMap;

use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};

/// Ring configuration
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Number of fixed partitions of the key space
    pub partition_count: u64,
    /// Virtual nodes per member
    pub replication_factor: usize,
    /// Bounded-load factor (>= 1.0)
    pub load: f64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            partition_count: 271,
            replication_factor: 20,
            load: 1.25,
        }
    }
}

/// Immutable bounded-load consistent hash ring over member ids
#[derive(Debug, Clone)]
pub struct ConsistentRing {
    config: RingConfig,
    members: Vec<usize>,
    /// Owner member of each partition
    partitions: Vec<usize>,
    /// Partitions owned per member
    loads: HashMap<usize, u64>,
}

impl ConsistentRing {
    /// Build a ring over `members`.
    ///
    /// Fails if the configuration cannot place every partition within the
    /// load bound.
    pub fn new(members: impl IntoIterator<Item = usize>, config: RingConfig) -> Result<Self> {
        let members: Vec<usize> = members.into_iter().collect();
        if members.is_empty() {
            return Err(Error::Config("consistent ring needs at least one member".into()));
        }
        if config.partition_count == 0 || config.replication_factor == 0 {
            return Err(Error::Config(
                "partition count and replication factor must be positive".into(),
            ));
        }
        if config.load < 1.0 {
            return Err(Error::Config(format!(
                "ring load factor must be >= 1.0, got {}",
                config.load
            )));
        }

        let mut vnodes: Vec<(u64, usize)> = members
            .iter()
            .flat_map(|&member| {
                (0..config.replication_factor)
                    .map(move |i| (xxh3_64(format!("{}{}", member, i).as_bytes()), member))
            })
            .collect();
        vnodes.sort_unstable();

        let average = average_load(config.partition_count, members.len(), config.load);
        let mut loads: HashMap<usize, u64> = members.iter().map(|&m| (m, 0)).collect();
        let mut partitions = Vec::with_capacity(config.partition_count as usize);

        for part_id in 0..config.partition_count {
            let hash = xxh3_64(&part_id.to_le_bytes());
            let mut idx = vnodes.partition_point(|&(h, _)| h < hash);
            if idx >= vnodes.len() {
                idx = 0;
            }

            let mut owner = None;
            for _ in 0..vnodes.len() {
                let member = vnodes[idx].1;
                let load = loads.entry(member).or_insert(0);
                if *load < average {
                    *load += 1;
                    owner = Some(member);
                    break;
                }
                idx = (idx + 1) % vnodes.len();
            }
            let Some(owner) = owner else {
                return Err(Error::RingCapacity {
                    partition: part_id,
                    members: members.len(),
                });
            };
            partitions.push(owner);
        }

        debug!(
            "Consistent ring built: {} members, {} partitions, average load {}",
            members.len(),
            config.partition_count,
            average
        );

        Ok(Self {
            config,
            members,
            partitions,
            loads,
        })
    }

    /// Member owning `key`. Deterministic for a given membership.
    pub fn locate(&self, key: &[u8]) -> usize {
        let part_id = xxh3_64(key) % self.config.partition_count;
        self.partitions[part_id as usize]
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    /// Partitions owned by each member
    pub fn load_distribution(&self) -> &HashMap<usize, u64> {
        &self.loads
    }

    /// Maximum partitions a single member may own
    pub fn average_load(&self) -> u64 {
        average_load(
            self.config.partition_count,
            self.members.len(),
            self.config.load,
        )
    }
}

fn average_load(partitions: u64, members: usize, load: f64) -> u64 {
    ((partitions as f64 / members as f64) * load).ceil() as u64
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_member_owns_everything() {
        let ring = ConsistentRing::new([0], RingConfig::default()).unwrap();
        assert_eq!(ring.locate(b"anything"), 0);
        assert_eq!(ring.load_distribution()[&0], 271);
    }

    #[test]
    fn test_locate_is_stable() {
        let ring = ConsistentRing::new(0..5, RingConfig::default()).unwrap();
        let rebuilt = ConsistentRing::new(0..5, RingConfig::default()).unwrap();
        for i in 0..200 {
            let key = format!("object-{}", i);
            assert_eq!(ring.locate(key.as_bytes()), ring.locate(key.as_bytes()));
            assert_eq!(ring.locate(key.as_bytes()), rebuilt.locate(key.as_bytes()));
        }
    }

    #[test]
    fn test_load_bound_respected() {
        let ring = ConsistentRing::new(0..7, RingConfig::default()).unwrap();
        let bound = ring.average_load();
        let total: u64 = ring.load_distribution().values().sum();
        assert_eq!(total, 271);
        for load in ring.load_distribution().values() {
            assert!(*load <= bound, "load {} exceeds bound {}", load, bound);
        }
    }

    #[test]
    fn test_tight_bound_still_places_every_partition() {
        let single = RingConfig {
            partition_count: 10,
            replication_factor: 1,
            load: 1.0,
        };
        let ring = ConsistentRing::new([0], single).unwrap();
        assert_eq!(ring.load_distribution()[&0], 10);

        let pair = RingConfig {
            partition_count: 4,
            replication_factor: 1,
            load: 1.0,
        };
        let ring = ConsistentRing::new([0, 1], pair).unwrap();
        assert_eq!(ring.load_distribution()[&0], 2);
        assert_eq!(ring.load_distribution()[&1], 2);
    }

    #[test]
    fn test_load_below_one_rejected() {
        let config = RingConfig {
            load: 0.5,
            ..RingConfig::default()
        };
        let err = ConsistentRing::new(0..3, config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_empty_membership_rejected() {
        let err = ConsistentRing::new(Vec::<usize>::new(), RingConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    proptest! {
        #[test]
        fn prop_locate_returns_member(members in 1usize..12, key in ".{0,32}") {
            let ring = ConsistentRing::new(0..members, RingConfig::default()).unwrap();
            let owner = ring.locate(key.as_bytes());
            prop_assert!(owner < members);
        }
    }
}
