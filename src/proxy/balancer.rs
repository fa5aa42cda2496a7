//! Placement Balancers
//!
//! Policies that adjust the raw placement proposed by the backend before it
//! is committed (`remap`) and learn from committed chunks (`adapt`).
//!
//! | Variant    | Ranking state                    | Remap rule                               |
//! |------------|----------------------------------|------------------------------------------|
//! | `None`     | -                                | identity                                 |
//! | `Lru`      | last remap that chose each slot  | swap out slots chosen by the last remap  |
//! | `Priority` | learned bytes per slot           | the n least loaded slots                 |
//! | `Weighted` | bytes x (1 + frequency) per slot | swap out slots above 1.5x mean weight    |

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;

use super::chunk::Chunk;
use crate::domain::TraceRecord;
use crate::error::Error;

/// Weight above `mean * WEIGHTED_THRESHOLD` marks a slot as overloaded
pub const WEIGHTED_THRESHOLD: f64 = 1.5;

/// Balancer selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalancerKind {
    #[default]
    None,
    Lru,
    Priority,
    Weighted,
}

impl fmt::Display for BalancerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancerKind::None => write!(f, "none"),
            BalancerKind::Lru => write!(f, "lru"),
            BalancerKind::Priority => write!(f, "priority"),
            BalancerKind::Weighted => write!(f, "weighted"),
        }
    }
}

impl FromStr for BalancerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(BalancerKind::None),
            "lru" => Ok(BalancerKind::Lru),
            "priority" => Ok(BalancerKind::Priority),
            "weighted" => Ok(BalancerKind::Weighted),
            other => Err(Error::Config(format!("unknown balancer: {}", other))),
        }
    }
}

/// Placement policy held by each proxy
#[derive(Debug)]
pub enum Balancer {
    None,
    Lru(LruBalancer),
    Priority(PriorityBalancer),
    Weighted(WeightedBalancer),
}

impl Balancer {
    pub fn new(kind: BalancerKind, cluster_size: usize) -> Self {
        match kind {
            BalancerKind::None => Balancer::None,
            BalancerKind::Lru => Balancer::Lru(LruBalancer::new(cluster_size)),
            BalancerKind::Priority => Balancer::Priority(PriorityBalancer::new(cluster_size)),
            BalancerKind::Weighted => Balancer::Weighted(WeightedBalancer::new(cluster_size)),
        }
    }

    pub fn kind(&self) -> BalancerKind {
        match self {
            Balancer::None => BalancerKind::None,
            Balancer::Lru(_) => BalancerKind::Lru,
            Balancer::Priority(_) => BalancerKind::Priority,
            Balancer::Weighted(_) => BalancerKind::Weighted,
        }
    }

    /// Adjust a raw placement. The result has the same length with distinct slots.
    pub fn remap(&self, raw: &[usize], obj: &TraceRecord) -> Vec<usize> {
        match self {
            Balancer::None => raw.to_vec(),
            Balancer::Lru(b) => b.remap(raw),
            Balancer::Priority(b) => b.remap(raw),
            Balancer::Weighted(b) => b.remap(raw, obj),
        }
    }

    /// Feed back a chunk committed to `slot`.
    pub fn adapt(&self, slot: usize, chunk: &Chunk) {
        match self {
            Balancer::None => {}
            Balancer::Lru(b) => b.adapt(slot),
            Balancer::Priority(b) => b.adapt(slot, chunk),
            Balancer::Weighted(b) => b.adapt(slot, chunk),
        }
    }
}

/// Fill the `None` positions of `kept` from `replacements`, in order.
fn fill_positions(
    kept: Vec<Option<usize>>,
    replacements: impl IntoIterator<Item = usize>,
) -> Vec<usize> {
    let mut replacements = replacements.into_iter();
    kept.into_iter()
        .filter_map(|slot| slot.or_else(|| replacements.next()))
        .collect()
}

// =============================================================================
// LRU
// =============================================================================

#[derive(Debug)]
struct LruState {
    /// Remap generation that last chose each slot, 0 = never
    stamps: Vec<u64>,
    generation: u64,
}

/// Spreads consecutive objects by avoiding the slots the previous remap chose
#[derive(Debug)]
pub struct LruBalancer {
    state: Mutex<LruState>,
}

impl LruBalancer {
    pub fn new(cluster_size: usize) -> Self {
        Self {
            state: Mutex::new(LruState {
                stamps: vec![0; cluster_size],
                generation: 0,
            }),
        }
    }

    fn remap(&self, raw: &[usize]) -> Vec<usize> {
        let mut state = self.state.lock();
        let cluster = state.stamps.len();
        let previous = state.generation;

        let mut used = HashSet::with_capacity(raw.len());
        let kept: Vec<Option<usize>> = raw
            .iter()
            .map(|&slot| {
                let hot = slot < cluster && previous > 0 && state.stamps[slot] == previous;
                (slot < cluster && !hot && used.insert(slot)).then_some(slot)
            })
            .collect();

        let mut candidates: Vec<usize> = (0..cluster).filter(|s| !used.contains(s)).collect();
        candidates.sort_by_key(|&s| (state.stamps[s], s));
        let placement = fill_positions(kept, candidates);

        state.generation += 1;
        let generation = state.generation;
        for &slot in &placement {
            state.stamps[slot] = generation;
        }
        placement
    }

    fn adapt(&self, slot: usize) {
        let mut state = self.state.lock();
        let generation = state.generation;
        if let Some(stamp) = state.stamps.get_mut(slot) {
            *stamp = generation;
        }
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Places shards on the slots with the least learned load
#[derive(Debug)]
pub struct PriorityBalancer {
    loads: Mutex<Vec<u64>>,
}

impl PriorityBalancer {
    pub fn new(cluster_size: usize) -> Self {
        Self {
            loads: Mutex::new(vec![0; cluster_size]),
        }
    }

    fn remap(&self, raw: &[usize]) -> Vec<usize> {
        let loads = self.loads.lock();
        let in_raw: HashSet<usize> = raw.iter().copied().collect();

        let mut ranked: Vec<usize> = (0..loads.len()).collect();
        ranked.sort_by_key(|&s| (loads[s], !in_raw.contains(&s), s));
        let chosen: HashSet<usize> = ranked.iter().take(raw.len()).copied().collect();

        let mut used = HashSet::with_capacity(raw.len());
        let kept: Vec<Option<usize>> = raw
            .iter()
            .map(|&slot| (chosen.contains(&slot) && used.insert(slot)).then_some(slot))
            .collect();
        let rest = ranked
            .into_iter()
            .take(raw.len())
            .filter(|s| !used.contains(s));
        fill_positions(kept, rest)
    }

    fn adapt(&self, slot: usize, chunk: &Chunk) {
        if let Some(load) = self.loads.lock().get_mut(slot) {
            *load += chunk.size;
        }
    }

    /// Learned load of `slot`
    pub fn load(&self, slot: usize) -> u64 {
        self.loads.lock().get(slot).copied().unwrap_or(0)
    }
}

// =============================================================================
// Weighted
// =============================================================================

/// Keeps raw slots unless their access-weighted load is well above the mean
#[derive(Debug)]
pub struct WeightedBalancer {
    weights: Mutex<Vec<f64>>,
}

impl WeightedBalancer {
    pub fn new(cluster_size: usize) -> Self {
        Self {
            weights: Mutex::new(vec![0.0; cluster_size]),
        }
    }

    fn remap(&self, raw: &[usize], _obj: &TraceRecord) -> Vec<usize> {
        let weights = self.weights.lock();
        let cluster = weights.len();
        let mean = if cluster == 0 {
            0.0
        } else {
            weights.iter().sum::<f64>() / cluster as f64
        };
        let threshold = mean * WEIGHTED_THRESHOLD;

        let mut used = HashSet::with_capacity(raw.len());
        let kept: Vec<Option<usize>> = raw
            .iter()
            .map(|&slot| {
                let light = slot < cluster && (mean == 0.0 || weights[slot] <= threshold);
                (light && used.insert(slot)).then_some(slot)
            })
            .collect();

        let mut candidates: Vec<usize> = (0..cluster)
            .filter(|s| !used.contains(s) && !raw.contains(s))
            .collect();
        candidates.sort_by(|&a, &b| weights[a].total_cmp(&weights[b]).then(a.cmp(&b)));
        // Raw slots that were rejected remain usable as a last resort.
        let mut fallback: Vec<usize> = (0..cluster)
            .filter(|s| !used.contains(s) && raw.contains(s))
            .collect();
        fallback.sort_by(|&a, &b| weights[a].total_cmp(&weights[b]).then(a.cmp(&b)));
        fill_positions(kept, candidates.into_iter().chain(fallback))
    }

    fn adapt(&self, slot: usize, chunk: &Chunk) {
        if let Some(weight) = self.weights.lock().get_mut(slot) {
            *weight += chunk.size as f64 * (1.0 + chunk.access_frequency as f64);
        }
    }

    /// Learned weight of `slot`
    pub fn weight(&self, slot: usize) -> f64 {
        self.weights.lock().get(slot).copied().unwrap_or(0.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
