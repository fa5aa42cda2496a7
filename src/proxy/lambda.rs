//! Lambda Slot
//!
//! One simulated ephemeral compute/cache unit. All state sits behind a
//! per-slot mutex so records touching different slots never contend, and
//! records sharing a slot (erasure-coding neighbours) serialize on it.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use parking_lot::Mutex;

use super::chunk::{Chunk, ChunkKey};

#[derive(Debug, Default)]
struct SlotState {
    /// Resident chunks; `None` until the slot is first referenced
    chunks: Option<HashMap<ChunkKey, Chunk>>,
    mem_used: u64,
    /// Distinct minute buckets in which the slot was activated
    minutes: HashSet<i64>,
    last_activation: Option<NaiveDateTime>,
    /// Monotonic touch counter for eviction ordering
    clock: u64,
}

impl SlotState {
    fn chunks_mut(&mut self) -> &mut HashMap<ChunkKey, Chunk> {
        self.chunks.get_or_insert_with(HashMap::new)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Simulated cache instance hosting chunks
#[derive(Debug)]
pub struct LambdaSlot {
    index: usize,
    /// Memory bound in bytes, 0 for unlimited
    capacity: u64,
    state: Mutex<SlotState>,
}

impl LambdaSlot {
    pub fn new(index: usize, capacity: u64) -> Self {
        Self {
            index,
            capacity,
            state: Mutex::new(SlotState::default()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Initialize internal structures on first reference. Idempotent.
    pub fn validate(&self) {
        self.state.lock().chunks_mut();
    }

    /// Whether the slot has been referenced yet
    pub fn is_initialized(&self) -> bool {
        self.state.lock().chunks.is_some()
    }

    /// Host `chunk`, handing chunks displaced to stay within capacity to
    /// `park` while the slot is still locked, so a displaced chunk is always
    /// visible either here or wherever `park` puts it. Returns the number of
    /// displaced chunks.
    ///
    /// The added chunk itself is never displaced.
    pub fn add_chunk<F>(&self, mut chunk: Chunk, mut park: F) -> usize
    where
        F: FnMut(Chunk),
    {
        let mut state = self.state.lock();
        chunk.last_touch = state.tick();
        let key = chunk.key.clone();
        let size = chunk.size;
        if let Some(old) = state.chunks_mut().insert(key.clone(), chunk) {
            state.mem_used -= old.size;
        }
        state.mem_used += size;

        let mut displaced = 0;
        if self.capacity == 0 {
            return displaced;
        }
        while state.mem_used > self.capacity {
            let victim = state
                .chunks_mut()
                .values()
                .filter(|c| c.key != key)
                .min_by_key(|c| (c.last_touch, c.key.clone()))
                .map(|c| c.key.clone());
            let Some(victim) = victim else {
                break;
            };
            if let Some(evicted) = state.chunks_mut().remove(&victim) {
                state.mem_used -= evicted.size;
                displaced += 1;
                park(evicted);
            }
        }
        displaced
    }

    /// Remove a chunk without parking it anywhere.
    pub fn del_chunk(&self, key: &ChunkKey) -> Option<Chunk> {
        let mut state = self.state.lock();
        let removed = state.chunks.as_mut().and_then(|c| c.remove(key));
        if let Some(chunk) = &removed {
            state.mem_used -= chunk.size;
        }
        removed
    }

    /// Snapshot of a resident chunk
    pub fn get_chunk(&self, key: &ChunkKey) -> Option<Chunk> {
        self.state
            .lock()
            .chunks
            .as_ref()
            .and_then(|c| c.get(key).cloned())
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.state
            .lock()
            .chunks
            .as_ref()
            .is_some_and(|c| c.contains_key(key))
    }

    /// Apply `f` to a resident chunk and mark it recently used.
    ///
    /// Returns false if the chunk is not resident.
    pub fn update_chunk<F>(&self, key: &ChunkKey, f: F) -> bool
    where
        F: FnOnce(&mut Chunk),
    {
        let mut state = self.state.lock();
        let stamp = state.tick();
        match state.chunks.as_mut().and_then(|c| c.get_mut(key)) {
            Some(chunk) => {
                chunk.last_touch = stamp;
                f(chunk);
                true
            }
            None => false,
        }
    }

    /// Mark the minute bucket containing `at` as active.
    pub fn activate(&self, at: NaiveDateTime) {
        let bucket = minute_bucket(at);
        let mut state = self.state.lock();
        state.minutes.insert(bucket);
        if state.last_activation.map_or(true, |last| at > last) {
            state.last_activation = Some(at);
        }
    }

    pub fn mem_used(&self) -> u64 {
        self.state.lock().mem_used
    }

    pub fn num_chunks(&self) -> usize {
        self.state.lock().chunks.as_ref().map_or(0, HashMap::len)
    }

    /// Snapshot of all resident chunks
    pub fn all_chunks(&self) -> Vec<Chunk> {
        self.state
            .lock()
            .chunks
            .as_ref()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Count of distinct minutes in which the slot was active
    pub fn active_minutes(&self) -> u64 {
        self.state.lock().minutes.len() as u64
    }

    pub fn last_activation(&self) -> Option<NaiveDateTime> {
        self.state.lock().last_activation
    }

    /// Whether `mem_used` equals the sum of resident chunk sizes
    pub fn is_consistent(&self) -> bool {
        let state = self.state.lock();
        let sum: u64 = state
            .chunks
            .as_ref()
            .map_or(0, |c| c.values().map(|chunk| chunk.size).sum());
        sum == state.mem_used
    }
}

fn minute_bucket(at: NaiveDateTime) -> i64 {
    at.and_utc().timestamp().div_euclid(60)
}

// =============================================================================
// Tests
// =============================================================================
