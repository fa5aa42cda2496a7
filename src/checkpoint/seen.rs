//! Growable bit set indexed by trace-record position.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

use crate::error::Result;

/// Initial capacity in bits
pub const INITIAL_CAPACITY: usize = 10_000;

/// Past this capacity the set grows by a fixed step instead of doubling
pub const MAX_DOUBLE_SIZE: usize = 100_000;

/// Largest index a log entry may carry
pub const MAX_INDEX: i64 = 1 << 32;

const WORD_BITS: usize = 64;

/// Set of record indices seen in a checkpoint log
#[derive(Debug, Clone)]
pub struct SeenIndex {
    words: Vec<u64>,
    capacity: usize,
}

impl Default for SeenIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SeenIndex {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(bits: usize) -> Self {
        let bits = bits.max(WORD_BITS);
        Self {
            words: vec![0; bits.div_ceil(WORD_BITS)],
            capacity: bits,
        }
    }

    /// Current capacity in bits
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mark `index` as seen, growing as needed.
    pub fn insert(&mut self, index: usize) {
        while index >= self.capacity {
            self.grow();
        }
        self.words[index / WORD_BITS] |= 1u64 << (index % WORD_BITS);
    }

    /// Whether `index` is marked. False for negative or out-of-range indices.
    pub fn contains(&self, index: i64) -> bool {
        if index < 0 || index as usize >= self.capacity {
            return false;
        }
        let index = index as usize;
        self.words[index / WORD_BITS] & (1u64 << (index % WORD_BITS)) != 0
    }

    /// Replay a checkpoint log, returning the largest index read.
    ///
    /// Blank, unparseable and out-of-range lines are skipped.
    pub async fn load<R: AsyncBufRead + Unpin>(&mut self, reader: R) -> Result<i64> {
        let mut frontier = 0;
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(index) = self.load_line(&line) {
                frontier = frontier.max(index);
            }
        }
        Ok(frontier)
    }

    fn load_line(&mut self, line: &str) -> Option<i64> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let index = match line.parse::<i64>() {
            Ok(index) => index,
            Err(e) => {
                warn!("Skipping checkpoint entry {:?}: {}", line, e);
                return None;
            }
        };
        if !(0..=MAX_INDEX).contains(&index) {
            warn!("Skipping checkpoint entry {}: out of range", index);
            return None;
        }
        self.insert(index as usize);
        Some(index)
    }

    fn grow(&mut self) {
        let new_capacity = if self.capacity > MAX_DOUBLE_SIZE {
            self.capacity + MAX_DOUBLE_SIZE
        } else {
            self.capacity * 2
        };
        self.words.resize(new_capacity.div_ceil(WORD_BITS), 0);
        self.capacity = new_capacity;
    }
}
