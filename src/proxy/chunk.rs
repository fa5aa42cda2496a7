//! Chunk Types

use std::fmt;

use serde::Serialize;

/// Identity of one erasure-coded shard: shard index plus object key.
///
/// Displays as `<shard>@<key>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChunkKey {
    pub shard: usize,
    pub object: String,
}

impl ChunkKey {
    pub fn new(shard: usize, object: impl Into<String>) -> Self {
        Self {
            shard,
            object: object.into(),
        }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.shard, self.object)
    }
}

/// Simulated shard bookkeeping. Holds sizes and counters, never data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub key: ChunkKey,
    /// Size in bytes
    pub size: u64,
    /// Number of hits served
    pub access_frequency: u64,
    /// Number of miss recoveries
    pub reset_count: u64,
    /// Slot-local touch stamp, used to pick eviction victims
    pub(crate) last_touch: u64,
}

impl Chunk {
    pub fn new(key: ChunkKey, size: u64) -> Self {
        Self {
            key,
            size,
            access_frequency: 0,
            reset_count: 0,
            last_touch: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_key_display() {
        assert_eq!(ChunkKey::new(3, "obj").to_string(), "3@obj");
    }

    #[test]
    fn test_chunk_key_is_structured() {
        // "1@2@x" as a formatted string would be ambiguous; the struct is not.
        let a = ChunkKey::new(1, "2@x");
        let b = ChunkKey::new(12, "x");
        assert_ne!(a, b);
    }
}
