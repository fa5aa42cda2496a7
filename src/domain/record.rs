//! Trace Record
//!
//! One timestamped access event read from a trace, after size transforms.

use chrono::NaiveDateTime;
use serde::Serialize;

/// Immutable object access parsed from a trace row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceRecord {
    /// Object key
    pub key: String,
    /// Object size in bytes
    pub size: u64,
    /// Size of each erasure-coded chunk (`size / data_shards`)
    pub chunk_size: u64,
    /// Trace timestamp of the access
    pub timestamp: NaiveDateTime,
}

impl TraceRecord {
    /// Create a record, deriving the chunk size from the data shard count.
    pub fn new(
        key: impl Into<String>,
        size: u64,
        data_shards: usize,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            key: key.into(),
            size,
            chunk_size: size / data_shards.max(1) as u64,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_chunk_size_derivation() {
        let ts = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let record = TraceRecord::new("A", 40, 4, ts);
        assert_eq!(record.chunk_size, 10);

        let uneven = TraceRecord::new("B", 43, 4, ts);
        assert_eq!(uneven.chunk_size, 10);
    }
}
