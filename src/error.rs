//! Error types for the playback harness

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while replaying a trace
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Trace Errors
    // =========================================================================
    /// Malformed trace row (size or timestamp unparseable)
    #[error("Failed to parse trace row {line}: {reason}")]
    TraceParse { line: u64, reason: String },

    /// Trace file has no header row
    #[error("Empty trace file: {0}")]
    EmptyTrace(String),

    // =========================================================================
    // Simulation Errors
    // =========================================================================
    /// Backend reported failure for a request
    #[error("Backend {op} failed for key {key} (request {request_id})")]
    Backend {
        op: &'static str,
        key: String,
        request_id: String,
    },

    /// A shard expected to be resident is in neither its slot nor the evicted table
    #[error("Chunk {shard}@{key} not found in slot {slot} nor in evicted chunks")]
    Consistency {
        key: String,
        shard: usize,
        slot: usize,
    },

    /// The consistent ring cannot place a partition within the load bound
    #[error("Not enough room to distribute partition {partition} across {members} members")]
    RingCapacity { partition: u64, members: usize },

    // =========================================================================
    // Erasure Coding Errors
    // =========================================================================
    /// Invalid EC configuration
    #[error("Invalid EC configuration: {0}")]
    InvalidEcConfig(String),

    /// EC encoding failed
    #[error("EC encoding failed: {0}")]
    EcEncodingFailed(String),

    /// Insufficient shards for reconstruction
    #[error("Insufficient shards for reconstruction: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint log error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for errors that abandon a single record without stopping the replay
    pub fn is_record_local(&self) -> bool {
        matches!(
            self,
            Error::TraceParse { .. } | Error::Backend { .. } | Error::Consistency { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistency_error_display() {
        let err = Error::Consistency {
            key: "obj".to_string(),
            shard: 2,
            slot: 7,
        };
        assert_eq!(
            err.to_string(),
            "Chunk 2@obj not found in slot 7 nor in evicted chunks"
        );
        assert!(err.is_record_local());
    }

    #[test]
    fn test_io_error_is_fatal() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(!err.is_record_local());
    }
}
