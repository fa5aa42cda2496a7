//! Shard Codec
//!
//! Reed-Solomon split/encode and reconstruct/join over byte buffers, built on
//! the `reed-solomon-erasure` crate. A zero parity count degrades to a plain
//! split with no redundancy.

use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::{debug, instrument};

use crate::error::{Error, Result};

/// k+m erasure codec over whole objects
pub struct ShardCodec {
    /// `None` when there are no parity shards
    rs: Option<ReedSolomon>,
    data_shards: usize,
    parity_shards: usize,
}

impl ShardCodec {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(Error::InvalidEcConfig(
                "data_shards must be greater than 0".to_string(),
            ));
        }
        let rs = if parity_shards == 0 {
            None
        } else {
            Some(ReedSolomon::new(data_shards, parity_shards).map_err(|e| {
                Error::InvalidEcConfig(format!("Failed to create Reed-Solomon codec: {}", e))
            })?)
        };
        Ok(Self {
            rs,
            data_shards,
            parity_shards,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Bytes per shard for an object of `len` bytes. Never zero.
    pub fn shard_size(&self, len: usize) -> usize {
        len.div_ceil(self.data_shards).max(1)
    }

    /// Split `data` into padded data shards followed by parity shards.
    #[instrument(level = "trace", skip(self, data), fields(data_len = data.len()))]
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let shard_size = self.shard_size(data.len());
        let mut shards: Vec<Vec<u8>> = (0..self.data_shards)
            .map(|i| {
                let start = (i * shard_size).min(data.len());
                let end = (start + shard_size).min(data.len());
                let mut shard = data[start..end].to_vec();
                shard.resize(shard_size, 0);
                shard
            })
            .collect();
        shards.extend((0..self.parity_shards).map(|_| vec![0u8; shard_size]));

        if let Some(rs) = &self.rs {
            rs.encode(&mut shards)
                .map_err(|e| Error::EcEncodingFailed(format!("Reed-Solomon encoding failed: {}", e)))?;
        }
        Ok(shards)
    }

    /// Rebuild the original `original_size` bytes from surviving shards.
    #[instrument(level = "trace", skip(self, shards))]
    pub fn decode(&self, mut shards: Vec<Option<Vec<u8>>>, original_size: usize) -> Result<Vec<u8>> {
        if shards.len() != self.total_shards() {
            return Err(Error::InvalidEcConfig(format!(
                "Expected {} shards, got {}",
                self.total_shards(),
                shards.len()
            )));
        }
        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.data_shards {
            return Err(Error::InsufficientShards {
                available,
                required: self.data_shards,
            });
        }

        let missing_data = shards.iter().take(self.data_shards).any(Option::is_none);
        match &self.rs {
            Some(rs) if missing_data => {
                rs.reconstruct_data(&mut shards).map_err(|e| {
                    Error::EcEncodingFailed(format!("Reed-Solomon reconstruction failed: {}", e))
                })?;
                debug!(
                    "Reconstructed data shards from {}/{} available",
                    available,
                    self.total_shards()
                );
            }
            _ => {}
        }

        let mut data = Vec::with_capacity(original_size);
        for shard in shards.into_iter().take(self.data_shards) {
            let shard = shard.ok_or(Error::InsufficientShards {
                available,
                required: self.data_shards,
            })?;
            data.extend_from_slice(&shard);
        }
        data.truncate(original_size);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_invalid_config() {
        assert!(ShardCodec::new(0, 2).is_err());
        assert!(ShardCodec::new(4, 0).is_ok());
    }

    #[test]
    fn test_encode_produces_equal_shards() {
        let codec = ShardCodec::new(4, 2).unwrap();
        let shards = codec.encode(b"Hello, World! This is a test of erasure coding.").unwrap();
        assert_eq!(shards.len(), 6);
        assert!(shards.iter().all(|s| s.len() == shards[0].len()));
    }

    #[test]
    fn test_decode_with_lost_shards() {
        let codec = ShardCodec::new(4, 2).unwrap();
        let data = b"object body that outlives two lost shards".to_vec();
        let mut shards: Vec<Option<Vec<u8>>> =
            codec.encode(&data).unwrap().into_iter().map(Some).collect();
        shards[0] = None;
        shards[3] = None;
        assert_eq!(codec.decode(shards, data.len()).unwrap(), data);
    }

    #[test]
    fn test_decode_insufficient_shards() {
        let codec = ShardCodec::new(4, 2).unwrap();
        let mut shards: Vec<Option<Vec<u8>>> =
            codec.encode(b"abcdefgh").unwrap().into_iter().map(Some).collect();
        shards[0] = None;
        shards[1] = None;
        shards[2] = None;
        assert_matches!(
            codec.decode(shards, 8),
            Err(Error::InsufficientShards { available: 3, required: 4 })
        );
    }

    #[test]
    fn test_empty_object() {
        let codec = ShardCodec::new(4, 2).unwrap();
        let shards: Vec<Option<Vec<u8>>> =
            codec.encode(&[]).unwrap().into_iter().map(Some).collect();
        assert!(codec.decode(shards, 0).unwrap().is_empty());
    }

    #[test]
    fn test_no_parity_split() {
        let codec = ShardCodec::new(3, 0).unwrap();
        let shards: Vec<Option<Vec<u8>>> =
            codec.encode(b"abcdefg").unwrap().into_iter().map(Some).collect();
        assert_eq!(shards.len(), 3);
        assert_eq!(codec.decode(shards, 7).unwrap(), b"abcdefg");
    }
}
