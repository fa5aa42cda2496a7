//! Erasure Coding Module
//!
//! Reed-Solomon coding used by backends that actually store object bodies.
//! The simulator itself only models shard counts and placement; this codec
//! gives the in-memory adapter real shards to keep per slot.
//!
//! ```text
//!   object ──encode──▶ [d0 d1 d2 d3 | p0 p1] ──store per slot──▶ slots
//!   slots  ──collect─▶ [d0 -- d2 d3 | p0 --] ──decode──────────▶ object
//! ```

mod codec;

pub use codec::ShardCodec;
