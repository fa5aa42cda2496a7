//! Domain Layer
//!
//! Core value types shared by the replay engine and the backend adapters.
//!
//! - **Record** (`record.rs`) - A parsed trace event
//! - **Ports** (`ports.rs`) - The narrow backend [`Client`] capability the
//!   engine depends on

pub mod ports;
pub mod record;

pub use ports::{Client, GetOptions, GetOutcome, RequestTag, SetOptions, SetOutcome};
pub use record::TraceRecord;
