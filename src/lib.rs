#![doc = r#"
waffledb: Embedded Time-Series Storage Engine in Rust

This crate provides a single-process library that ingests timestamped
numeric samples tagged with arbitrary string key/value dimensions, persists
them durably to a local directory, and answers range and aggregation
queries over them. It is built as a layered pipeline:

- Write-ahead log for durability and crash recovery
- Lock-free MPSC ingest buffer feeding a background flusher
- Columnar chunk store organized per metric, with compressed blocks
- Adaptive chunk index pruning by metric, time bounds, and tag presence
- Range and aggregation query engine over active and sealed chunks

See the README for usage examples and more details.
"#]
// Declare modules
pub mod chunk;
pub mod compression;
pub mod core;
pub mod error;
pub mod index;
pub mod query;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod wal;

/// Main entry point for interacting with the time-series engine.
pub use crate::core::Database;
/// Configuration options for the engine.
pub use crate::core::DbConfig;
/// Base directory holding one subdirectory per database.
pub use crate::core::DEFAULT_BASE_DIR;
/// Error type for database operations.
pub use crate::error::DbError;
/// Columnar chunk type and its fixed capacity.
pub use crate::chunk::{ColumnarChunk, CHUNK_CAPACITY};
/// Write-ahead log for durability and recovery.
pub use crate::wal::WriteAheadLog;
/// Structured event hook for observability.
pub use crate::telemetry::{DbEvent, DbEventListener};
/// Represents a single time-series sample.
pub use crate::types::Sample;
/// Type alias for a set of tags (key-value pairs) associated with a sample.
pub use crate::types::TagSet;
/// Type alias for a timestamp (opaque seconds since epoch).
pub use crate::types::Timestamp;
/// Type alias for a value in a time series (f64).
pub use crate::types::Value;

// Default flush interval if not specified
use std::time::Duration;
/// The default interval between automatic ingest-queue drains (100 ms).
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
