//! Durable priority streams for the explorer pipeline.
//!
//! Provides RocksDB-backed streams with consumer-group semantics:
//! - One column family per stream (`high|medium|low` plus `*_fail`)
//! - Zero-padded sequence keys for ordered scans
//! - Per-group cursors and a pending-entry list for explicit acknowledgement
//! - Atomic ack/requeue via WriteBatch
//! - Append notifications for blocking readers

pub mod column_families;
pub mod db;
pub mod error;
pub mod keys;

pub use column_families::{fail_stream, primary_stream, ALL_STREAMS};
pub use db::{PendingEntry, Requeue, StreamEntry, StreamStats, StreamStore};
pub use error::StorageError;
pub use keys::{CursorKey, EntryKey, PendingKey};
