//! Column family definitions for RocksDB.
//!
//! Each stream lives in its own column family so a consumer can scan it
//! independently:
//! - high, medium, low: first delivery, by priority
//! - high_fail, medium_fail, low_fail: re-deliveries after a failed attempt
//! - pending: delivered but not yet acknowledged entries, per group
//! - cursors: last delivered sequence, per group and stream

use rocksdb::{ColumnFamilyDescriptor, Options};

pub const CF_HIGH: &str = "high";
pub const CF_MEDIUM: &str = "medium";
pub const CF_LOW: &str = "low";
pub const CF_HIGH_FAIL: &str = "high_fail";
pub const CF_MEDIUM_FAIL: &str = "medium_fail";
pub const CF_LOW_FAIL: &str = "low_fail";

/// Column family for the pending-entry list
pub const CF_PENDING: &str = "pending";

/// Column family for consumer group cursors
pub const CF_CURSORS: &str = "cursors";

/// Stream names in read order: highest priority first, retries after
/// first deliveries of the same priority.
pub const ALL_STREAMS: &[&str] = &[
    CF_HIGH,
    CF_HIGH_FAIL,
    CF_MEDIUM,
    CF_MEDIUM_FAIL,
    CF_LOW,
    CF_LOW_FAIL,
];

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[
    CF_HIGH,
    CF_HIGH_FAIL,
    CF_MEDIUM,
    CF_MEDIUM_FAIL,
    CF_LOW,
    CF_LOW_FAIL,
    CF_PENDING,
    CF_CURSORS,
];

/// Primary stream for a priority name.
pub fn primary_stream(priority: &str) -> Option<&'static str> {
    match priority {
        "high" => Some(CF_HIGH),
        "medium" => Some(CF_MEDIUM),
        "low" => Some(CF_LOW),
        _ => None,
    }
}

/// Failure stream for a priority name.
pub fn fail_stream(priority: &str) -> Option<&'static str> {
    match priority {
        "high" => Some(CF_HIGH_FAIL),
        "medium" => Some(CF_MEDIUM_FAIL),
        "low" => Some(CF_LOW_FAIL),
        _ => None,
    }
}

pub fn is_stream(name: &str) -> bool {
    ALL_STREAMS.contains(&name)
}

/// Stream entries are written once and deleted on ack
fn stream_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    let mut descriptors: Vec<ColumnFamilyDescriptor> = ALL_STREAMS
        .iter()
        .map(|name| ColumnFamilyDescriptor::new(*name, stream_options()))
        .collect();
    descriptors.push(ColumnFamilyDescriptor::new(CF_PENDING, Options::default()));
    descriptors.push(ColumnFamilyDescriptor::new(CF_CURSORS, Options::default()));
    descriptors
}
