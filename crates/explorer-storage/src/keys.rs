//! Key encodings.
//!
//! Sequences are zero-padded so lexicographic order equals numeric order.

use crate::error::StorageError;

/// Key for a stream entry.
/// Format: entry:{sequence:020}
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntryKey {
    pub sequence: u64,
}

impl EntryKey {
    pub fn new(sequence: u64) -> Self {
        Self { sequence }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("entry:{:020}", self.sequence).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;

        let sequence = s
            .strip_prefix("entry:")
            .ok_or_else(|| StorageError::Key(format!("Invalid entry key format: {}", s)))?
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid sequence: {}", e)))?;

        Ok(Self { sequence })
    }
}

/// Key for a pending (delivered, unacknowledged) entry.
/// Format: pending:{group}:{stream}:{sequence:020}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingKey {
    pub group: String,
    pub stream: String,
    pub sequence: u64,
}

impl PendingKey {
    pub fn new(group: &str, stream: &str, sequence: u64) -> Self {
        Self {
            group: group.to_string(),
            stream: stream.to_string(),
            sequence,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("pending:{}:{}:{:020}", self.group, self.stream, self.sequence).into_bytes()
    }

    /// Prefix covering all pending entries of a group, optionally one stream.
    pub fn prefix(group: &str, stream: Option<&str>) -> Vec<u8> {
        match stream {
            Some(stream) => format!("pending:{}:{}:", group, stream).into_bytes(),
            None => format!("pending:{}:", group).into_bytes(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;

        // Group names may not contain ':'; streams never do.
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 || parts[0] != "pending" {
            return Err(StorageError::Key(format!("Invalid pending key format: {}", s)));
        }

        let sequence = parts[3]
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid sequence: {}", e)))?;

        Ok(Self {
            group: parts[1].to_string(),
            stream: parts[2].to_string(),
            sequence,
        })
    }
}

/// Key for a consumer group cursor.
/// Format: cursor:{group}:{stream}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorKey {
    pub group: String,
    pub stream: String,
}

impl CursorKey {
    pub fn new(group: &str, stream: &str) -> Self {
        Self {
            group: group.to_string(),
            stream: stream.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("cursor:{}:{}", self.group, self.stream).into_bytes()
    }
}
