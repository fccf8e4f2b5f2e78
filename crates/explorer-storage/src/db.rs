//! RocksDB wrapper implementing consumer-group streams.
//!
//! Provides:
//! - Database open with column family setup
//! - Append with a monotonic, store-wide sequence
//! - Group reads that advance a cursor and record pending entries
//! - Pending-entry recovery and idle reclaim
//! - Atomic ack (ack + delete) and requeue (ack + delete + append)
//! - Settling a whole batch of acks and requeues in one WriteBatch

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::column_families::{build_cf_descriptors, is_stream, ALL_STREAMS, CF_CURSORS, CF_PENDING};
use crate::error::StorageError;
use crate::keys::{CursorKey, EntryKey, PendingKey};

/// An entry delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub stream: String,
    pub sequence: u64,
    pub payload: Vec<u8>,
    /// How many times this entry has been handed out, including this one
    pub delivery_count: u32,
}

/// A delivered entry to move to another stream with a new payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requeue {
    pub from_stream: String,
    pub sequence: u64,
    pub to_stream: String,
    pub payload: Vec<u8>,
}

/// Bookkeeping for a delivered, unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub consumer: String,
    pub delivered_at_ms: i64,
    pub delivery_count: u32,
}

/// Stream depths for a consumer group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Stored entries per stream (delivered or not)
    pub lengths: BTreeMap<String, u64>,
    /// Entries delivered to the group but not yet acknowledged
    pub pending: u64,
}

/// Durable streams with consumer-group semantics.
pub struct StreamStore {
    db: DB,
    /// Store-wide sequence; orders entries across streams by append time
    sequence: AtomicU64,
    /// Serializes appends with cursor and pending-list updates, so a
    /// sequence is never written below a cursor that already passed it
    group_lock: Mutex<()>,
    appended: watch::Sender<u64>,
}

impl StreamStore {
    /// Open the store at the given path, creating if necessary
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening stream store at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(2);

        let db = DB::open_cf_descriptors(&db_opts, path, build_cf_descriptors())?;
        let sequence = Self::load_sequence(&db)?;
        let (appended, _) = watch::channel(sequence);

        Ok(Self {
            db,
            sequence: AtomicU64::new(sequence),
            group_lock: Mutex::new(()),
            appended,
        })
    }

    /// Highest entry sequence across all streams, plus one
    fn load_sequence(db: &DB) -> Result<u64, StorageError> {
        let mut next = 0;
        for stream in ALL_STREAMS {
            let cf = db
                .cf_handle(stream)
                .ok_or_else(|| StorageError::ColumnFamilyNotFound(stream.to_string()))?;
            let mut iter = db.iterator_cf(cf, IteratorMode::End);
            if let Some(result) = iter.next() {
                let (key, _) = result?;
                next = next.max(EntryKey::from_bytes(&key)?.sequence + 1);
            }
        }
        Ok(next)
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(name.to_string()))
    }

    fn stream_cf(&self, stream: &str) -> Result<&ColumnFamily, StorageError> {
        if !is_stream(stream) {
            return Err(StorageError::UnknownStream(stream.to_string()));
        }
        self.cf(stream)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Subscribe to append notifications.
    ///
    /// The watched value is the last appended sequence.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.appended.subscribe()
    }

    /// Append an entry to a stream.
    pub fn append(&self, stream: &str, payload: &[u8]) -> Result<u64, StorageError> {
        let cf = self.stream_cf(stream)?;
        let sequence = {
            let _guard = self.group_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let sequence = self.next_sequence();
            self.db.put_cf(cf, EntryKey::new(sequence).to_bytes(), payload)?;
            sequence
        };
        debug!(stream, sequence, "Appended stream entry");
        self.appended.send_replace(sequence);
        Ok(sequence)
    }

    /// Next undelivered sequence for a group on a stream
    fn read_cursor(&self, group: &str, stream: &str) -> Result<u64, StorageError> {
        let cf = self.cf(CF_CURSORS)?;
        match self.db.get_cf(cf, CursorKey::new(group, stream).to_bytes())? {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| StorageError::Key(format!("Corrupt cursor for {}:{}", group, stream))),
            None => Ok(0),
        }
    }

    /// Deliver up to `count` new entries of a stream to a consumer.
    ///
    /// Delivered entries move to the group's pending list and stay there
    /// until acknowledged or requeued.
    pub fn read_group(
        &self,
        group: &str,
        consumer: &str,
        stream: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let _guard = self.group_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let stream_cf = self.stream_cf(stream)?;
        let pending_cf = self.cf(CF_PENDING)?;
        let cursors_cf = self.cf(CF_CURSORS)?;

        let start = EntryKey::new(self.read_cursor(group, stream)?).to_bytes();
        let now_ms = Utc::now().timestamp_millis();

        let mut entries = Vec::new();
        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator_cf(stream_cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter.take(count) {
            let (key, value) = item?;
            let sequence = EntryKey::from_bytes(&key)?.sequence;
            let pending = PendingEntry {
                consumer: consumer.to_string(),
                delivered_at_ms: now_ms,
                delivery_count: 1,
            };
            batch.put_cf(
                pending_cf,
                PendingKey::new(group, stream, sequence).to_bytes(),
                serde_json::to_vec(&pending)?,
            );
            entries.push(StreamEntry {
                stream: stream.to_string(),
                sequence,
                payload: value.to_vec(),
                delivery_count: 1,
            });
        }

        if let Some(last) = entries.last() {
            batch.put_cf(
                cursors_cf,
                CursorKey::new(group, stream).to_bytes(),
                (last.sequence + 1).to_string(),
            );
            self.db.write(batch)?;
            debug!(group, stream, count = entries.len(), "Delivered stream entries");
        }

        Ok(entries)
    }

    /// Re-deliver pending entries to `claimant`.
    ///
    /// Only entries idle for at least `min_idle_ms` are claimed. When `owner`
    /// is set, only that consumer's entries are considered; this is how a
    /// restarted consumer recovers its own unacknowledged work.
    pub fn claim_pending(
        &self,
        group: &str,
        stream: &str,
        claimant: &str,
        owner: Option<&str>,
        min_idle_ms: i64,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let _guard = self.group_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let stream_cf = self.stream_cf(stream)?;
        let pending_cf = self.cf(CF_PENDING)?;
        let prefix = PendingKey::prefix(group, Some(stream));
        let now_ms = Utc::now().timestamp_millis();

        let mut entries = Vec::new();
        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator_cf(pending_cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            if entries.len() >= count {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let mut pending: PendingEntry = serde_json::from_slice(&value)?;
            if owner.is_some_and(|o| o != pending.consumer) {
                continue;
            }
            if now_ms - pending.delivered_at_ms < min_idle_ms {
                continue;
            }
            let pending_key = PendingKey::from_bytes(&key)?;
            match self
                .db
                .get_cf(stream_cf, EntryKey::new(pending_key.sequence).to_bytes())?
            {
                Some(payload) => {
                    pending.consumer = claimant.to_string();
                    pending.delivered_at_ms = now_ms;
                    pending.delivery_count += 1;
                    batch.put_cf(pending_cf, &key, serde_json::to_vec(&pending)?);
                    entries.push(StreamEntry {
                        stream: stream.to_string(),
                        sequence: pending_key.sequence,
                        payload,
                        delivery_count: pending.delivery_count,
                    });
                }
                // Entry already gone; drop the dangling pending record
                None => batch.delete_cf(pending_cf, &key),
            }
        }

        self.db.write(batch)?;
        if !entries.is_empty() {
            info!(group, stream, claimant, count = entries.len(), "Claimed pending entries");
        }
        Ok(entries)
    }

    /// Acknowledge and delete entries.
    pub fn ack(&self, group: &str, stream: &str, sequences: &[u64]) -> Result<usize, StorageError> {
        if sequences.is_empty() {
            return Ok(0);
        }
        let _guard = self.group_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let stream_cf = self.stream_cf(stream)?;
        let pending_cf = self.cf(CF_PENDING)?;

        let mut batch = WriteBatch::default();
        for sequence in sequences {
            batch.delete_cf(pending_cf, PendingKey::new(group, stream, *sequence).to_bytes());
            batch.delete_cf(stream_cf, EntryKey::new(*sequence).to_bytes());
        }
        self.db.write(batch)?;

        debug!(group, stream, count = sequences.len(), "Acknowledged stream entries");
        Ok(sequences.len())
    }

    /// Move a delivered entry to another stream with a new payload.
    ///
    /// Ack, delete and re-append happen in one WriteBatch, so the entry is
    /// never both acknowledged and lost, nor duplicated.
    pub fn requeue(
        &self,
        group: &str,
        from_stream: &str,
        sequence: u64,
        to_stream: &str,
        payload: &[u8],
    ) -> Result<u64, StorageError> {
        let requeue = Requeue {
            from_stream: from_stream.to_string(),
            sequence,
            to_stream: to_stream.to_string(),
            payload: payload.to_vec(),
        };
        let new_sequence = self
            .settle(group, &[], std::slice::from_ref(&requeue))?
            .first()
            .copied()
            .ok_or_else(|| StorageError::Key(format!("Requeue of {}:{} wrote nothing", from_stream, sequence)))?;
        debug!(group, from_stream, sequence, to_stream, new_sequence, "Requeued stream entry");
        Ok(new_sequence)
    }

    /// Acknowledge `acks` and move `requeues` in one WriteBatch.
    ///
    /// Either every change is written or none is. Returns the new sequences
    /// of the requeued entries, in order.
    pub fn settle(
        &self,
        group: &str,
        acks: &[(String, u64)],
        requeues: &[Requeue],
    ) -> Result<Vec<u64>, StorageError> {
        if acks.is_empty() && requeues.is_empty() {
            return Ok(Vec::new());
        }
        let new_sequences = {
            let _guard = self.group_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let pending_cf = self.cf(CF_PENDING)?;

            let mut batch = WriteBatch::default();
            for (stream, sequence) in acks {
                let cf = self.stream_cf(stream)?;
                batch.delete_cf(pending_cf, PendingKey::new(group, stream, *sequence).to_bytes());
                batch.delete_cf(cf, EntryKey::new(*sequence).to_bytes());
            }
            let mut targets = Vec::with_capacity(requeues.len());
            for requeue in requeues {
                targets.push((self.stream_cf(&requeue.from_stream)?, self.stream_cf(&requeue.to_stream)?));
            }

            let mut new_sequences = Vec::with_capacity(requeues.len());
            for (requeue, (from_cf, to_cf)) in requeues.iter().zip(targets) {
                let new_sequence = self.next_sequence();
                batch.delete_cf(
                    pending_cf,
                    PendingKey::new(group, &requeue.from_stream, requeue.sequence).to_bytes(),
                );
                batch.delete_cf(from_cf, EntryKey::new(requeue.sequence).to_bytes());
                batch.put_cf(to_cf, EntryKey::new(new_sequence).to_bytes(), &requeue.payload);
                new_sequences.push(new_sequence);
            }
            self.db.write(batch)?;
            new_sequences
        };

        debug!(group, acked = acks.len(), requeued = new_sequences.len(), "Settled stream entries");
        if let Some(last) = new_sequences.last() {
            self.appended.send_replace(*last);
        }
        Ok(new_sequences)
    }

    /// Whether any stream holds entries not yet delivered to the group.
    pub fn has_undelivered(&self, group: &str) -> Result<bool, StorageError> {
        for stream in ALL_STREAMS {
            let cf = self.cf(stream)?;
            let mut iter = self.db.iterator_cf(cf, IteratorMode::End);
            if let Some(item) = iter.next() {
                let (key, _) = item?;
                if EntryKey::from_bytes(&key)?.sequence >= self.read_cursor(group, stream)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Number of pending entries for a group.
    pub fn pending_len(&self, group: &str) -> Result<u64, StorageError> {
        let pending_cf = self.cf(CF_PENDING)?;
        let prefix = PendingKey::prefix(group, None);
        let mut count = 0;
        let iter = self
            .db
            .iterator_cf(pending_cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Stored entries in a stream.
    pub fn stream_len(&self, stream: &str) -> Result<u64, StorageError> {
        let cf = self.stream_cf(stream)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn stats(&self, group: &str) -> Result<StreamStats, StorageError> {
        let mut lengths = BTreeMap::new();
        for stream in ALL_STREAMS {
            lengths.insert(stream.to_string(), self.stream_len(stream)?);
        }
        Ok(StreamStats {
            lengths,
            pending: self.pending_len(group)?,
        })
    }
}
