//! # Event Journal
//!
//! Durable, append-only storage for event records, built on sled's
//! embedded key-value store. The journal is the protocol's source of
//! truth on disk: core state is derivable from it at any time
//! (`storage::replay`), and snapshots exist only to shorten the replay.
//!
//! ## Tree Layout
//!
//! | Tree        | Key                  | Value                     |
//! |-------------|----------------------|---------------------------|
//! | `events`    | `seq` (8B BE)        | `bincode(EventRecord)`    |
//! | `snapshots` | `journal_seq` (8B BE)| versioned snapshot bytes  |
//! | `meta`      | key (UTF-8)          | value (bytes)             |
//!
//! Sequence numbers are stored big-endian so sled's lexicographic order
//! matches numeric order and range scans walk the journal forward.

use sled::{Db, Tree};
use std::path::Path;

use thiserror::Error;

use crate::events::EventRecord;
use crate::storage::snapshot::StateSnapshot;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying store failed.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// A value would not encode or decode.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A persisted snapshot was written by a schema this build does not
    /// know how to read.
    #[error("unsupported snapshot schema version {found}")]
    UnsupportedSchema {
        /// The version found on disk.
        found: u32,
    },
}

/// Shorthand for storage results.
pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Metadata Keys
// ---------------------------------------------------------------------------

/// Well-known key in the `meta` tree for the highest appended sequence.
const META_LATEST_SEQ: &[u8] = b"latest_seq";
/// Well-known key in the `meta` tree for the journal seq of the most
/// recent snapshot.
const META_SNAPSHOT_SEQ: &[u8] = b"latest_snapshot_seq";

// ---------------------------------------------------------------------------
// EventJournal
// ---------------------------------------------------------------------------

/// The on-disk event journal.
///
/// Appends are flushed before returning, so an acknowledged record
/// survives a crash. sled serializes writes internally; the journal can
/// be shared across threads behind an `Arc` without extra locking.
#[derive(Debug, Clone)]
pub struct EventJournal {
    /// The underlying sled database handle.
    db: Db,
    /// Event records keyed by big-endian sequence.
    events: Tree,
    /// Snapshots keyed by the journal sequence they were taken at.
    snapshots: Tree,
    /// Journal metadata (latest sequence, snapshot pointer).
    meta: Tree,
}

impl EventJournal {
    /// Opens or creates a journal at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Creates a temporary journal that is discarded on drop. For tests
    /// and the keeper's simulation mode.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let events = db.open_tree("events")?;
        let snapshots = db.open_tree("snapshots")?;
        let meta = db.open_tree("meta")?;
        Ok(Self {
            db,
            events,
            snapshots,
            meta,
        })
    }

    // -- Event operations ----------------------------------------------------

    /// Appends a record and flushes it to disk.
    pub fn append(&self, record: &EventRecord) -> StoreResult<()> {
        let key = record.seq.to_be_bytes();
        let bytes = bincode::serialize(record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.events.insert(key, bytes)?;
        self.meta.insert(META_LATEST_SEQ, &key)?;
        self.db.flush()?;
        Ok(())
    }

    /// All records in sequence order.
    pub fn records(&self) -> StoreResult<Vec<EventRecord>> {
        let mut records = Vec::with_capacity(self.events.len());
        for entry in self.events.iter() {
            let (_, value) = entry?;
            let record: EventRecord = bincode::deserialize(&value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Records with sequence strictly greater than `seq`, in order.
    pub fn records_after(&self, seq: u64) -> StoreResult<Vec<EventRecord>> {
        let start = seq.saturating_add(1).to_be_bytes();
        let mut records = Vec::new();
        for entry in self.events.range(start..) {
            let (_, value) = entry?;
            let record: EventRecord = bincode::deserialize(&value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    /// The highest sequence ever appended, if any.
    pub fn latest_seq(&self) -> StoreResult<Option<u64>> {
        read_seq(&self.meta, META_LATEST_SEQ)
    }

    /// Number of records in the journal.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the journal holds no records.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    // -- Snapshot operations -------------------------------------------------

    /// Persists a snapshot and points the snapshot metadata at it.
    pub fn put_snapshot(&self, snapshot: &StateSnapshot) -> StoreResult<()> {
        let key = snapshot.journal_seq.to_be_bytes();
        let bytes = snapshot.encode()?;
        self.snapshots.insert(key, bytes)?;
        self.meta.insert(META_SNAPSHOT_SEQ, &key)?;
        self.db.flush()?;
        Ok(())
    }

    /// The most recent snapshot, if one was ever taken.
    pub fn latest_snapshot(&self) -> StoreResult<Option<StateSnapshot>> {
        let Some(seq) = read_seq(&self.meta, META_SNAPSHOT_SEQ)? else {
            return Ok(None);
        };
        match self.snapshots.get(seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(StateSnapshot::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Blocks until all buffered writes are durable.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Reads an 8-byte big-endian sequence from a metadata slot.
fn read_seq(meta: &Tree, key: &[u8]) -> StoreResult<Option<u64>> {
    match meta.get(key)? {
        Some(bytes) => {
            let raw: [u8; 8] = bytes
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Serialization("invalid sequence bytes".to_string()))?;
            Ok(Some(u64::from_be_bytes(raw)))
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::ids::{AssetId, BatchId, VaultId};
    use crate::state::CoreState;
    use chrono::Utc;

    fn record(seq: u64) -> EventRecord {
        let vault = VaultId::derive("treasury-prime");
        let asset = AssetId::derive("USDY");
        EventRecord {
            seq,
            at: Utc::now(),
            event: Event::AssetsPushed {
                vault,
                asset,
                batch: BatchId::derive(&vault, &asset, 1),
                amount: seq * 100,
                by: "cairn:inst:alpha".to_string(),
            },
        }
    }

    #[test]
    fn empty_journal_reads_empty() {
        let journal = EventJournal::open_temporary().unwrap();
        assert!(journal.is_empty());
        assert_eq!(journal.latest_seq().unwrap(), None);
        assert!(journal.records().unwrap().is_empty());
        assert!(journal.latest_snapshot().unwrap().is_none());
    }

    #[test]
    fn appends_scan_back_in_order() {
        let journal = EventJournal::open_temporary().unwrap();
        for seq in 1..=5 {
            journal.append(&record(seq)).unwrap();
        }

        let records = journal.records().unwrap();
        assert_eq!(records.len(), 5);
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(journal.latest_seq().unwrap(), Some(5));
    }

    #[test]
    fn records_after_is_exclusive() {
        let journal = EventJournal::open_temporary().unwrap();
        for seq in 1..=4 {
            journal.append(&record(seq)).unwrap();
        }
        let tail = journal.records_after(2).unwrap();
        let seqs: Vec<u64> = tail.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert!(journal.records_after(4).unwrap().is_empty());
    }

    #[test]
    fn journal_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let journal = EventJournal::open(dir.path()).unwrap();
            journal.append(&record(1)).unwrap();
            journal.append(&record(2)).unwrap();
        }

        let reopened = EventJournal::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.latest_seq().unwrap(), Some(2));
        let records = reopened.records().unwrap();
        assert_eq!(records[1].event.kind(), "assets_pushed");
    }

    #[test]
    fn snapshot_round_trip_through_the_store() {
        let journal = EventJournal::open_temporary().unwrap();
        for seq in 1..=3 {
            journal.append(&record(seq)).unwrap();
        }

        let snapshot = StateSnapshot::capture(&CoreState::new(), 3, Utc::now());
        journal.put_snapshot(&snapshot).unwrap();

        let loaded = journal.latest_snapshot().unwrap().expect("snapshot");
        assert_eq!(loaded.journal_seq, 3);
        assert_eq!(loaded.core, CoreState::new());
    }
}
