//! # Storage Module
//!
//! Durability for the settlement core: an append-only event journal,
//! versioned state snapshots, and deterministic replay.
//!
//! ## Architecture
//!
//! ```text
//! journal.rs  — sled-backed append-only journal of event records
//! snapshot.rs — versioned CoreState images with forward migration
//! replay.rs   — rebuilds CoreState by re-running journaled operations
//! ```
//!
//! ## Recovery Flow
//!
//! ```text
//! EventJournal ──latest_snapshot()──▶ StateSnapshot ──decode/migrate──▶ CoreState
//!       │                                                                 ▲
//!       └──────records_after(snapshot.journal_seq)──────▶ replay::rebuild ┘
//! ```
//!
//! A restarting node loads the newest snapshot (migrating old schemas
//! forward), replays every record journaled after it, and resumes with
//! state identical to what it held before the restart.
//!
//! ## Design Decisions
//!
//! 1. **Operations, not state diffs.** The journal stores what happened;
//!    replay re-runs it through the live entry points. Identifier
//!    derivation and settlement math are deterministic, so the rebuilt
//!    state matches bit for bit, and replay doubles as an integrity
//!    check on the journal.
//!
//! 2. **Bincode on disk.** Compact, fast, deterministic. JSON is for
//!    APIs and debugging; bincode is for storage.
//!
//! 3. **Snapshots carry a version header.** Four big-endian bytes ahead
//!    of the payload, so old images keep decoding after the state shape
//!    changes and unknown versions fail loudly instead of misparsing.

pub mod journal;
pub mod replay;
pub mod snapshot;

pub use journal::{EventJournal, StoreError, StoreResult};
pub use replay::{rebuild, resume, ReplayError};
pub use snapshot::{StateSnapshot, SCHEMA_VERSION};
