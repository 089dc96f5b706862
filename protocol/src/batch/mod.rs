//! # Batch Module
//!
//! Batch lifecycle and per-batch custody for the settlement cycle.
//!
//! Every vault processes flow in batches. A batch collects deposit and
//! withdrawal intents while it is `Open`, stops accepting them when it is
//! `Closed`, and becomes claimable once a settlement proposal against it is
//! `Settled`:
//!
//! ```text
//!   open_batch          close_batch           settle
//!  ----------->  Open  ------------>  Closed  ------>  Settled
//!                 |                      |
//!                 |  record_deposit      |  (tallies frozen,
//!                 |  record_request      |   proposals may target it)
//! ```
//!
//! | File          | Contents                                             |
//! |---------------|------------------------------------------------------|
//! | `ledger.rs`   | [`Batch`], [`BatchStatus`], [`BatchPricing`], the    |
//! |               | per-vault [`BatchLedger`]                            |
//! | `receiver.rs` | [`BatchReceiver`] custody entries and the            |
//! |               | [`ReceiverRegistry`]                                 |
//!
//! Batches are strictly monotonic per vault: sequence numbers never repeat,
//! a settled batch is never revisited, and settlement happens in sequence
//! order so baseline accounting always moves forward.

pub mod ledger;
pub mod receiver;

pub use ledger::{Batch, BatchError, BatchLedger, BatchPricing, BatchStatus};
pub use receiver::{BatchReceiver, ReceiverError, ReceiverRegistry};
