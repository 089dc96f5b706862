//! # Virtual Balance Router
//!
//! The accounting hub of the protocol. Gateways never move underlying
//! assets directly; they report flow intents to the router, and the router
//! reconciles them against custodian-reported totals through the
//! settlement proposal state machine:
//!
//! ```text
//!   minter gateway            staking vault
//!        |                         |
//!        | push_assets             | push_shares
//!        | request_pull            | pull_shares
//!        v                         v
//!   +---------------------------------------+
//!   |          VirtualBalanceRouter         |
//!   |  entries / baselines / share flows    |
//!   +---------------------------------------+
//!        |                         ^
//!        | propose_settle_batch    | cancel_proposal (guardian)
//!        v                         |
//!   SettlementProposal -- cooldown -- execute_settle_batch (anyone)
//! ```
//!
//! | File          | Contents                                            |
//! |---------------|-----------------------------------------------------|
//! | `balance.rs`  | [`VirtualBook`]: per-(vault, asset) flow entries,   |
//! |               | baselines, staking share flows                      |
//! | `proposal.rs` | [`SettlementProposal`] and its status machine       |
//! | `router.rs`   | [`VirtualBalanceRouter`]: the operations            |
//!
//! ## Design principles
//!
//! - **Delta derivation.** Callers report totals; the router derives
//!   netting and yield itself. A relayer cannot smuggle in yield figures.
//! - **Time-delayed execution.** Every settlement sits behind a cooldown
//!   during which a guardian can cancel it. No synchronous settlement.
//! - **Check then mutate.** Every operation validates completely before
//!   touching state, so a failure never leaves a half-applied settlement.

pub mod balance;
pub mod proposal;
pub mod router;

pub use balance::{BalanceError, ShareFlowEntry, VirtualBalanceEntry, VirtualBook};
pub use proposal::{ProposalStatus, SettlementProposal};
pub use router::{RouterError, SettlementOutcome, VirtualBalanceRouter};
