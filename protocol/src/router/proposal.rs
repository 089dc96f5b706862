//! # Settlement Proposals
//!
//! A settlement proposal is a relayer's claim about a closed batch: "the
//! custodian reports this total; settle the batch against it". The claim
//! does not take effect immediately -- it sits in `Proposed` status through
//! a cooldown window during which a guardian can cancel it, and only then
//! may anyone execute it.
//!
//! ```text
//!              cancel (guardian, any time before execution)
//!            +--------------------------------> Cancelled
//!            |
//!   Proposed +
//!            |
//!            +--------------------------------> Executed
//!              execute (anyone, after cooldown)
//! ```
//!
//! Both outcomes are terminal. A cancelled proposal frees its batch for a
//! fresh proposal; an executed one settles the batch for good. The yield
//! and netting figures are derived by the router at proposal time, never
//! supplied by the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AssetId, BatchId, ProposalId, VaultId};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// The lifecycle status of a settlement proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    /// Waiting out its cooldown; cancellable by a guardian.
    Proposed,
    /// Settlement applied. Terminal.
    Executed,
    /// Vetoed by a guardian before execution. Terminal.
    Cancelled,
}

impl ProposalStatus {
    /// Whether the proposal may still be executed (cooldown permitting).
    pub fn allows_execution(&self) -> bool {
        matches!(self, ProposalStatus::Proposed)
    }

    /// Whether a guardian may still cancel the proposal.
    pub fn allows_cancellation(&self) -> bool {
        matches!(self, ProposalStatus::Proposed)
    }

    /// Whether the proposal has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalStatus::Executed | ProposalStatus::Cancelled)
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposalStatus::Proposed => write!(f, "Proposed"),
            ProposalStatus::Executed => write!(f, "Executed"),
            ProposalStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Proposal
// ---------------------------------------------------------------------------

/// A pending or resolved settlement claim against one closed batch.
///
/// `deposited` and `requested` are snapshots of the batch's frozen tallies
/// at proposal time; `yield_amount`/`is_profit` is the delta the router
/// derived between the reported total and the vault's baseline. Records are
/// never deleted -- resolved proposals stay in the router's map for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementProposal {
    /// Content-derived identifier (vault, batch, asset, nonce).
    pub id: ProposalId,
    /// The vault being settled.
    pub vault: VaultId,
    /// The asset the vault settles in.
    pub asset: AssetId,
    /// The closed batch this proposal targets.
    pub batch: BatchId,
    /// Custodian-reported total assets at proposal time.
    pub reported_total: u64,
    /// The batch's frozen inflow tally.
    pub deposited: u64,
    /// The batch's frozen outflow tally.
    pub requested: u64,
    /// Magnitude of the derived yield delta.
    pub yield_amount: u64,
    /// Whether the delta is a profit (`reported >= baseline`).
    pub is_profit: bool,
    /// Account that proposed the settlement.
    pub proposed_by: String,
    /// When the proposal was created.
    pub proposed_at: DateTime<Utc>,
    /// Earliest instant at which execution is allowed.
    pub execute_after: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: ProposalStatus,
    /// When the proposal reached a terminal status, if it has.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SettlementProposal {
    /// Net flow of the proposed batch: inflow minus withdrawal intent.
    /// Negative when redemptions outweighed deposits.
    pub fn netted(&self) -> i128 {
        i128::from(self.deposited) - i128::from(self.requested)
    }

    /// The derived yield as a signed figure.
    pub fn yield_signed(&self) -> i128 {
        if self.is_profit {
            i128::from(self.yield_amount)
        } else {
            -i128::from(self.yield_amount)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
