//! Two-phase request records shared by both gateway rails.
//!
//! Every deferred operation — an institutional redemption, a retail stake
//! or unstake — follows the same life: it is *requested* into the vault's
//! open batch, rides through close and settlement, and is then *claimed*
//! (or *cancelled* while its batch is still open). The records here are
//! pure bookkeeping; the funds they describe sit in gateway escrow
//! accounts on the token ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use cairn_protocol::ids::{AssetId, BatchId, RequestId, VaultId};

// ---------------------------------------------------------------------------
// RequestStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a gateway request.
///
/// ```text
/// Pending ──claim──▶ Completed
///    │
///    └──cancel (batch still open)──▶ Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Waiting on its batch to settle; cancellable while it is open.
    Pending,
    /// Claimed after settlement; terminal.
    Completed,
    /// Withdrawn while the batch was still open; terminal.
    Cancelled,
}

impl RequestStatus {
    /// Whether the request can still be claimed or cancelled.
    pub fn is_pending(&self) -> bool {
        matches!(self, RequestStatus::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Completed => write!(f, "completed"),
            RequestStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// An institutional redemption waiting out its batch.
///
/// The redeemed tokens sit in the minter's escrow account from request
/// until completion burns them (or cancellation returns them).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedeemRequest {
    /// Request identifier.
    pub id: RequestId,
    /// Primary vault being redeemed against.
    pub vault: VaultId,
    /// Asset being redeemed.
    pub asset: AssetId,
    /// Batch the request rides in.
    pub batch: BatchId,
    /// Institution that requested the redemption.
    pub requester: String,
    /// Off-ramp destination the gateway pays out to.
    pub recipient: String,
    /// Token amount escrowed.
    pub amount: u64,
    /// Where the request is in its life.
    pub status: RequestStatus,
    /// When the request was made.
    pub created_at: DateTime<Utc>,
    /// When it completed or was cancelled.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A retail stake waiting on its batch's frozen price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakeRequest {
    /// Request identifier.
    pub id: RequestId,
    /// Staking vault being entered.
    pub vault: VaultId,
    /// Underlying asset staked.
    pub asset: AssetId,
    /// Batch the request rides in.
    pub batch: BatchId,
    /// Account that staked.
    pub requester: String,
    /// Account the shares mint to at claim.
    pub recipient: String,
    /// Token amount escrowed.
    pub amount: u64,
    /// Where the request is in its life.
    pub status: RequestStatus,
    /// When the request was made.
    pub created_at: DateTime<Utc>,
    /// When it completed or was cancelled.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A retail unstake waiting on its batch's frozen price.
///
/// Shares are escrowed at request and burned at claim; the underlying
/// comes out of the vault's pool account at the frozen rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnstakeRequest {
    /// Request identifier.
    pub id: RequestId,
    /// Staking vault being exited.
    pub vault: VaultId,
    /// Share token escrowed.
    pub share_asset: AssetId,
    /// Batch the request rides in.
    pub batch: BatchId,
    /// Account that unstaked.
    pub requester: String,
    /// Account the underlying pays out to at claim.
    pub recipient: String,
    /// Share count escrowed.
    pub shares: u64,
    /// Where the request is in its life.
    pub status: RequestStatus,
    /// When the request was made.
    pub created_at: DateTime<Utc>,
    /// When it completed or was cancelled.
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_are_lowercase() {
        assert_eq!(RequestStatus::Pending.to_string(), "pending");
        assert_eq!(RequestStatus::Completed.to_string(), "completed");
        assert_eq!(RequestStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn only_pending_is_actionable() {
        assert!(RequestStatus::Pending.is_pending());
        assert!(!RequestStatus::Completed.is_pending());
        assert!(!RequestStatus::Cancelled.is_pending());
    }
}
