//! # Batch Receivers
//!
//! Isolated per-batch custody for settled institutional withdrawals.
//!
//! When a primary-vault batch settles, the underlying owed to that batch's
//! redeemers is set aside in a [`BatchReceiver`] entry instead of staying
//! commingled with the vault. Each entry is bound to exactly one batch and
//! one authorizing gateway account at initialization and never reused, so a
//! claim against batch N can never drain funds reserved for batch M.
//!
//! The [`ReceiverRegistry`] is the keyed table holding these entries. The
//! settlement path initializes and funds them; the authorizing gateway is
//! the only party that may pull from them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{AssetId, BatchId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur against receiver custody entries.
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// No receiver entry exists for this batch.
    #[error("no receiver initialized for batch {0}")]
    ReceiverNotFound(BatchId),

    /// A receiver entry may only be initialized once.
    #[error("receiver for batch {0} already initialized")]
    AlreadyInitialized(BatchId),

    /// The pulling account is not the gateway this receiver was bound to.
    #[error("receiver for batch {batch} authorizes gateway {expected}, not {actual}")]
    GatewayMismatch {
        /// The batch whose receiver was addressed.
        batch: BatchId,
        /// The gateway account fixed at initialization.
        expected: String,
        /// The account that attempted the pull.
        actual: String,
    },

    /// The receiver was funded in a different asset than the pull names.
    #[error("receiver for batch {batch} holds {expected}, not {actual}")]
    AssetMismatch {
        /// The batch whose receiver was addressed.
        batch: BatchId,
        /// The asset fixed at initialization.
        expected: AssetId,
        /// The asset named by the pull.
        actual: AssetId,
    },

    /// Funding would overflow the receiver's running totals.
    #[error("funding overflow on receiver for batch {batch}: adding {amount}")]
    FundingOverflow {
        /// The batch whose receiver was being funded.
        batch: BatchId,
        /// The amount that could not be added.
        amount: u64,
    },

    /// Tried to pull more than the receiver still holds.
    #[error("insufficient receiver balance for batch {batch}: requested {requested}, available {available}")]
    InsufficientBalance {
        /// The batch whose receiver was addressed.
        batch: BatchId,
        /// The amount the gateway tried to pull.
        requested: u64,
        /// The amount still held.
        available: u64,
    },
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Custody entry for one settled batch's withdrawal funds.
///
/// `funded` only ever grows; `balance` is what remains claimable. Once the
/// last redeemer has pulled, `balance` sits at zero and the entry stays in
/// the table as an audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReceiver {
    /// The batch this entry custodies for. Fixed at initialization.
    pub batch: BatchId,
    /// The asset held. Fixed at initialization.
    pub asset: AssetId,
    /// The only account allowed to pull. Fixed at initialization.
    pub gateway: String,
    /// Cumulative settlement funding.
    pub funded: u64,
    /// Remaining claimable balance.
    pub balance: u64,
    /// When the entry was initialized.
    pub initialized_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The keyed table of per-batch custody entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverRegistry {
    receivers: HashMap<BatchId, BatchReceiver>,
}

impl ReceiverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes the custody entry for a batch, binding its gateway and
    /// asset permanently.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::AlreadyInitialized`] on a second call for
    /// the same batch.
    pub fn initialize(
        &mut self,
        batch: BatchId,
        asset: AssetId,
        gateway: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ReceiverError> {
        if self.receivers.contains_key(&batch) {
            return Err(ReceiverError::AlreadyInitialized(batch));
        }
        self.receivers.insert(
            batch,
            BatchReceiver {
                batch,
                asset,
                gateway: gateway.to_string(),
                funded: 0,
                balance: 0,
                initialized_at: now,
            },
        );
        Ok(())
    }

    /// Credits settlement funding to a batch's receiver.
    pub fn fund(&mut self, batch: &BatchId, amount: u64) -> Result<(), ReceiverError> {
        let receiver = self
            .receivers
            .get(batch)
            .ok_or(ReceiverError::ReceiverNotFound(*batch))?;
        let funded = receiver
            .funded
            .checked_add(amount)
            .ok_or(ReceiverError::FundingOverflow {
                batch: *batch,
                amount,
            })?;
        let balance = receiver
            .balance
            .checked_add(amount)
            .ok_or(ReceiverError::FundingOverflow {
                batch: *batch,
                amount,
            })?;
        if let Some(receiver) = self.receivers.get_mut(batch) {
            receiver.funded = funded;
            receiver.balance = balance;
        }
        Ok(())
    }

    /// Pulls assets out of a batch's receiver on behalf of its gateway.
    ///
    /// The pull is validated against the entry's fixed batch binding, its
    /// authorizing gateway, and its asset. Returns the remaining balance.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::GatewayMismatch`] when `gateway` is not the
    /// bound account, [`ReceiverError::AssetMismatch`] when `asset` differs
    /// from the funded asset, and [`ReceiverError::InsufficientBalance`]
    /// when the entry cannot cover `amount`.
    pub fn pull_assets(
        &mut self,
        batch: &BatchId,
        asset: &AssetId,
        gateway: &str,
        amount: u64,
    ) -> Result<u64, ReceiverError> {
        let receiver = self
            .receivers
            .get(batch)
            .ok_or(ReceiverError::ReceiverNotFound(*batch))?;
        if receiver.gateway != gateway {
            return Err(ReceiverError::GatewayMismatch {
                batch: *batch,
                expected: receiver.gateway.clone(),
                actual: gateway.to_string(),
            });
        }
        if receiver.asset != *asset {
            return Err(ReceiverError::AssetMismatch {
                batch: *batch,
                expected: receiver.asset,
                actual: *asset,
            });
        }
        let remaining = receiver
            .balance
            .checked_sub(amount)
            .ok_or(ReceiverError::InsufficientBalance {
                batch: *batch,
                requested: amount,
                available: receiver.balance,
            })?;
        if let Some(receiver) = self.receivers.get_mut(batch) {
            receiver.balance = remaining;
        }
        Ok(remaining)
    }

    /// Looks up a batch's receiver entry.
    pub fn get(&self, batch: &BatchId) -> Option<&BatchReceiver> {
        self.receivers.get(batch)
    }

    /// Whether a receiver has been initialized for this batch.
    pub fn contains(&self, batch: &BatchId) -> bool {
        self.receivers.contains_key(batch)
    }

    /// Sum of unclaimed balances across all receivers holding `asset`.
    ///
    /// This is the receiver side of the backing equation: issued supply
    /// equals vault baselines plus this figure, at every settled state.
    pub fn total_unclaimed(&self, asset: &AssetId) -> u64 {
        self.receivers
            .values()
            .filter(|r| r.asset == *asset)
            .fold(0u64, |acc, r| acc.saturating_add(r.balance))
    }

    /// Iterates over all entries, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &BatchReceiver> {
        self.receivers.values()
    }

    /// Number of initialized entries.
    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    /// Whether no entry has been initialized.
    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
