//! # Batch Ledger
//!
//! Tracks the lifecycle of settlement batches, one active batch per vault.
//!
//! A [`Batch`] is the unit of settlement: deposit and withdrawal intents
//! reported while it is `Open` accumulate into its tallies, closing it
//! freezes those tallies, and settlement execution marks it `Settled` --
//! optionally freezing a [`BatchPricing`] snapshot that staking claims
//! convert against.
//!
//! The [`BatchLedger`] enforces the ordering rules:
//!
//! - at most one `Open` batch per vault at any time;
//! - per-vault sequence numbers are assigned once and never reused;
//! - `Open -> Closed -> Settled` with no skips and no reopening;
//! - batches settle in sequence order, so the vault's baseline accounting
//!   always advances monotonically.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{AssetId, BatchId, VaultId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during batch lifecycle operations.
#[derive(Debug, Error)]
pub enum BatchError {
    /// No batch with this id exists in the ledger.
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    /// The vault already has an open batch; close it before opening another.
    #[error("vault {vault} already has open batch {batch}")]
    BatchAlreadyOpen {
        /// The vault that was asked to open a batch.
        vault: VaultId,
        /// The batch that is currently open for it.
        batch: BatchId,
    },

    /// The batch is not in a state that allows this operation.
    #[error("invalid batch transition: batch {batch} is {current}, expected {expected}")]
    InvalidState {
        /// The batch in question.
        batch: BatchId,
        /// Its current status.
        current: String,
        /// The status required for this operation.
        expected: String,
    },

    /// A batch can only settle after every earlier batch of its vault has.
    #[error("batch {batch} settles out of order: sequence {sequence}, expected {expected}")]
    SettlementOutOfOrder {
        /// The batch that was asked to settle.
        batch: BatchId,
        /// Its sequence number.
        sequence: u64,
        /// The sequence number that must settle next.
        expected: u64,
    },

    /// Adding this amount would overflow a batch tally.
    #[error("tally overflow on batch {batch}: adding {amount}")]
    TallyOverflow {
        /// The batch whose tally was being updated.
        batch: BatchId,
        /// The amount that could not be added.
        amount: u64,
    },

    /// Removing this amount would take a batch tally below zero. Every
    /// rescind must be backed by an earlier report against the same batch.
    #[error("tally underflow on batch {batch}: removing {amount}")]
    TallyUnderflow {
        /// The batch whose tally was being updated.
        batch: BatchId,
        /// The amount that could not be removed.
        amount: u64,
    },

    /// The vault has exhausted its sequence space. Practically unreachable.
    #[error("batch sequence exhausted for vault {0}")]
    SequenceExhausted(VaultId),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Accepting deposit and withdrawal intents.
    Open,
    /// Tallies frozen; a settlement proposal may target this batch.
    Closed,
    /// Settlement executed; claims against this batch are live. Terminal.
    Settled,
}

impl BatchStatus {
    /// Whether the batch still accepts flow reports (deposits and requests).
    pub fn accepts_flows(&self) -> bool {
        matches!(self, BatchStatus::Open)
    }

    /// Whether a settlement proposal may target a batch in this status.
    pub fn allows_settlement(&self) -> bool {
        matches!(self, BatchStatus::Closed)
    }

    /// Whether this is the terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Settled)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Open => write!(f, "Open"),
            BatchStatus::Closed => write!(f, "Closed"),
            BatchStatus::Settled => write!(f, "Settled"),
        }
    }
}

/// Share pricing frozen on a staking batch at settlement execution.
///
/// Every claim against the batch converts at this pair, so claim order
/// within a batch never changes anyone's rate. Both figures are captured
/// before the batch's own flows enter the pool: `total_assets` is the
/// settled pool value and `total_shares` the share supply at that instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPricing {
    /// Pool value (in the vault's denomination) at settlement.
    pub total_assets: u64,
    /// Share supply at settlement.
    pub total_shares: u64,
}

impl BatchPricing {
    /// Converts a staked amount into shares at the frozen price, rounding
    /// down. An empty pool (zero shares or zero assets) prices 1:1.
    ///
    /// Returns `None` if the result does not fit in a `u64`, which only
    /// happens with a degenerate frozen ratio.
    pub fn shares_for_assets(&self, amount: u64) -> Option<u64> {
        if self.total_shares == 0 || self.total_assets == 0 {
            return Some(amount);
        }
        let scaled = u128::from(amount) * u128::from(self.total_shares) / u128::from(self.total_assets);
        u64::try_from(scaled).ok()
    }

    /// Converts a share count into assets at the frozen price, rounding
    /// down. An empty pool prices 1:1.
    ///
    /// Returns `None` if the result does not fit in a `u64`.
    pub fn assets_for_shares(&self, shares: u64) -> Option<u64> {
        if self.total_shares == 0 {
            return Some(shares);
        }
        let scaled = u128::from(shares) * u128::from(self.total_assets) / u128::from(self.total_shares);
        u64::try_from(scaled).ok()
    }
}

/// A settlement batch.
///
/// Tally denomination follows the vault kind: primary batches count
/// underlying units in both tallies, staking batches count underlying
/// token units in `deposited` (stake inflow) and shares in `requested`
/// (unstake outflow), because the share count is only fixed at settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Content-derived identifier, unique across all vaults and time.
    pub id: BatchId,
    /// The vault this batch belongs to.
    pub vault: VaultId,
    /// The asset the vault settles in.
    pub asset: AssetId,
    /// Position in the vault's batch sequence, starting at 1.
    pub sequence: u64,
    /// Current lifecycle status.
    pub status: BatchStatus,
    /// Total inflow reported while the batch was open.
    pub deposited: u64,
    /// Total outflow intent reported while the batch was open.
    pub requested: u64,
    /// Share pricing frozen at settlement. Always `None` on primary batches.
    pub pricing: Option<BatchPricing>,
    /// When the batch was opened.
    pub opened_at: DateTime<Utc>,
    /// When the batch was closed, if it has been.
    pub closed_at: Option<DateTime<Utc>>,
    /// When the batch was settled, if it has been.
    pub settled_at: Option<DateTime<Utc>>,
}

impl Batch {
    fn ensure_status(&self, expected: BatchStatus) -> Result<(), BatchError> {
        if self.status != expected {
            return Err(BatchError::InvalidState {
                batch: self.id,
                current: self.status.to_string(),
                expected: expected.to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Per-vault batch sequencing and lifecycle enforcement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLedger {
    /// All batches ever opened, keyed by id. Never pruned.
    batches: HashMap<BatchId, Batch>,
    /// The currently open batch per vault, if any.
    open_by_vault: HashMap<VaultId, BatchId>,
    /// Next sequence number to assign per vault. Missing means 1.
    next_sequence: HashMap<VaultId, u64>,
    /// Highest settled sequence per vault. Missing means 0 (none settled).
    last_settled: HashMap<VaultId, u64>,
}

impl BatchLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the vault's next batch and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::BatchAlreadyOpen`] if the vault already has an
    /// open batch.
    pub fn open_batch(
        &mut self,
        vault: VaultId,
        asset: AssetId,
        now: DateTime<Utc>,
    ) -> Result<BatchId, BatchError> {
        if let Some(batch) = self.open_by_vault.get(&vault) {
            return Err(BatchError::BatchAlreadyOpen {
                vault,
                batch: *batch,
            });
        }
        let sequence = self.next_sequence.get(&vault).copied().unwrap_or(1);
        let next = sequence
            .checked_add(1)
            .ok_or(BatchError::SequenceExhausted(vault))?;

        let id = BatchId::derive(&vault, &asset, sequence);
        self.batches.insert(
            id,
            Batch {
                id,
                vault,
                asset,
                sequence,
                status: BatchStatus::Open,
                deposited: 0,
                requested: 0,
                pricing: None,
                opened_at: now,
                closed_at: None,
                settled_at: None,
            },
        );
        self.open_by_vault.insert(vault, id);
        self.next_sequence.insert(vault, next);
        Ok(id)
    }

    /// Closes an open batch, freezing its tallies.
    ///
    /// When `open_next` is set, the successor batch opens atomically so
    /// incoming requests always have a target; its id is returned.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::BatchNotFound`] for an unknown id and
    /// [`BatchError::InvalidState`] if the batch is not `Open`.
    pub fn close_batch(
        &mut self,
        batch: &BatchId,
        open_next: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchId>, BatchError> {
        let (vault, asset) = {
            let record = self.get(batch)?;
            record.ensure_status(BatchStatus::Open)?;
            (record.vault, record.asset)
        };
        if open_next {
            // Successor sequence must be assignable before anything mutates.
            let sequence = self.next_sequence.get(&vault).copied().unwrap_or(1);
            sequence
                .checked_add(1)
                .ok_or(BatchError::SequenceExhausted(vault))?;
        }

        let record = self
            .batches
            .get_mut(batch)
            .ok_or(BatchError::BatchNotFound(*batch))?;
        record.status = BatchStatus::Closed;
        record.closed_at = Some(now);
        self.open_by_vault.remove(&vault);

        if open_next {
            Ok(Some(self.open_batch(vault, asset, now)?))
        } else {
            Ok(None)
        }
    }

    /// Checks that a batch could settle right now, without mutating.
    ///
    /// Settlement execution runs this before any state changes so a late
    /// failure cannot leave a half-settled batch behind.
    pub fn ensure_settleable(&self, batch: &BatchId) -> Result<(), BatchError> {
        let record = self.get(batch)?;
        record.ensure_status(BatchStatus::Closed)?;
        let expected = self.last_settled.get(&record.vault).copied().unwrap_or(0) + 1;
        if record.sequence != expected {
            return Err(BatchError::SettlementOutOfOrder {
                batch: *batch,
                sequence: record.sequence,
                expected,
            });
        }
        Ok(())
    }

    /// Marks a closed batch as settled, recording frozen pricing when the
    /// settlement produced one.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidState`] unless the batch is `Closed`,
    /// and [`BatchError::SettlementOutOfOrder`] if an earlier batch of the
    /// same vault is still unsettled.
    pub fn settle(
        &mut self,
        batch: &BatchId,
        pricing: Option<BatchPricing>,
        now: DateTime<Utc>,
    ) -> Result<(), BatchError> {
        self.ensure_settleable(batch)?;
        let record = self
            .batches
            .get_mut(batch)
            .ok_or(BatchError::BatchNotFound(*batch))?;
        record.status = BatchStatus::Settled;
        record.pricing = pricing;
        record.settled_at = Some(now);
        let vault = record.vault;
        let sequence = record.sequence;
        self.last_settled.insert(vault, sequence);
        Ok(())
    }

    /// Adds a reported deposit to an open batch's inflow tally.
    pub fn record_deposit(&mut self, batch: &BatchId, amount: u64) -> Result<(), BatchError> {
        let record = self.get(batch)?;
        record.ensure_status(BatchStatus::Open)?;
        let tally = record
            .deposited
            .checked_add(amount)
            .ok_or(BatchError::TallyOverflow {
                batch: *batch,
                amount,
            })?;
        // Rechecked above; the id is known to exist.
        if let Some(record) = self.batches.get_mut(batch) {
            record.deposited = tally;
        }
        Ok(())
    }

    /// Adds a reported withdrawal intent to an open batch's outflow tally.
    pub fn record_request(&mut self, batch: &BatchId, amount: u64) -> Result<(), BatchError> {
        let record = self.get(batch)?;
        record.ensure_status(BatchStatus::Open)?;
        let tally = record
            .requested
            .checked_add(amount)
            .ok_or(BatchError::TallyOverflow {
                batch: *batch,
                amount,
            })?;
        if let Some(record) = self.batches.get_mut(batch) {
            record.requested = tally;
        }
        Ok(())
    }

    /// Removes a rescinded deposit from an open batch's inflow tally.
    /// Cancellation is foreclosed once the batch closes, so this only ever
    /// touches open batches.
    pub fn unrecord_deposit(&mut self, batch: &BatchId, amount: u64) -> Result<(), BatchError> {
        let record = self.get(batch)?;
        record.ensure_status(BatchStatus::Open)?;
        let tally = record
            .deposited
            .checked_sub(amount)
            .ok_or(BatchError::TallyUnderflow {
                batch: *batch,
                amount,
            })?;
        if let Some(record) = self.batches.get_mut(batch) {
            record.deposited = tally;
        }
        Ok(())
    }

    /// Removes a rescinded withdrawal intent from an open batch's outflow
    /// tally.
    pub fn unrecord_request(&mut self, batch: &BatchId, amount: u64) -> Result<(), BatchError> {
        let record = self.get(batch)?;
        record.ensure_status(BatchStatus::Open)?;
        let tally = record
            .requested
            .checked_sub(amount)
            .ok_or(BatchError::TallyUnderflow {
                batch: *batch,
                amount,
            })?;
        if let Some(record) = self.batches.get_mut(batch) {
            record.requested = tally;
        }
        Ok(())
    }

    /// Looks up a batch by id.
    pub fn get(&self, batch: &BatchId) -> Result<&Batch, BatchError> {
        self.batches
            .get(batch)
            .ok_or(BatchError::BatchNotFound(*batch))
    }

    /// The vault's currently open batch, if any.
    pub fn open_of(&self, vault: &VaultId) -> Option<&Batch> {
        self.open_by_vault.get(vault).and_then(|id| self.batches.get(id))
    }

    /// The id of the vault's currently open batch, if any.
    pub fn open_id_of(&self, vault: &VaultId) -> Option<BatchId> {
        self.open_by_vault.get(vault).copied()
    }

    /// Highest settled sequence number for a vault (0 if none settled).
    pub fn last_settled_sequence(&self, vault: &VaultId) -> u64 {
        self.last_settled.get(vault).copied().unwrap_or(0)
    }

    /// Iterates over every batch ever opened, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Batch> {
        self.batches.values()
    }

    /// Number of batches ever opened.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether no batch has ever been opened.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> VaultId {
        VaultId::derive("treasury-prime")
    }

    fn asset() -> AssetId {
        AssetId::derive("USDY")
    }

    fn ledger_with_open_batch() -> (BatchLedger, BatchId) {
        let mut ledger = BatchLedger::new();
        let batch = ledger.open_batch(vault(), asset(), Utc::now()).unwrap();
        (ledger, batch)
    }

    #[test]
    fn open_assigns_sequence_one() {
        let (ledger, batch) = ledger_with_open_batch();
        let record = ledger.get(&batch).unwrap();
        assert_eq!(record.sequence, 1);
        assert_eq!(record.status, BatchStatus::Open);
        assert_eq!(record.deposited, 0);
        assert_eq!(record.requested, 0);
        assert!(record.pricing.is_none());
    }

    #[test]
    fn second_open_rejected_while_one_is_open() {
        let (mut ledger, batch) = ledger_with_open_batch();
        let err = ledger.open_batch(vault(), asset(), Utc::now()).unwrap_err();
        match err {
            BatchError::BatchAlreadyOpen { batch: existing, .. } => {
                assert_eq!(existing, batch);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn close_freezes_and_optionally_opens_successor() {
        let (mut ledger, first) = ledger_with_open_batch();
        let next = ledger
            .close_batch(&first, true, Utc::now())
            .unwrap()
            .unwrap();

        let closed = ledger.get(&first).unwrap();
        assert_eq!(closed.status, BatchStatus::Closed);
        assert!(closed.closed_at.is_some());

        let successor = ledger.get(&next).unwrap();
        assert_eq!(successor.sequence, 2);
        assert_eq!(successor.status, BatchStatus::Open);
        assert_eq!(successor.asset, asset());
        assert_eq!(ledger.open_id_of(&vault()), Some(next));
    }

    #[test]
    fn close_without_successor_leaves_no_open_batch() {
        let (mut ledger, batch) = ledger_with_open_batch();
        let next = ledger.close_batch(&batch, false, Utc::now()).unwrap();
        assert!(next.is_none());
        assert!(ledger.open_id_of(&vault()).is_none());
    }

    #[test]
    fn close_is_not_repeatable() {
        let (mut ledger, batch) = ledger_with_open_batch();
        ledger.close_batch(&batch, false, Utc::now()).unwrap();
        let err = ledger.close_batch(&batch, false, Utc::now()).unwrap_err();
        assert!(matches!(err, BatchError::InvalidState { .. }));
    }

    #[test]
    fn tallies_accumulate_only_while_open() {
        let (mut ledger, batch) = ledger_with_open_batch();
        ledger.record_deposit(&batch, 1_000).unwrap();
        ledger.record_deposit(&batch, 250).unwrap();
        ledger.record_request(&batch, 400).unwrap();
        {
            let record = ledger.get(&batch).unwrap();
            assert_eq!(record.deposited, 1_250);
            assert_eq!(record.requested, 400);
        }

        ledger.close_batch(&batch, false, Utc::now()).unwrap();
        let err = ledger.record_deposit(&batch, 1).unwrap_err();
        assert!(matches!(err, BatchError::InvalidState { .. }));
        let err = ledger.record_request(&batch, 1).unwrap_err();
        assert!(matches!(err, BatchError::InvalidState { .. }));
    }

    #[test]
    fn tally_overflow_leaves_tally_unchanged() {
        let (mut ledger, batch) = ledger_with_open_batch();
        ledger.record_deposit(&batch, u64::MAX - 10).unwrap();
        let err = ledger.record_deposit(&batch, 11).unwrap_err();
        assert!(matches!(err, BatchError::TallyOverflow { amount: 11, .. }));
        assert_eq!(ledger.get(&batch).unwrap().deposited, u64::MAX - 10);
    }

    #[test]
    fn rescinds_reverse_tallies_while_open() {
        let (mut ledger, batch) = ledger_with_open_batch();
        ledger.record_deposit(&batch, 1_000).unwrap();
        ledger.record_request(&batch, 400).unwrap();

        ledger.unrecord_deposit(&batch, 300).unwrap();
        ledger.unrecord_request(&batch, 400).unwrap();
        {
            let record = ledger.get(&batch).unwrap();
            assert_eq!(record.deposited, 700);
            assert_eq!(record.requested, 0);
        }

        let err = ledger.unrecord_request(&batch, 1).unwrap_err();
        assert!(matches!(err, BatchError::TallyUnderflow { amount: 1, .. }));

        // Closing forecloses rescinds along with reports.
        ledger.close_batch(&batch, false, Utc::now()).unwrap();
        let err = ledger.unrecord_deposit(&batch, 1).unwrap_err();
        assert!(matches!(err, BatchError::InvalidState { .. }));
    }

    #[test]
    fn settle_requires_closed() {
        let (mut ledger, batch) = ledger_with_open_batch();
        let err = ledger.settle(&batch, None, Utc::now()).unwrap_err();
        assert!(matches!(err, BatchError::InvalidState { .. }));

        ledger.close_batch(&batch, false, Utc::now()).unwrap();
        ledger.settle(&batch, None, Utc::now()).unwrap();
        let record = ledger.get(&batch).unwrap();
        assert_eq!(record.status, BatchStatus::Settled);
        assert!(record.settled_at.is_some());
        assert_eq!(ledger.last_settled_sequence(&vault()), 1);
    }

    #[test]
    fn settle_is_not_repeatable() {
        let (mut ledger, batch) = ledger_with_open_batch();
        ledger.close_batch(&batch, false, Utc::now()).unwrap();
        ledger.settle(&batch, None, Utc::now()).unwrap();
        let err = ledger.settle(&batch, None, Utc::now()).unwrap_err();
        match err {
            BatchError::InvalidState { current, expected, .. } => {
                assert_eq!(current, "Settled");
                assert_eq!(expected, "Closed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn settlement_follows_sequence_order() {
        let (mut ledger, first) = ledger_with_open_batch();
        let second = ledger
            .close_batch(&first, true, Utc::now())
            .unwrap()
            .unwrap();
        ledger.close_batch(&second, false, Utc::now()).unwrap();

        // Both batches are closed; the later one may not settle first.
        let err = ledger.settle(&second, None, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            BatchError::SettlementOutOfOrder {
                sequence: 2,
                expected: 1,
                ..
            }
        ));

        ledger.settle(&first, None, Utc::now()).unwrap();
        ledger.settle(&second, None, Utc::now()).unwrap();
        assert_eq!(ledger.last_settled_sequence(&vault()), 2);
    }

    #[test]
    fn settle_records_pricing() {
        let (mut ledger, batch) = ledger_with_open_batch();
        ledger.close_batch(&batch, false, Utc::now()).unwrap();
        let pricing = BatchPricing {
            total_assets: 1_050_000_000,
            total_shares: 1_000_000_000,
        };
        ledger.settle(&batch, Some(pricing), Utc::now()).unwrap();
        assert_eq!(ledger.get(&batch).unwrap().pricing, Some(pricing));
    }

    #[test]
    fn batch_ids_are_distinct_across_sequences() {
        let (mut ledger, first) = ledger_with_open_batch();
        let second = ledger
            .close_batch(&first, true, Utc::now())
            .unwrap()
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn pricing_converts_with_floor_rounding() {
        // Pool of 1,050 assets backing 1,000 shares, six-decimal units.
        let pricing = BatchPricing {
            total_assets: 1_050_000_000,
            total_shares: 1_000_000_000,
        };
        // Staking 100 units buys 100 / 1.05 = 95.238095... shares.
        assert_eq!(pricing.shares_for_assets(100_000_000), Some(95_238_095));
        // Those shares convert back to 99.999999 units: floor dust only,
        // never a gain.
        assert_eq!(pricing.assets_for_shares(95_238_095), Some(99_999_999));
    }

    #[test]
    fn empty_pool_prices_one_to_one() {
        let pricing = BatchPricing {
            total_assets: 0,
            total_shares: 0,
        };
        assert_eq!(pricing.shares_for_assets(500), Some(500));
        assert_eq!(pricing.assets_for_shares(500), Some(500));
    }

    #[test]
    fn batch_serde_round_trip() {
        let (ledger, batch) = ledger_with_open_batch();
        let record = ledger.get(&batch).unwrap();
        let json = serde_json::to_string(record).unwrap();
        let back: Batch = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, record.id);
        assert_eq!(back.sequence, record.sequence);
        assert_eq!(back.status, record.status);
    }
}
