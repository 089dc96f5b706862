//! # Virtual Balance Book
//!
//! In-memory double bookkeeping for flows that have been *reported* but not
//! yet *settled*. Nothing in this file moves tokens; the book records what
//! gateways claim happened so that settlement can reconcile those claims
//! against custodian-reported totals.
//!
//! Three ledgers live here, all keyed by vault:
//!
//! - **Entries** (per asset): `{ deposited, requested }` -- gross inflow and
//!   withdrawal intent reported since the flows were last settled.
//! - **Baselines** (per asset): the last known total assets under custody.
//!   Deposits credit it immediately (principal is not yield); settlement
//!   rebases it to the reported total net of withdrawals.
//! - **Share flows** (per staking vault): stake inflow in underlying token
//!   units and unstake outflow in shares. The two sides use different units
//!   because the share count is only fixed at settlement.
//!
//! Settlement deducts the *settled batch's* tallies from the live figures
//! rather than zeroing them, so flows attached to a successor batch opened
//! during a cooldown stay pending.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{AssetId, VaultId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during virtual book operations.
#[derive(Debug, Error)]
pub enum BalanceError {
    /// Arithmetic overflow during a credit operation.
    ///
    /// If you're hitting this, someone is trying to report more than
    /// 18.4 quintillion units of flow. That's either a bug or an attack.
    #[error("virtual flow overflow: current {current}, credit {credit} (vault {vault}, asset {asset})")]
    Overflow {
        /// The vault whose entry was being credited.
        vault: VaultId,
        /// The asset of the entry.
        asset: AssetId,
        /// The figure before the failed credit.
        current: u64,
        /// The amount that caused the overflow.
        credit: u64,
    },

    /// The vault's baseline cannot cover the requested movement.
    #[error("insufficient virtual balance: available {available}, requested {requested} (vault {vault}, asset {asset})")]
    InsufficientVirtualBalance {
        /// The vault being debited.
        vault: VaultId,
        /// The asset of the baseline.
        asset: AssetId,
        /// The baseline currently held.
        available: u64,
        /// The amount that was requested.
        requested: u64,
    },

    /// A settled batch's tallies exceed the live flow figures. The batch
    /// ledger and the book have diverged; this cannot happen through the
    /// router's own operations.
    #[error("settled tallies exceed recorded virtual flows (vault {vault}, asset {asset})")]
    FlowDrift {
        /// The vault whose entry was being settled.
        vault: VaultId,
        /// The asset of the entry.
        asset: AssetId,
    },

    /// Arithmetic overflow on a staking vault's share-flow entry.
    #[error("share flow overflow: current {current}, credit {credit} (vault {vault})")]
    ShareOverflow {
        /// The staking vault whose flow was being credited.
        vault: VaultId,
        /// The figure before the failed credit.
        current: u64,
        /// The amount that caused the overflow.
        credit: u64,
    },

    /// A settled batch's share tallies exceed the live share flows.
    #[error("settled share tallies exceed recorded share flows (vault {vault})")]
    ShareDrift {
        /// The staking vault whose flow was being settled.
        vault: VaultId,
    },
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Unsettled gross flow for one (vault, asset) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualBalanceEntry {
    /// Inflow reported since the last settlement of these flows.
    pub deposited: u64,
    /// Withdrawal intent reported since the last settlement.
    pub requested: u64,
}

impl VirtualBalanceEntry {
    /// Whether both sides are zero.
    pub fn is_zero(&self) -> bool {
        self.deposited == 0 && self.requested == 0
    }
}

/// Unsettled retail flow for one staking vault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareFlowEntry {
    /// Stake inflow in underlying token units.
    pub stake_inflow: u64,
    /// Unstake outflow in shares.
    pub unstake_shares: u64,
}

impl ShareFlowEntry {
    /// Whether both sides are zero.
    pub fn is_zero(&self) -> bool {
        self.stake_inflow == 0 && self.unstake_shares == 0
    }
}

// ---------------------------------------------------------------------------
// VirtualBook
// ---------------------------------------------------------------------------

/// The router's complete set of virtual ledgers.
///
/// Not thread-safe by itself; the engine serializes access through its
/// single write lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualBook {
    /// Unsettled flow entries, vault -> asset -> entry.
    entries: HashMap<VaultId, HashMap<AssetId, VirtualBalanceEntry>>,
    /// Last known totals under custody, vault -> asset -> amount.
    baselines: HashMap<VaultId, HashMap<AssetId, u64>>,
    /// Retail flow entries per staking vault.
    share_flows: HashMap<VaultId, ShareFlowEntry>,
}

impl VirtualBook {
    /// Creates an empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current flow entry for a (vault, asset) pair. Zero if the pair
    /// has never seen flow.
    pub fn entry(&self, vault: &VaultId, asset: &AssetId) -> VirtualBalanceEntry {
        self.entries
            .get(vault)
            .and_then(|per_asset| per_asset.get(asset))
            .copied()
            .unwrap_or_default()
    }

    /// Credits reported inflow. Returns the new deposited figure.
    pub fn credit_deposited(
        &mut self,
        vault: &VaultId,
        asset: &AssetId,
        amount: u64,
    ) -> Result<u64, BalanceError> {
        let entry = self
            .entries
            .entry(*vault)
            .or_default()
            .entry(*asset)
            .or_default();
        let new_amount = entry
            .deposited
            .checked_add(amount)
            .ok_or(BalanceError::Overflow {
                vault: *vault,
                asset: *asset,
                current: entry.deposited,
                credit: amount,
            })?;
        entry.deposited = new_amount;
        Ok(new_amount)
    }

    /// Credits reported withdrawal intent. Returns the new requested figure.
    pub fn credit_requested(
        &mut self,
        vault: &VaultId,
        asset: &AssetId,
        amount: u64,
    ) -> Result<u64, BalanceError> {
        let entry = self
            .entries
            .entry(*vault)
            .or_default()
            .entry(*asset)
            .or_default();
        let new_amount = entry
            .requested
            .checked_add(amount)
            .ok_or(BalanceError::Overflow {
                vault: *vault,
                asset: *asset,
                current: entry.requested,
                credit: amount,
            })?;
        entry.requested = new_amount;
        Ok(new_amount)
    }

    /// Rescinds withdrawal intent. Gateways call this when a request is
    /// cancelled while its batch is still open. Returns the new requested
    /// figure.
    ///
    /// # Errors
    ///
    /// Returns [`BalanceError::FlowDrift`] if the amount exceeds the
    /// recorded intent; every rescind must be backed by an earlier report.
    pub fn debit_requested(
        &mut self,
        vault: &VaultId,
        asset: &AssetId,
        amount: u64,
    ) -> Result<u64, BalanceError> {
        let current = self.entry(vault, asset);
        let new_amount = current
            .requested
            .checked_sub(amount)
            .ok_or(BalanceError::FlowDrift {
                vault: *vault,
                asset: *asset,
            })?;
        let entry = self
            .entries
            .entry(*vault)
            .or_default()
            .entry(*asset)
            .or_default();
        entry.requested = new_amount;
        Ok(new_amount)
    }

    /// Deducts a settled batch's tallies from the live entry.
    ///
    /// # Errors
    ///
    /// Returns [`BalanceError::FlowDrift`] if either tally exceeds the live
    /// figure -- an internal inconsistency, not a user error.
    pub fn settle_flows(
        &mut self,
        vault: &VaultId,
        asset: &AssetId,
        deposited: u64,
        requested: u64,
    ) -> Result<(), BalanceError> {
        let current = self.entry(vault, asset);
        let new_deposited = current
            .deposited
            .checked_sub(deposited)
            .ok_or(BalanceError::FlowDrift {
                vault: *vault,
                asset: *asset,
            })?;
        let new_requested = current
            .requested
            .checked_sub(requested)
            .ok_or(BalanceError::FlowDrift {
                vault: *vault,
                asset: *asset,
            })?;

        let entry = self
            .entries
            .entry(*vault)
            .or_default()
            .entry(*asset)
            .or_default();
        entry.deposited = new_deposited;
        entry.requested = new_requested;
        Ok(())
    }

    /// The last known total under custody for a (vault, asset) pair.
    pub fn baseline(&self, vault: &VaultId, asset: &AssetId) -> u64 {
        self.baselines
            .get(vault)
            .and_then(|per_asset| per_asset.get(asset))
            .copied()
            .unwrap_or(0)
    }

    /// Credits the baseline (principal entering custody). Returns the new
    /// baseline.
    pub fn credit_baseline(
        &mut self,
        vault: &VaultId,
        asset: &AssetId,
        amount: u64,
    ) -> Result<u64, BalanceError> {
        let slot = self
            .baselines
            .entry(*vault)
            .or_default()
            .entry(*asset)
            .or_default();
        let new_amount = (*slot)
            .checked_add(amount)
            .ok_or(BalanceError::Overflow {
                vault: *vault,
                asset: *asset,
                current: *slot,
                credit: amount,
            })?;
        *slot = new_amount;
        Ok(new_amount)
    }

    /// Debits the baseline (custody claim leaving the vault). Returns the
    /// new baseline.
    ///
    /// # Errors
    ///
    /// Returns [`BalanceError::InsufficientVirtualBalance`] if the baseline
    /// cannot cover the debit.
    pub fn debit_baseline(
        &mut self,
        vault: &VaultId,
        asset: &AssetId,
        amount: u64,
    ) -> Result<u64, BalanceError> {
        let available = self.baseline(vault, asset);
        if available < amount {
            return Err(BalanceError::InsufficientVirtualBalance {
                vault: *vault,
                asset: *asset,
                available,
                requested: amount,
            });
        }
        let slot = self
            .baselines
            .entry(*vault)
            .or_default()
            .entry(*asset)
            .or_default();
        *slot = available - amount;
        Ok(*slot)
    }

    /// Replaces the baseline outright. Settlement uses this after deriving
    /// the rebased figure.
    pub fn rebase(&mut self, vault: &VaultId, asset: &AssetId, new_baseline: u64) {
        self.baselines
            .entry(*vault)
            .or_default()
            .insert(*asset, new_baseline);
    }

    /// The current share-flow entry for a staking vault.
    pub fn share_flow(&self, vault: &VaultId) -> ShareFlowEntry {
        self.share_flows.get(vault).copied().unwrap_or_default()
    }

    /// Credits stake inflow (underlying token units). Returns the new total.
    pub fn credit_stake_inflow(&mut self, vault: &VaultId, amount: u64) -> Result<u64, BalanceError> {
        let entry = self.share_flows.entry(*vault).or_default();
        let new_amount = entry
            .stake_inflow
            .checked_add(amount)
            .ok_or(BalanceError::ShareOverflow {
                vault: *vault,
                current: entry.stake_inflow,
                credit: amount,
            })?;
        entry.stake_inflow = new_amount;
        Ok(new_amount)
    }

    /// Credits unstake outflow (shares). Returns the new total.
    pub fn credit_unstake_shares(&mut self, vault: &VaultId, shares: u64) -> Result<u64, BalanceError> {
        let entry = self.share_flows.entry(*vault).or_default();
        let new_amount = entry
            .unstake_shares
            .checked_add(shares)
            .ok_or(BalanceError::ShareOverflow {
                vault: *vault,
                current: entry.unstake_shares,
                credit: shares,
            })?;
        entry.unstake_shares = new_amount;
        Ok(new_amount)
    }

    /// Rescinds stake inflow after a cancelled stake request. Returns the
    /// new inflow figure.
    pub fn debit_stake_inflow(&mut self, vault: &VaultId, amount: u64) -> Result<u64, BalanceError> {
        let current = self.share_flow(vault);
        let new_amount = current
            .stake_inflow
            .checked_sub(amount)
            .ok_or(BalanceError::ShareDrift { vault: *vault })?;
        self.share_flows.entry(*vault).or_default().stake_inflow = new_amount;
        Ok(new_amount)
    }

    /// Rescinds unstake outflow after a cancelled unstake request. Returns
    /// the new outflow figure.
    pub fn debit_unstake_shares(
        &mut self,
        vault: &VaultId,
        shares: u64,
    ) -> Result<u64, BalanceError> {
        let current = self.share_flow(vault);
        let new_amount = current
            .unstake_shares
            .checked_sub(shares)
            .ok_or(BalanceError::ShareDrift { vault: *vault })?;
        self.share_flows.entry(*vault).or_default().unstake_shares = new_amount;
        Ok(new_amount)
    }

    /// Deducts a settled staking batch's tallies from the live share flow.
    pub fn settle_share_flow(
        &mut self,
        vault: &VaultId,
        stake_inflow: u64,
        unstake_shares: u64,
    ) -> Result<(), BalanceError> {
        let current = self.share_flow(vault);
        let new_inflow = current
            .stake_inflow
            .checked_sub(stake_inflow)
            .ok_or(BalanceError::ShareDrift { vault: *vault })?;
        let new_unstake = current
            .unstake_shares
            .checked_sub(unstake_shares)
            .ok_or(BalanceError::ShareDrift { vault: *vault })?;
        let entry = self.share_flows.entry(*vault).or_default();
        entry.stake_inflow = new_inflow;
        entry.unstake_shares = new_unstake;
        Ok(())
    }

    /// All flow entries for one vault, as `(asset, entry)` pairs.
    pub fn entries_of(&self, vault: &VaultId) -> Vec<(AssetId, VirtualBalanceEntry)> {
        self.entries
            .get(vault)
            .map(|per_asset| per_asset.iter().map(|(a, e)| (*a, *e)).collect())
            .unwrap_or_default()
    }

    /// Sum of all baselines held for one asset across vaults.
    ///
    /// This is the vault side of the backing equation.
    pub fn total_baseline(&self, asset: &AssetId) -> u64 {
        self.baselines
            .values()
            .filter_map(|per_asset| per_asset.get(asset))
            .fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// Aggregate unsettled flow across the whole book, as
    /// `(deposited, requested)`. Used by operational metrics.
    pub fn totals(&self) -> (u64, u64) {
        self.entries
            .values()
            .flat_map(|per_asset| per_asset.values())
            .fold((0u64, 0u64), |(d, r), e| {
                (d.saturating_add(e.deposited), r.saturating_add(e.requested))
            })
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

    #[test]
    fn fresh_pair_reads_zero() {
        let book = VirtualBook::new();
        assert!(book.entry(&vault(), &asset()).is_zero());
        assert_eq!(book.baseline(&vault(), &asset()), 0);
        assert!(book.share_flow(&vault()).is_zero());
    }

    #[test]
    fn credits_accumulate_per_side() {
        let mut book = VirtualBook::new();
        book.credit_deposited(&vault(), &asset(), 1_000).unwrap();
        book.credit_deposited(&vault(), &asset(), 250).unwrap();
        book.credit_requested(&vault(), &asset(), 400).unwrap();

        let entry = book.entry(&vault(), &asset());
        assert_eq!(entry.deposited, 1_250);
        assert_eq!(entry.requested, 400);
    }

    #[test]
    fn credit_overflow_rejected() {
        let mut book = VirtualBook::new();
        book.credit_deposited(&vault(), &asset(), u64::MAX).unwrap();
        let err = book.credit_deposited(&vault(), &asset(), 1).unwrap_err();
        assert!(matches!(err, BalanceError::Overflow { credit: 1, .. }));
        assert_eq!(book.entry(&vault(), &asset()).deposited, u64::MAX);
    }

    #[test]
    fn settling_deducts_exact_tallies() {
        let mut book = VirtualBook::new();
        book.credit_deposited(&vault(), &asset(), 1_000).unwrap();
        book.credit_requested(&vault(), &asset(), 400).unwrap();
        // A successor batch has already collected more flow.
        book.credit_deposited(&vault(), &asset(), 77).unwrap();

        book.settle_flows(&vault(), &asset(), 1_000, 400).unwrap();
        let entry = book.entry(&vault(), &asset());
        assert_eq!(entry.deposited, 77);
        assert_eq!(entry.requested, 0);
    }

    #[test]
    fn settling_more_than_recorded_is_drift() {
        let mut book = VirtualBook::new();
        book.credit_deposited(&vault(), &asset(), 100).unwrap();
        let err = book.settle_flows(&vault(), &asset(), 101, 0).unwrap_err();
        assert!(matches!(err, BalanceError::FlowDrift { .. }));
        // Nothing moved.
        assert_eq!(book.entry(&vault(), &asset()).deposited, 100);
    }

    #[test]
    fn rescinds_must_be_backed_by_reports() {
        let mut book = VirtualBook::new();
        book.credit_requested(&vault(), &asset(), 400).unwrap();
        assert_eq!(book.debit_requested(&vault(), &asset(), 150).unwrap(), 250);
        let err = book.debit_requested(&vault(), &asset(), 251).unwrap_err();
        assert!(matches!(err, BalanceError::FlowDrift { .. }));
        assert_eq!(book.entry(&vault(), &asset()).requested, 250);

        book.credit_stake_inflow(&vault(), 100).unwrap();
        book.credit_unstake_shares(&vault(), 60).unwrap();
        assert_eq!(book.debit_stake_inflow(&vault(), 100).unwrap(), 0);
        assert_eq!(book.debit_unstake_shares(&vault(), 10).unwrap(), 50);
        let err = book.debit_stake_inflow(&vault(), 1).unwrap_err();
        assert!(matches!(err, BalanceError::ShareDrift { .. }));
    }

    #[test]
    fn baseline_credit_debit_rebase() {
        let mut book = VirtualBook::new();
        book.credit_baseline(&vault(), &asset(), 1_000).unwrap();
        assert_eq!(book.baseline(&vault(), &asset()), 1_000);

        let remaining = book.debit_baseline(&vault(), &asset(), 300).unwrap();
        assert_eq!(remaining, 700);

        book.rebase(&vault(), &asset(), 600);
        assert_eq!(book.baseline(&vault(), &asset()), 600);
    }

    #[test]
    fn baseline_debit_cannot_exceed_available() {
        let mut book = VirtualBook::new();
        book.credit_baseline(&vault(), &asset(), 500).unwrap();
        let err = book.debit_baseline(&vault(), &asset(), 501).unwrap_err();
        assert!(matches!(
            err,
            BalanceError::InsufficientVirtualBalance {
                available: 500,
                requested: 501,
                ..
            }
        ));
        assert_eq!(book.baseline(&vault(), &asset()), 500);
    }

    #[test]
    fn share_flows_track_both_units() {
        let mut book = VirtualBook::new();
        book.credit_stake_inflow(&vault(), 100_000_000).unwrap();
        book.credit_unstake_shares(&vault(), 40_000_000).unwrap();

        let flow = book.share_flow(&vault());
        assert_eq!(flow.stake_inflow, 100_000_000);
        assert_eq!(flow.unstake_shares, 40_000_000);

        book.settle_share_flow(&vault(), 100_000_000, 40_000_000).unwrap();
        assert!(book.share_flow(&vault()).is_zero());
    }

    #[test]
    fn share_settle_drift_rejected() {
        let mut book = VirtualBook::new();
        book.credit_stake_inflow(&vault(), 10).unwrap();
        let err = book.settle_share_flow(&vault(), 11, 0).unwrap_err();
        assert!(matches!(err, BalanceError::ShareDrift { .. }));
    }

    #[test]
    fn totals_aggregate_across_vaults_and_assets() {
        let mut book = VirtualBook::new();
        let other_vault = VaultId::derive("bills-prime");
        let other_asset = AssetId::derive("TBLL");

        book.credit_deposited(&vault(), &asset(), 1_000).unwrap();
        book.credit_requested(&vault(), &asset(), 100).unwrap();
        book.credit_deposited(&other_vault, &other_asset, 500).unwrap();

        assert_eq!(book.totals(), (1_500, 100));
    }

    #[test]
    fn total_baseline_sums_one_asset_only() {
        let mut book = VirtualBook::new();
        let other_vault = VaultId::derive("bills-prime");
        let other_asset = AssetId::derive("TBLL");

        book.credit_baseline(&vault(), &asset(), 600).unwrap();
        book.credit_baseline(&other_vault, &asset(), 150).unwrap();
        book.credit_baseline(&other_vault, &other_asset, 999).unwrap();

        assert_eq!(book.total_baseline(&asset()), 750);
        assert_eq!(book.total_baseline(&other_asset), 999);
    }

    #[test]
    fn book_serde_round_trip() {
        let mut book = VirtualBook::new();
        book.credit_deposited(&vault(), &asset(), 42).unwrap();
        book.credit_baseline(&vault(), &asset(), 42).unwrap();
        book.credit_stake_inflow(&vault(), 7).unwrap();

        let json = serde_json::to_string(&book).expect("serialize");
        let back: VirtualBook = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.entry(&vault(), &asset()).deposited, 42);
        assert_eq!(back.baseline(&vault(), &asset()), 42);
        assert_eq!(back.share_flow(&vault()).stake_inflow, 7);
    }
}
