//! Yield-adapter interface and the in-memory reference implementation.
//!
//! An adapter is where a vault's underlying actually sits while it earns:
//! a money-market desk, a treasury ladder, a lending pool. The core does
//! not care which. It pushes principal in after minting, recalls it to pay
//! settled withdrawals, and at proposal time cross-checks the relayer's
//! reported total against what the adapters themselves claim to hold.
//!
//! Adapters are attached per vault and injected as capabilities, like the
//! authorizer. The core never constructs one.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

use crate::ids::{AssetId, VaultId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors an adapter can report.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Redeeming more than the position holds.
    #[error("adapter position for vault {vault} holds {available} of {asset}, cannot redeem {requested}")]
    InsufficientAssets {
        /// The vault whose position was addressed.
        vault: VaultId,
        /// The asset requested.
        asset: AssetId,
        /// What the position holds.
        available: u64,
        /// What the caller asked for.
        requested: u64,
    },

    /// Depositing past the representable range.
    #[error("adapter position overflow for vault {vault}: depositing {amount} of {asset}")]
    PositionOverflow {
        /// The vault whose position was addressed.
        vault: VaultId,
        /// The asset deposited.
        asset: AssetId,
        /// The deposit that overflowed.
        amount: u64,
    },
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Capability interface over an external yield venue.
///
/// Methods take `&self`: implementations are shared behind `Arc` and
/// manage their own synchronization. `total_assets` is the live figure the
/// settlement cross-check reads; `last_total_assets` is the figure as of
/// the most recent flow through the adapter, so the spread between the two
/// is the accrual since.
pub trait Adapter: Send + Sync {
    /// Pushes `amount` of `asset` into the venue on behalf of a vault.
    /// Returns the position's new total.
    fn deposit(
        &self,
        asset: &AssetId,
        amount: u64,
        on_behalf_of: &VaultId,
    ) -> Result<u64, AdapterError>;

    /// Recalls `amount` of `asset` from the venue on behalf of a vault.
    /// Returns the position's remaining total.
    fn redeem(
        &self,
        asset: &AssetId,
        amount: u64,
        on_behalf_of: &VaultId,
    ) -> Result<u64, AdapterError>;

    /// The venue's current holding for the vault, accrual included.
    fn total_assets(&self, vault: &VaultId, asset: &AssetId) -> u64;

    /// The holding as of the last deposit or redeem through this adapter.
    fn last_total_assets(&self, vault: &VaultId, asset: &AssetId) -> u64;
}

// ---------------------------------------------------------------------------
// StaticAdapter
// ---------------------------------------------------------------------------

/// A vault's position inside a [`StaticAdapter`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Position {
    /// Live holding, simulated accrual included.
    total: u64,
    /// Holding as of the last flow through the adapter.
    last: u64,
}

/// In-memory venue used by tests, demos, and the keeper's simulation mode.
///
/// Holdings sit in a table keyed by vault and asset. Accrual does not
/// happen on its own; drive it with [`StaticAdapter::set_total_assets`],
/// which moves the live figure while leaving `last_total_assets` behind,
/// exactly the shape a real venue's report drift takes.
#[derive(Debug, Default)]
pub struct StaticAdapter {
    positions: RwLock<HashMap<(VaultId, AssetId), Position>>,
}

impl StaticAdapter {
    /// Creates an adapter holding nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the live holding for a position, simulating venue-side
    /// accrual (or loss). `last_total_assets` keeps its old figure.
    pub fn set_total_assets(&self, vault: &VaultId, asset: &AssetId, total: u64) {
        let mut positions = self.positions.write();
        positions.entry((*vault, *asset)).or_default().total = total;
    }

    /// Number of non-empty positions across all vaults.
    pub fn position_count(&self) -> usize {
        self.positions.read().len()
    }
}

impl Adapter for StaticAdapter {
    fn deposit(
        &self,
        asset: &AssetId,
        amount: u64,
        on_behalf_of: &VaultId,
    ) -> Result<u64, AdapterError> {
        let mut positions = self.positions.write();
        let position = positions.entry((*on_behalf_of, *asset)).or_default();
        let total = position
            .total
            .checked_add(amount)
            .ok_or(AdapterError::PositionOverflow {
                vault: *on_behalf_of,
                asset: *asset,
                amount,
            })?;
        position.total = total;
        position.last = total;
        Ok(total)
    }

    fn redeem(
        &self,
        asset: &AssetId,
        amount: u64,
        on_behalf_of: &VaultId,
    ) -> Result<u64, AdapterError> {
        let mut positions = self.positions.write();
        let position = positions.entry((*on_behalf_of, *asset)).or_default();
        let total = position
            .total
            .checked_sub(amount)
            .ok_or(AdapterError::InsufficientAssets {
                vault: *on_behalf_of,
                asset: *asset,
                available: position.total,
                requested: amount,
            })?;
        position.total = total;
        position.last = total;
        Ok(total)
    }

    fn total_assets(&self, vault: &VaultId, asset: &AssetId) -> u64 {
        self.positions
            .read()
            .get(&(*vault, *asset))
            .map(|position| position.total)
            .unwrap_or(0)
    }

    fn last_total_assets(&self, vault: &VaultId, asset: &AssetId) -> u64 {
        self.positions
            .read()
            .get(&(*vault, *asset))
            .map(|position| position.last)
            .unwrap_or(0)
    }
}
