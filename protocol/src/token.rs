//! # Issued-Token Ledger
//!
//! Supply and balance accounting for the protocol-native receipt tokens.
//! Each registered asset has exactly one issued token, so supplies are
//! keyed by [`AssetId`] directly; there is no separate token id to drift
//! out of sync with the asset registry.
//!
//! The ledger is deliberately minimal: mint, burn, and internal moves with
//! checked arithmetic. Allowances, approvals, and the rest of the ERC20
//! surface belong to an external token contract; the settlement core only
//! needs supply to be exact.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::ids::AssetId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from issued-token operations.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Minting would overflow the u64 supply.
    #[error("supply overflow: minting {amount} would exceed u64::MAX")]
    SupplyOverflow {
        /// The amount that was attempted.
        amount: u64,
    },

    /// An account balance would overflow u64.
    #[error("balance overflow for {account}: adding {amount}")]
    BalanceOverflow {
        /// The receiving account.
        account: String,
        /// The amount that was attempted.
        amount: u64,
    },

    /// The account cannot cover the debit.
    #[error("insufficient balance for {account}: has {balance}, needs {amount}")]
    InsufficientBalance {
        /// The debited account.
        account: String,
        /// Its current balance.
        balance: u64,
        /// The amount required.
        amount: u64,
    },
}

// ---------------------------------------------------------------------------
// TokenLedger
// ---------------------------------------------------------------------------

/// Per-asset supply ledger for the issued receipt tokens.
///
/// Entries are created lazily on first mint; asset-existence policing is
/// the registry's job at the call boundary, not this ledger's.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLedger {
    /// Total issued supply per asset.
    supplies: HashMap<AssetId, u64>,
    /// Per-asset, per-account balances.
    balances: HashMap<AssetId, HashMap<String, u64>>,
}

impl TokenLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints `amount` to `to`, increasing total supply by exactly `amount`.
    pub fn mint(&mut self, asset: AssetId, to: &str, amount: u64) -> Result<(), TokenError> {
        let new_supply = self
            .total_supply(&asset)
            .checked_add(amount)
            .ok_or(TokenError::SupplyOverflow { amount })?;
        let new_balance = self
            .balance_of(&asset, to)
            .checked_add(amount)
            .ok_or_else(|| TokenError::BalanceOverflow {
                account: to.to_string(),
                amount,
            })?;

        self.supplies.insert(asset, new_supply);
        self.balances
            .entry(asset)
            .or_default()
            .insert(to.to_string(), new_balance);
        Ok(())
    }

    /// Burns `amount` from `from`, decreasing total supply by exactly
    /// `amount`.
    pub fn burn(&mut self, asset: AssetId, from: &str, amount: u64) -> Result<(), TokenError> {
        let balance = self.balance_of(&asset, from);
        if balance < amount {
            return Err(TokenError::InsufficientBalance {
                account: from.to_string(),
                balance,
                amount,
            });
        }

        if let Some(b) = self.balances.get_mut(&asset).and_then(|m| m.get_mut(from)) {
            *b -= amount;
        }
        // Balances never exceed supply, so this cannot underflow.
        if let Some(supply) = self.supplies.get_mut(&asset) {
            *supply = supply.saturating_sub(amount);
        }
        Ok(())
    }

    /// Moves `amount` between accounts without touching supply. Used for
    /// escrow in the gateways and pool custody in the staking vault.
    pub fn transfer(
        &mut self,
        asset: AssetId,
        from: &str,
        to: &str,
        amount: u64,
    ) -> Result<(), TokenError> {
        let from_balance = self.balance_of(&asset, from);
        if from_balance < amount {
            return Err(TokenError::InsufficientBalance {
                account: from.to_string(),
                balance: from_balance,
                amount,
            });
        }
        let to_balance = self.balance_of(&asset, to);
        let new_to = to_balance
            .checked_add(amount)
            .ok_or_else(|| TokenError::BalanceOverflow {
                account: to.to_string(),
                amount,
            })?;

        let accounts = self.balances.entry(asset).or_default();
        if let Some(b) = accounts.get_mut(from) {
            *b = from_balance - amount;
        }
        accounts.insert(to.to_string(), new_to);
        Ok(())
    }

    /// Total issued supply for an asset (0 if nothing was ever minted).
    pub fn total_supply(&self, asset: &AssetId) -> u64 {
        self.supplies.get(asset).copied().unwrap_or(0)
    }

    /// Balance of `account` for `asset` (0 if unknown).
    pub fn balance_of(&self, asset: &AssetId, account: &str) -> u64 {
        self.balances
            .get(asset)
            .and_then(|m| m.get(account))
            .copied()
            .unwrap_or(0)
    }

    /// Number of accounts holding a non-zero balance of `asset`.
    pub fn holder_count(&self, asset: &AssetId) -> usize {
        self.balances
            .get(asset)
            .map(|m| m.values().filter(|b| **b > 0).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usdc() -> AssetId {
        AssetId::derive("USDC")
    }

    #[test]
    fn mint_increases_supply_and_balance() {
        let mut ledger = TokenLedger::new();
        ledger.mint(usdc(), "cairn:acme", 1_000_000).unwrap();
        assert_eq!(ledger.total_supply(&usdc()), 1_000_000);
        assert_eq!(ledger.balance_of(&usdc(), "cairn:acme"), 1_000_000);
    }

    #[test]
    fn burn_decreases_supply_and_balance() {
        let mut ledger = TokenLedger::new();
        ledger.mint(usdc(), "cairn:acme", 1_000).unwrap();
        ledger.burn(usdc(), "cairn:acme", 400).unwrap();
        assert_eq!(ledger.total_supply(&usdc()), 600);
        assert_eq!(ledger.balance_of(&usdc(), "cairn:acme"), 600);
    }

    #[test]
    fn burn_more_than_balance_rejected_without_state_change() {
        let mut ledger = TokenLedger::new();
        ledger.mint(usdc(), "cairn:acme", 100).unwrap();
        let err = ledger.burn(usdc(), "cairn:acme", 200).unwrap_err();
        assert!(matches!(
            err,
            TokenError::InsufficientBalance {
                balance: 100,
                amount: 200,
                ..
            }
        ));
        assert_eq!(ledger.total_supply(&usdc()), 100);
        assert_eq!(ledger.balance_of(&usdc(), "cairn:acme"), 100);
    }

    #[test]
    fn transfer_moves_balance_not_supply() {
        let mut ledger = TokenLedger::new();
        ledger.mint(usdc(), "cairn:acme", 1_000).unwrap();
        ledger
            .transfer(usdc(), "cairn:acme", "cairn:minter:escrow", 300)
            .unwrap();
        assert_eq!(ledger.balance_of(&usdc(), "cairn:acme"), 700);
        assert_eq!(ledger.balance_of(&usdc(), "cairn:minter:escrow"), 300);
        assert_eq!(ledger.total_supply(&usdc()), 1_000);
    }

    #[test]
    fn transfer_without_funds_rejected() {
        let mut ledger = TokenLedger::new();
        let err = ledger
            .transfer(usdc(), "cairn:nobody", "cairn:x", 1)
            .unwrap_err();
        assert!(matches!(err, TokenError::InsufficientBalance { balance: 0, .. }));
    }

    #[test]
    fn mint_overflow_rejected() {
        let mut ledger = TokenLedger::new();
        ledger.mint(usdc(), "cairn:acme", u64::MAX).unwrap();
        let err = ledger.mint(usdc(), "cairn:other", 1).unwrap_err();
        assert!(matches!(err, TokenError::SupplyOverflow { amount: 1 }));
        // Failed mint leaves state untouched.
        assert_eq!(ledger.total_supply(&usdc()), u64::MAX);
        assert_eq!(ledger.balance_of(&usdc(), "cairn:other"), 0);
    }

    #[test]
    fn supplies_are_isolated_per_asset() {
        let mut ledger = TokenLedger::new();
        let usdt = AssetId::derive("USDT");
        ledger.mint(usdc(), "cairn:acme", 500).unwrap();
        ledger.mint(usdt, "cairn:acme", 700).unwrap();
        assert_eq!(ledger.total_supply(&usdc()), 500);
        assert_eq!(ledger.total_supply(&usdt), 700);
    }

    #[test]
    fn holder_count_skips_zeroed_accounts() {
        let mut ledger = TokenLedger::new();
        ledger.mint(usdc(), "cairn:a", 10).unwrap();
        ledger.mint(usdc(), "cairn:b", 10).unwrap();
        ledger.burn(usdc(), "cairn:b", 10).unwrap();
        assert_eq!(ledger.holder_count(&usdc()), 1);
    }

    #[test]
    fn ledger_serialization_roundtrip() {
        let mut ledger = TokenLedger::new();
        ledger.mint(usdc(), "cairn:acme", 1_000).unwrap();
        let json = serde_json::to_string(&ledger).expect("serialize");
        let recovered: TokenLedger = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(ledger, recovered);
    }
}
