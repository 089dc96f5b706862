//! Asset registration and vault records.
//!
//! An asset is registered exactly once and is 1:1 paired with its issued
//! receipt token (the `TokenLedger` keys supplies by `AssetId`, so the
//! pairing is structural, not a lookup that can drift). Vaults are named
//! accounting domains bound to exactly one asset each: a primary
//! (delta-neutral) vault per asset on the institutional rail, plus staking
//! vaults on the retail rail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::ids::{AssetId, VaultId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The symbol is already registered. Assets register exactly once.
    #[error("asset already registered: {symbol}")]
    AssetAlreadyRegistered {
        /// The offending symbol.
        symbol: String,
    },

    /// The referenced asset is not registered.
    #[error("asset not registered: {0}")]
    AssetNotRegistered(AssetId),

    /// A vault with this name already exists.
    #[error("vault already exists: {name}")]
    VaultAlreadyExists {
        /// The offending vault name.
        name: String,
    },

    /// The asset already has a primary vault. One delta-neutral vault per
    /// asset; satellites must be staking vaults.
    #[error("asset {symbol} already has a primary vault")]
    PrimaryVaultExists {
        /// Symbol of the asset.
        symbol: String,
    },

    /// The referenced vault does not exist.
    #[error("vault not found: {0}")]
    VaultNotFound(VaultId),
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Canonical record of a registered asset and its paired issued token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    /// Content-derived identifier ([`AssetId::derive`] over the symbol).
    pub id: AssetId,
    /// Symbol of the external underlying (e.g. "USDC").
    pub symbol: String,
    /// Display symbol of the issued receipt token (e.g. "cUSDC").
    pub token_symbol: String,
    /// Decimal places shared by the underlying and the issued token.
    /// Amounts stay in smallest units everywhere; this is for rendering.
    pub decimals: u8,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
}

/// What a vault does with the asset it accounts for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultKind {
    /// Delta-neutral custody vault on the institutional rail. Underlying-
    /// denominated; settles through batch receivers; settlement yield
    /// mints/burns issued-token supply.
    Primary,
    /// Share-issuing pool on the retail rail. Issued-token-denominated;
    /// custodies its own claims; settlement freezes a share price instead
    /// of minting.
    Staking,
}

impl std::fmt::Display for VaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultKind::Primary => write!(f, "primary"),
            VaultKind::Staking => write!(f, "staking"),
        }
    }
}

/// Canonical record of a vault.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultRecord {
    /// Content-derived identifier ([`VaultId::derive`] over the name).
    pub id: VaultId,
    /// Human-readable unique name (e.g. "primary-usdc").
    pub name: String,
    /// The one asset this vault accounts for.
    pub asset: AssetId,
    /// Institutional or retail rail.
    pub kind: VaultKind,
    /// Gateway account authorized over this vault's batch receivers.
    /// Required before an institutional settlement can fund a receiver.
    pub gateway: Option<String>,
    /// Account receiving this vault's settlement yield. Falls back to the
    /// protocol treasury when unset. Ignored for staking vaults.
    pub yield_recipient: Option<String>,
    /// Ledger id of the vault's share token. Always set on staking vaults
    /// (derived from the vault name at creation), never on primary vaults.
    pub share_asset: Option<AssetId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The configuration-truth table: assets and vaults.
///
/// Mutations happen at genesis and through admin operations on the engine;
/// the router and gateways only ever read.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    /// Registered assets keyed by id.
    assets: HashMap<AssetId, AssetRecord>,
    /// Vaults keyed by id.
    vaults: HashMap<VaultId, VaultRecord>,
    /// At most one primary vault per asset.
    primary_by_asset: HashMap<AssetId, VaultId>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an asset exactly once and returns its id.
    pub fn register_asset(
        &mut self,
        symbol: &str,
        token_symbol: &str,
        decimals: u8,
        now: DateTime<Utc>,
    ) -> Result<AssetId, RegistryError> {
        let id = AssetId::derive(symbol);
        if self.assets.contains_key(&id) {
            return Err(RegistryError::AssetAlreadyRegistered {
                symbol: symbol.to_string(),
            });
        }

        self.assets.insert(
            id,
            AssetRecord {
                id,
                symbol: symbol.to_string(),
                token_symbol: token_symbol.to_string(),
                decimals,
                registered_at: now,
            },
        );
        Ok(id)
    }

    /// Creates a vault bound to a registered asset and returns its id.
    ///
    /// A `Primary` vault claims the one-per-asset slot; creating a second
    /// primary for the same asset fails. Staking vaults get a share-token
    /// ledger id derived from the vault name (`<name>.shares`).
    pub fn create_vault(
        &mut self,
        name: &str,
        asset: AssetId,
        kind: VaultKind,
        now: DateTime<Utc>,
    ) -> Result<VaultId, RegistryError> {
        let record = self
            .assets
            .get(&asset)
            .ok_or(RegistryError::AssetNotRegistered(asset))?;

        let id = VaultId::derive(name);
        if self.vaults.contains_key(&id) {
            return Err(RegistryError::VaultAlreadyExists {
                name: name.to_string(),
            });
        }
        if kind == VaultKind::Primary && self.primary_by_asset.contains_key(&asset) {
            return Err(RegistryError::PrimaryVaultExists {
                symbol: record.symbol.clone(),
            });
        }

        let share_asset = match kind {
            VaultKind::Primary => None,
            VaultKind::Staking => Some(AssetId::derive(&format!("{name}.shares"))),
        };
        self.vaults.insert(
            id,
            VaultRecord {
                id,
                name: name.to_string(),
                asset,
                kind,
                gateway: None,
                yield_recipient: None,
                share_asset,
                created_at: now,
            },
        );
        if kind == VaultKind::Primary {
            self.primary_by_asset.insert(asset, id);
        }
        Ok(id)
    }

    /// Binds the gateway account for a vault's batch receivers.
    pub fn set_gateway(&mut self, vault: VaultId, gateway: &str) -> Result<(), RegistryError> {
        let record = self
            .vaults
            .get_mut(&vault)
            .ok_or(RegistryError::VaultNotFound(vault))?;
        record.gateway = Some(gateway.to_string());
        Ok(())
    }

    /// Sets the settlement-yield recipient for a vault.
    pub fn set_yield_recipient(
        &mut self,
        vault: VaultId,
        account: &str,
    ) -> Result<(), RegistryError> {
        let record = self
            .vaults
            .get_mut(&vault)
            .ok_or(RegistryError::VaultNotFound(vault))?;
        record.yield_recipient = Some(account.to_string());
        Ok(())
    }

    /// Asset record lookup.
    pub fn asset(&self, id: &AssetId) -> Option<&AssetRecord> {
        self.assets.get(id)
    }

    /// Vault record lookup.
    pub fn vault(&self, id: &VaultId) -> Option<&VaultRecord> {
        self.vaults.get(id)
    }

    /// Whether `asset` is the asset `vault` accounts for.
    pub fn vault_supports(&self, vault: &VaultId, asset: &AssetId) -> bool {
        self.vaults
            .get(vault)
            .map(|v| v.asset == *asset)
            .unwrap_or(false)
    }

    /// The primary vault of an asset, if one exists.
    pub fn primary_vault(&self, asset: &AssetId) -> Option<VaultId> {
        self.primary_by_asset.get(asset).copied()
    }

    /// Iterator over all vault records.
    pub fn vaults(&self) -> impl Iterator<Item = &VaultRecord> {
        self.vaults.values()
    }

    /// Iterator over all asset records.
    pub fn assets(&self) -> impl Iterator<Item = &AssetRecord> {
        self.assets.values()
    }

    /// Number of registered assets.
    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    /// Number of vaults.
    pub fn vault_count(&self) -> usize {
        self.vaults.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_usdc() -> (Registry, AssetId) {
        let mut registry = Registry::new();
        let asset = registry
            .register_asset("USDC", "cUSDC", 6, Utc::now())
            .unwrap();
        (registry, asset)
    }

    #[test]
    fn register_asset_exactly_once() {
        let (mut registry, asset) = registry_with_usdc();
        assert_eq!(registry.asset(&asset).unwrap().symbol, "USDC");
        assert_eq!(registry.asset(&asset).unwrap().token_symbol, "cUSDC");

        let dup = registry.register_asset("USDC", "cUSDC", 6, Utc::now());
        assert!(matches!(
            dup,
            Err(RegistryError::AssetAlreadyRegistered { symbol }) if symbol == "USDC"
        ));
        assert_eq!(registry.asset_count(), 1);
    }

    #[test]
    fn create_vault_requires_registered_asset() {
        let mut registry = Registry::new();
        let ghost = AssetId::derive("GHOST");
        assert!(matches!(
            registry.create_vault("primary-ghost", ghost, VaultKind::Primary, Utc::now()),
            Err(RegistryError::AssetNotRegistered(_))
        ));
    }

    #[test]
    fn one_primary_vault_per_asset() {
        let (mut registry, asset) = registry_with_usdc();
        let primary = registry
            .create_vault("primary-usdc", asset, VaultKind::Primary, Utc::now())
            .unwrap();
        assert_eq!(registry.primary_vault(&asset), Some(primary));

        let second = registry.create_vault("primary-usdc-2", asset, VaultKind::Primary, Utc::now());
        assert!(matches!(
            second,
            Err(RegistryError::PrimaryVaultExists { symbol }) if symbol == "USDC"
        ));

        // Staking vaults for the same asset are fine.
        registry
            .create_vault("staking-usdc", asset, VaultKind::Staking, Utc::now())
            .unwrap();
        assert_eq!(registry.vault_count(), 2);
    }

    #[test]
    fn duplicate_vault_name_rejected() {
        let (mut registry, asset) = registry_with_usdc();
        registry
            .create_vault("primary-usdc", asset, VaultKind::Primary, Utc::now())
            .unwrap();
        assert!(matches!(
            registry.create_vault("primary-usdc", asset, VaultKind::Staking, Utc::now()),
            Err(RegistryError::VaultAlreadyExists { .. })
        ));
    }

    #[test]
    fn vault_supports_checks_the_bound_asset() {
        let (mut registry, asset) = registry_with_usdc();
        let other = registry
            .register_asset("USDT", "cUSDT", 6, Utc::now())
            .unwrap();
        let vault = registry
            .create_vault("primary-usdc", asset, VaultKind::Primary, Utc::now())
            .unwrap();

        assert!(registry.vault_supports(&vault, &asset));
        assert!(!registry.vault_supports(&vault, &other));
        assert!(!registry.vault_supports(&VaultId::derive("missing"), &asset));
    }

    #[test]
    fn share_asset_only_on_staking_vaults() {
        let (mut registry, asset) = registry_with_usdc();
        let primary = registry
            .create_vault("primary-usdc", asset, VaultKind::Primary, Utc::now())
            .unwrap();
        let staking = registry
            .create_vault("staking-usdc", asset, VaultKind::Staking, Utc::now())
            .unwrap();

        assert!(registry.vault(&primary).unwrap().share_asset.is_none());
        assert_eq!(
            registry.vault(&staking).unwrap().share_asset,
            Some(AssetId::derive("staking-usdc.shares"))
        );
    }

    #[test]
    fn gateway_and_yield_recipient_wiring() {
        let (mut registry, asset) = registry_with_usdc();
        let vault = registry
            .create_vault("primary-usdc", asset, VaultKind::Primary, Utc::now())
            .unwrap();
        assert!(registry.vault(&vault).unwrap().gateway.is_none());

        registry.set_gateway(vault, "cairn:minter").unwrap();
        registry
            .set_yield_recipient(vault, "cairn:staking-pool")
            .unwrap();

        let record = registry.vault(&vault).unwrap();
        assert_eq!(record.gateway.as_deref(), Some("cairn:minter"));
        assert_eq!(record.yield_recipient.as_deref(), Some("cairn:staking-pool"));

        let missing = registry.set_gateway(VaultId::derive("missing"), "cairn:x");
        assert!(matches!(missing, Err(RegistryError::VaultNotFound(_))));
    }

    #[test]
    fn registry_serialization_roundtrip() {
        let (mut registry, asset) = registry_with_usdc();
        registry
            .create_vault("primary-usdc", asset, VaultKind::Primary, Utc::now())
            .unwrap();
        let json = serde_json::to_string(&registry).expect("serialize");
        let recovered: Registry = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(registry, recovered);
    }
}
