//! Single-writer orchestrator over the settlement core.
//!
//! The engine owns the authoritative [`CoreState`] behind one write lock
//! and is the only component that mutates it. Every operation follows
//! the same shape: take the lock, apply the mutation through the core's
//! or a gateway's entry points, emit exactly one event describing it,
//! and append that event to the journal when one is attached. Reads take
//! the lock shared and copy out what the caller asked for.
//!
//! On restart, [`Engine::with_journal`] loads the newest snapshot,
//! replays the journal tail to recover core state, and walks the full
//! record stream once more to rebuild gateway request bookkeeping,
//! which snapshots do not carry.
//!
//! Custody adapters are process-local capabilities, not ledger state:
//! attaching one is not an event, and the venue mirror calls (deposit on
//! mint, recall on settlement) are best-effort — a venue hiccup must
//! not wedge a settlement that already happened on the ledger.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use cairn_protocol::adapter::Adapter;
use cairn_protocol::batch::{Batch, BatchError, BatchStatus};
use cairn_protocol::config::{Network, ProtocolConfig};
use cairn_protocol::events::{Event, EventLog, EventRecord};
use cairn_protocol::ids::{AssetId, BatchId, ProposalId, RequestId, VaultId};
use cairn_protocol::registry::{Authorizer, RegistryError, Role, VaultKind};
use cairn_protocol::router::{RouterError, SettlementOutcome, SettlementProposal};
use cairn_protocol::state::{BackingReport, CoreState};
use cairn_protocol::storage::journal::{EventJournal, StoreError};
use cairn_protocol::storage::replay::{self, ReplayError};
use cairn_protocol::storage::snapshot::StateSnapshot;
use cairn_protocol::token::TokenError;

use crate::minter::{InstitutionalMinter, MinterError};
use crate::requests::{RedeemRequest, RequestStatus, StakeRequest, UnstakeRequest};
use crate::staking::{CancelledRequest, StakingError, StakingVault};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The caller lacks the role the operation demands.
    #[error("account {account} lacks the {required} role")]
    Unauthorized {
        /// Who tried.
        account: String,
        /// The role that was required.
        required: Role,
    },

    /// The vault has no institutional gateway bound.
    #[error("vault {vault} has no institutional gateway bound")]
    MinterMissing {
        /// The addressed vault.
        vault: VaultId,
    },

    /// The vault has no staking gateway.
    #[error("vault {vault} has no staking gateway")]
    StakingMissing {
        /// The addressed vault.
        vault: VaultId,
    },

    /// The vault has no open batch to report into.
    #[error("vault {vault} has no open batch")]
    NoOpenBatch {
        /// The addressed vault.
        vault: VaultId,
    },

    /// A registry lookup or mutation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A router operation failed.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// A batch-ledger operation failed.
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// A token-ledger operation failed.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// An institutional-gateway operation failed.
    #[error(transparent)]
    Minter(#[from] MinterError),

    /// A retail-gateway operation failed.
    #[error(transparent)]
    Staking(#[from] StakingError),

    /// The journal rejected a read or write.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The journal does not describe a replayable history.
    #[error(transparent)]
    Replay(#[from] ReplayError),
}

// ---------------------------------------------------------------------------
// Read views
// ---------------------------------------------------------------------------

/// A coarse summary of engine state, cheap to assemble under the read
/// lock.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// Which network parameters the engine runs under.
    pub network: Network,
    /// Registered assets.
    pub assets: usize,
    /// Registered vaults.
    pub vaults: usize,
    /// Vaults currently holding an open batch.
    pub open_batches: usize,
    /// Settlement proposals still pending.
    pub open_proposals: usize,
    /// Sequence of the latest event, 0 if none.
    pub latest_event: u64,
    /// Whether a journal is attached.
    pub journaled: bool,
}

/// Per-vault accounting view assembled for operators and the API.
#[derive(Debug, Clone, Serialize)]
pub struct VaultOverview {
    /// The vault.
    pub vault: VaultId,
    /// Its registered name.
    pub name: String,
    /// What the vault does.
    pub kind: VaultKind,
    /// The asset it accounts for.
    pub asset: AssetId,
    /// The share token, for staking vaults.
    pub share_asset: Option<AssetId>,
    /// The bound gateway account, if any.
    pub gateway: Option<String>,
    /// Where this vault's yield goes, if overridden.
    pub yield_recipient: Option<String>,
    /// The currently open batch, if any.
    pub open_batch: Option<BatchId>,
    /// Custody baseline.
    pub baseline: u64,
    /// Unsettled reported deposits.
    pub deposited: u64,
    /// Unsettled reported withdrawals.
    pub requested: u64,
    /// Unsettled stake inflow (staking vaults).
    pub stake_inflow: u64,
    /// Unsettled unstake shares (staking vaults).
    pub unstake_shares: u64,
    /// Gateway requests still pending against this vault.
    pub pending_requests: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Everything behind the engine's lock.
struct EngineState {
    core: CoreState,
    log: EventLog,
    minters: HashMap<VaultId, InstitutionalMinter>,
    stakers: HashMap<VaultId, StakingVault>,
    adapters: HashMap<VaultId, Arc<dyn Adapter>>,
}

/// The single-writer protocol engine.
pub struct Engine {
    config: ProtocolConfig,
    auth: Arc<dyn Authorizer>,
    journal: Option<EventJournal>,
    inner: RwLock<EngineState>,
}

impl Engine {
    /// Creates an in-memory engine with no journal attached.
    pub fn new(config: ProtocolConfig, auth: Arc<dyn Authorizer>) -> Self {
        Self {
            config,
            auth,
            journal: None,
            inner: RwLock::new(EngineState {
                core: CoreState::new(),
                log: EventLog::new(),
                minters: HashMap::new(),
                stakers: HashMap::new(),
                adapters: HashMap::new(),
            }),
        }
    }

    /// Opens an engine over a journal, restoring state from it.
    ///
    /// Core state comes from the newest snapshot plus the journal tail
    /// (or a full replay when no snapshot exists); gateway request
    /// bookkeeping is rebuilt from the full record stream, which costs
    /// one linear pass and keeps snapshots core-only.
    ///
    /// # Errors
    ///
    /// Fails if the journal cannot be read or does not describe a
    /// history this build can replay.
    pub fn with_journal(
        config: ProtocolConfig,
        auth: Arc<dyn Authorizer>,
        journal: EventJournal,
    ) -> Result<Self, EngineError> {
        let records = journal.records()?;
        let core = match journal.latest_snapshot()? {
            Some(snapshot) => {
                let tail = journal.records_after(snapshot.journal_seq)?;
                replay::resume(snapshot.core, &tail)?
            }
            None => replay::rebuild(&records)?,
        };
        let (minters, stakers) = restore_gateways(&core, &records);
        let last_seq = journal.latest_seq()?.unwrap_or(0);

        info!(
            records = records.len(),
            resumed_after = last_seq,
            vaults = core.registry.vault_count(),
            "engine restored from journal"
        );
        Ok(Self {
            config,
            auth,
            journal: Some(journal),
            inner: RwLock::new(EngineState {
                core,
                log: EventLog::resuming_after(last_seq),
                minters,
                stakers,
                adapters: HashMap::new(),
            }),
        })
    }

    // -- Registry operations -------------------------------------------------

    /// Registers an asset and its issued-token denomination. Admin only.
    pub fn register_asset(
        &self,
        caller: &str,
        symbol: &str,
        token_symbol: &str,
        decimals: u8,
        now: DateTime<Utc>,
    ) -> Result<AssetId, EngineError> {
        self.ensure_admin(caller)?;
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let asset = state
            .core
            .registry
            .register_asset(symbol, token_symbol, decimals, now)?;
        self.emit(
            state,
            Event::AssetRegistered {
                asset,
                symbol: symbol.to_string(),
                token_symbol: token_symbol.to_string(),
                decimals,
            },
            now,
        )?;
        Ok(asset)
    }

    /// Creates a vault for an asset. Admin only. Staking vaults get their
    /// retail gateway wired immediately; primary vaults front through a
    /// gateway once one is bound.
    pub fn create_vault(
        &self,
        caller: &str,
        name: &str,
        asset: AssetId,
        kind: VaultKind,
        now: DateTime<Utc>,
    ) -> Result<VaultId, EngineError> {
        self.ensure_admin(caller)?;
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let vault = state.core.registry.create_vault(name, asset, kind, now)?;
        let share_asset = state
            .core
            .registry
            .vault(&vault)
            .and_then(|record| record.share_asset);
        if kind == VaultKind::Staking {
            if let Some(share) = share_asset {
                state
                    .stakers
                    .insert(vault, StakingVault::new(vault, asset, share, name));
            }
        }
        self.emit(
            state,
            Event::VaultCreated {
                vault,
                name: name.to_string(),
                asset,
                kind,
                share_asset,
            },
            now,
        )?;
        Ok(vault)
    }

    /// Binds the gateway operator account for a vault. Admin only. For a
    /// primary vault this (re)creates its institutional gateway.
    pub fn bind_gateway(
        &self,
        caller: &str,
        vault: &VaultId,
        gateway: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.ensure_admin(caller)?;
        let mut guard = self.inner.write();
        let state = &mut *guard;

        state.core.registry.set_gateway(*vault, gateway)?;
        let (asset, kind) = {
            let record = state
                .core
                .registry
                .vault(vault)
                .ok_or(RegistryError::VaultNotFound(*vault))?;
            (record.asset, record.kind)
        };
        if kind == VaultKind::Primary {
            state
                .minters
                .insert(*vault, InstitutionalMinter::new(*vault, asset, gateway));
        }
        self.emit(
            state,
            Event::GatewayBound {
                vault: *vault,
                gateway: gateway.to_string(),
            },
            now,
        )?;
        Ok(())
    }

    /// Routes a vault's settled yield to an account. Admin only.
    pub fn set_yield_recipient(
        &self,
        caller: &str,
        vault: &VaultId,
        recipient: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.ensure_admin(caller)?;
        let mut guard = self.inner.write();
        let state = &mut *guard;

        state.core.registry.set_yield_recipient(*vault, recipient)?;
        self.emit(
            state,
            Event::YieldRecipientSet {
                vault: *vault,
                recipient: recipient.to_string(),
            },
            now,
        )?;
        Ok(())
    }

    /// Attaches a custody adapter to a vault. Admin only. Adapters are
    /// process-local capabilities; attaching one emits nothing.
    pub fn attach_adapter(
        &self,
        caller: &str,
        vault: &VaultId,
        adapter: Arc<dyn Adapter>,
    ) -> Result<(), EngineError> {
        self.ensure_admin(caller)?;
        let mut guard = self.inner.write();
        let state = &mut *guard;

        if state.core.registry.vault(vault).is_none() {
            return Err(RegistryError::VaultNotFound(*vault).into());
        }
        state.adapters.insert(*vault, adapter);
        Ok(())
    }

    // -- Batch lifecycle -----------------------------------------------------

    /// Opens a fresh batch for a vault. Relayer or admin.
    pub fn open_batch(
        &self,
        caller: &str,
        vault: &VaultId,
        now: DateTime<Utc>,
    ) -> Result<BatchId, EngineError> {
        self.ensure_operator(caller)?;
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let asset = self.vault_asset(&state.core, vault)?;
        let batch = state.core.batches.open_batch(*vault, asset, now)?;
        let sequence = state.core.batches.get(&batch)?.sequence;
        self.emit(
            state,
            Event::BatchOpened {
                batch,
                vault: *vault,
                asset,
                sequence,
            },
            now,
        )?;
        Ok(batch)
    }

    /// Closes a batch, optionally opening its successor in the same
    /// breath. Relayer or admin. Returns the successor, if one opened.
    pub fn close_batch(
        &self,
        caller: &str,
        batch: &BatchId,
        open_next: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchId>, EngineError> {
        self.ensure_operator(caller)?;
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let vault = state.core.batches.get(batch)?.vault;
        let successor = state.core.batches.close_batch(batch, open_next, now)?;
        self.emit(
            state,
            Event::BatchClosed {
                batch: *batch,
                vault,
                successor,
            },
            now,
        )?;
        Ok(successor)
    }

    // -- Institutional flow reports ------------------------------------------

    /// Reports a custody deposit into a primary vault's open batch,
    /// without minting. Institution role; the router enforces it.
    pub fn report_push(
        &self,
        caller: &str,
        vault: &VaultId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let asset = self.vault_asset(&state.core, vault)?;
        let batch = self.open_batch_of(&state.core, vault)?;
        let core = &mut state.core;
        let total = core.router.push_assets(
            self.auth.as_ref(),
            caller,
            &core.registry,
            &mut core.batches,
            vault,
            &asset,
            amount,
            &batch,
        )?;
        self.emit(
            state,
            Event::AssetsPushed {
                vault: *vault,
                asset,
                batch,
                amount,
                by: caller.to_string(),
            },
            now,
        )?;
        Ok(total)
    }

    /// Reports an intended custody withdrawal from a primary vault's
    /// open batch. Institution role; the router enforces it.
    pub fn report_pull(
        &self,
        caller: &str,
        vault: &VaultId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let asset = self.vault_asset(&state.core, vault)?;
        let batch = self.open_batch_of(&state.core, vault)?;
        let core = &mut state.core;
        let total = core.router.request_pull(
            self.auth.as_ref(),
            caller,
            &core.registry,
            &mut core.batches,
            vault,
            &asset,
            amount,
            &batch,
        )?;
        self.emit(
            state,
            Event::PullRequested {
                vault: *vault,
                asset,
                batch,
                amount,
                by: caller.to_string(),
            },
            now,
        )?;
        Ok(total)
    }

    /// Moves baseline claim between two vaults holding the same asset,
    /// reported against the source's open batch. Relayer or admin; the
    /// router enforces it.
    pub fn transfer_between_vaults(
        &self,
        caller: &str,
        source: &VaultId,
        target: &VaultId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let asset = self.vault_asset(&state.core, source)?;
        let batch = self.open_batch_of(&state.core, source)?;
        let core = &mut state.core;
        let remaining = core.router.transfer_between_vaults(
            self.auth.as_ref(),
            caller,
            &core.registry,
            &core.batches,
            source,
            target,
            &asset,
            amount,
            &batch,
        )?;
        self.emit(
            state,
            Event::VaultTransfer {
                source: *source,
                target: *target,
                asset,
                batch,
                amount,
                by: caller.to_string(),
            },
            now,
        )?;
        Ok(remaining)
    }

    // -- Settlement ----------------------------------------------------------

    /// Proposes settlement of a closed batch at a reported custody
    /// total. Relayer role; the router enforces it. When the vault has
    /// an adapter attached, its live total must corroborate the report.
    pub fn propose_settlement(
        &self,
        caller: &str,
        vault: &VaultId,
        batch: &BatchId,
        reported_total: u64,
        now: DateTime<Utc>,
    ) -> Result<ProposalId, EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let asset = self.vault_asset(&state.core, vault)?;
        let adapter_total = state
            .adapters
            .get(vault)
            .map(|adapter| adapter.total_assets(vault, &asset));
        let core = &mut state.core;
        let proposal = core.router.propose_settle_batch(
            self.auth.as_ref(),
            caller,
            &self.config,
            &core.registry,
            &core.batches,
            adapter_total,
            vault,
            &asset,
            batch,
            reported_total,
            now,
        )?;
        let (yield_amount, is_profit, execute_after) = {
            let record = core
                .router
                .proposal(&proposal)
                .ok_or(RouterError::ProposalNotFound(proposal))?;
            (record.yield_amount, record.is_profit, record.execute_after)
        };
        self.emit(
            state,
            Event::SettlementProposed {
                proposal,
                vault: *vault,
                asset,
                batch: *batch,
                reported_total,
                yield_amount,
                is_profit,
                proposed_by: caller.to_string(),
                execute_after,
            },
            now,
        )?;
        Ok(proposal)
    }

    /// Cancels a pending settlement proposal. Guardian role; the router
    /// enforces it.
    pub fn cancel_settlement(
        &self,
        caller: &str,
        proposal: &ProposalId,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        state
            .core
            .router
            .cancel_proposal(self.auth.as_ref(), caller, proposal, now)?;
        self.emit(
            state,
            Event::ProposalCancelled {
                proposal: *proposal,
                by: caller.to_string(),
            },
            now,
        )?;
        Ok(())
    }

    /// Executes a matured settlement proposal. Permissionless. Recalls
    /// the receiver-funded set-aside from the vault's adapter when one
    /// is attached.
    pub fn execute_settlement(
        &self,
        caller: &str,
        proposal: &ProposalId,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let core = &mut state.core;
        let outcome = core.router.execute_settle_batch(
            caller,
            &self.config,
            &core.registry,
            &mut core.batches,
            &mut core.tokens,
            &mut core.receivers,
            proposal,
            now,
        )?;
        if outcome.receiver_funded > 0 {
            if let Some(adapter) = state.adapters.get(&outcome.vault) {
                if let Err(err) =
                    adapter.redeem(&outcome.asset, outcome.receiver_funded, &outcome.vault)
                {
                    warn!(
                        vault = %outcome.vault,
                        amount = outcome.receiver_funded,
                        error = %err,
                        "venue recall failed; adapter position out of sync"
                    );
                }
            }
        }
        self.emit(
            state,
            Event::SettlementExecuted {
                proposal: *proposal,
                vault: outcome.vault,
                asset: outcome.asset,
                batch: outcome.batch,
                reported_total: outcome.reported_total,
                yield_amount: outcome.yield_amount,
                is_profit: outcome.is_profit,
                yield_recipient: outcome.yield_recipient.clone(),
                receiver_funded: outcome.receiver_funded,
                pricing: outcome.pricing,
                new_baseline: outcome.new_baseline,
                by: caller.to_string(),
            },
            now,
        )?;
        Ok(outcome)
    }

    // -- Token ledger --------------------------------------------------------

    /// Transfers issued tokens from the caller to another account.
    pub fn transfer_tokens(
        &self,
        caller: &str,
        asset: &AssetId,
        to: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        state.core.tokens.transfer(*asset, caller, to, amount)?;
        self.emit(
            state,
            Event::TokensTransferred {
                asset: *asset,
                from: caller.to_string(),
                to: to.to_string(),
                amount,
            },
            now,
        )?;
        Ok(())
    }

    // -- Institutional gateway -----------------------------------------------

    /// Mints against a reported custody deposit. Institution role; the
    /// router enforces it. Mirrors the principal into the vault's
    /// adapter when one is attached.
    pub fn mint(
        &self,
        caller: &str,
        vault: &VaultId,
        recipient: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<BatchId, EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let minter = state
            .minters
            .get(vault)
            .ok_or(EngineError::MinterMissing { vault: *vault })?;
        let batch = minter.mint(self.auth.as_ref(), caller, &mut state.core, recipient, amount)?;
        let asset = minter.asset();

        if let Some(adapter) = state.adapters.get(vault) {
            if let Err(err) = adapter.deposit(&asset, amount, vault) {
                warn!(
                    vault = %vault,
                    amount,
                    error = %err,
                    "venue deposit failed; adapter position out of sync"
                );
            }
        }
        self.emit(
            state,
            Event::MintExecuted {
                vault: *vault,
                asset,
                batch,
                institution: caller.to_string(),
                recipient: recipient.to_string(),
                amount,
            },
            now,
        )?;
        Ok(batch)
    }

    /// Opens an institutional redemption against a vault's open batch.
    pub fn request_redeem(
        &self,
        caller: &str,
        vault: &VaultId,
        recipient: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<RedeemRequest, EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let minter = state
            .minters
            .get_mut(vault)
            .ok_or(EngineError::MinterMissing { vault: *vault })?;
        let request =
            minter.request_redeem(self.auth.as_ref(), caller, &mut state.core, recipient, amount, now)?;
        let escrow = minter.escrow_account().to_string();
        self.emit(
            state,
            Event::RedeemRequested {
                request: request.id,
                vault: *vault,
                asset: request.asset,
                batch: request.batch,
                requester: caller.to_string(),
                recipient: recipient.to_string(),
                escrow,
                amount,
            },
            now,
        )?;
        Ok(request)
    }

    /// Completes a redemption whose batch has settled. The caller must
    /// be the vault's gateway operator account; the batch receiver
    /// enforces it.
    pub fn redeem(
        &self,
        caller: &str,
        vault: &VaultId,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<RedeemRequest, EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let minter = state
            .minters
            .get_mut(vault)
            .ok_or(EngineError::MinterMissing { vault: *vault })?;
        let request = minter.redeem(caller, &mut state.core, request_id, now)?;
        let escrow = minter.escrow_account().to_string();
        self.emit(
            state,
            Event::RedeemCompleted {
                request: request.id,
                vault: *vault,
                asset: request.asset,
                batch: request.batch,
                gateway: caller.to_string(),
                escrow,
                recipient: request.recipient.clone(),
                amount: request.amount,
            },
            now,
        )?;
        Ok(request)
    }

    /// Cancels a pending redemption while its batch is still open. Only
    /// the requesting institution may cancel.
    pub fn cancel_redeem(
        &self,
        caller: &str,
        vault: &VaultId,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<RedeemRequest, EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let minter = state
            .minters
            .get_mut(vault)
            .ok_or(EngineError::MinterMissing { vault: *vault })?;
        let request =
            minter.cancel_request(self.auth.as_ref(), caller, &mut state.core, request_id, now)?;
        let escrow = minter.escrow_account().to_string();
        self.emit(
            state,
            Event::RedeemCancelled {
                request: request.id,
                vault: *vault,
                asset: request.asset,
                batch: request.batch,
                requester: caller.to_string(),
                escrow,
                amount: request.amount,
            },
            now,
        )?;
        Ok(request)
    }

    // -- Retail gateway ------------------------------------------------------

    /// Opens a retail stake against a staking vault's open batch.
    /// Permissionless.
    pub fn request_stake(
        &self,
        caller: &str,
        vault: &VaultId,
        recipient: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<StakeRequest, EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let staker = state
            .stakers
            .get_mut(vault)
            .ok_or(EngineError::StakingMissing { vault: *vault })?;
        let request = staker.request_stake(caller, &mut state.core, recipient, amount, now)?;
        let escrow = staker.escrow_account().to_string();
        self.emit(
            state,
            Event::StakeRequested {
                request: request.id,
                vault: *vault,
                asset: request.asset,
                batch: request.batch,
                requester: caller.to_string(),
                recipient: recipient.to_string(),
                escrow,
                amount,
            },
            now,
        )?;
        Ok(request)
    }

    /// Opens a retail unstake against a staking vault's open batch.
    pub fn request_unstake(
        &self,
        caller: &str,
        vault: &VaultId,
        recipient: &str,
        shares: u64,
        now: DateTime<Utc>,
    ) -> Result<UnstakeRequest, EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let staker = state
            .stakers
            .get_mut(vault)
            .ok_or(EngineError::StakingMissing { vault: *vault })?;
        let request = staker.request_unstake(caller, &mut state.core, recipient, shares, now)?;
        let escrow = staker.escrow_account().to_string();
        self.emit(
            state,
            Event::UnstakeRequested {
                request: request.id,
                vault: *vault,
                share_asset: request.share_asset,
                batch: request.batch,
                requester: caller.to_string(),
                recipient: recipient.to_string(),
                escrow,
                shares,
            },
            now,
        )?;
        Ok(request)
    }

    /// Claims a settled stake at its batch's frozen price.
    /// Permissionless crank; shares mint to the recorded recipient.
    pub fn claim_staked_shares(
        &self,
        vault: &VaultId,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<(StakeRequest, u64), EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let staker = state
            .stakers
            .get_mut(vault)
            .ok_or(EngineError::StakingMissing { vault: *vault })?;
        let (request, shares) = staker.claim_staked_shares(&mut state.core, request_id, now)?;
        let share_asset = staker.share_asset();
        let escrow = staker.escrow_account().to_string();
        let pool = staker.pool_account().to_string();
        self.emit(
            state,
            Event::StakeClaimed {
                request: request.id,
                vault: *vault,
                asset: request.asset,
                share_asset,
                batch: request.batch,
                recipient: request.recipient.clone(),
                escrow,
                pool,
                amount: request.amount,
                shares,
            },
            now,
        )?;
        Ok((request, shares))
    }

    /// Claims a settled unstake at its batch's frozen price.
    /// Permissionless crank; the underlying pays to the recorded
    /// recipient.
    pub fn claim_unstaked_assets(
        &self,
        vault: &VaultId,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<(UnstakeRequest, u64), EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let staker = state
            .stakers
            .get_mut(vault)
            .ok_or(EngineError::StakingMissing { vault: *vault })?;
        let (request, assets) = staker.claim_unstaked_assets(&mut state.core, request_id, now)?;
        let asset = staker.asset();
        let escrow = staker.escrow_account().to_string();
        let pool = staker.pool_account().to_string();
        self.emit(
            state,
            Event::UnstakeClaimed {
                request: request.id,
                vault: *vault,
                asset,
                share_asset: request.share_asset,
                batch: request.batch,
                recipient: request.recipient.clone(),
                escrow,
                pool,
                shares: request.shares,
                assets,
            },
            now,
        )?;
        Ok((request, assets))
    }

    /// Cancels a pending stake or unstake while its batch is still open.
    /// Only the requester may cancel.
    pub fn cancel_staking_request(
        &self,
        caller: &str,
        vault: &VaultId,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<CancelledRequest, EngineError> {
        let mut guard = self.inner.write();
        let state = &mut *guard;

        let staker = state
            .stakers
            .get_mut(vault)
            .ok_or(EngineError::StakingMissing { vault: *vault })?;
        let cancelled = staker.cancel_request(caller, &mut state.core, request_id, now)?;
        let escrow = staker.escrow_account().to_string();
        let event = match &cancelled {
            CancelledRequest::Stake(request) => Event::StakeCancelled {
                request: request.id,
                vault: *vault,
                asset: request.asset,
                batch: request.batch,
                requester: caller.to_string(),
                escrow,
                amount: request.amount,
            },
            CancelledRequest::Unstake(request) => Event::UnstakeCancelled {
                request: request.id,
                vault: *vault,
                share_asset: request.share_asset,
                batch: request.batch,
                requester: caller.to_string(),
                escrow,
                shares: request.shares,
            },
        };
        self.emit(state, event, now)?;
        Ok(cancelled)
    }

    // -- Persistence ---------------------------------------------------------

    /// Captures a snapshot at the current journal position and flushes
    /// the journal. Returns the pinned sequence, or `None` when no
    /// journal is attached.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Result<Option<u64>, EngineError> {
        let Some(journal) = &self.journal else {
            return Ok(None);
        };
        let guard = self.inner.read();
        let seq = guard.log.latest_seq().unwrap_or(0);
        let snapshot = StateSnapshot::capture(&guard.core, seq, now);
        journal.put_snapshot(&snapshot)?;
        journal.flush()?;
        info!(journal_seq = seq, "state snapshot captured");
        Ok(Some(seq))
    }

    // -- Read access ---------------------------------------------------------

    /// The engine's protocol configuration.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Whether a journal is attached.
    pub fn has_journal(&self) -> bool {
        self.journal.is_some()
    }

    /// Coarse status summary.
    pub fn status(&self) -> EngineStatus {
        let guard = self.inner.read();
        let open_batches = guard
            .core
            .registry
            .vaults()
            .filter(|record| guard.core.batches.open_id_of(&record.id).is_some())
            .count();
        EngineStatus {
            network: self.config.network,
            assets: guard.core.registry.asset_count(),
            vaults: guard.core.registry.vault_count(),
            open_batches,
            open_proposals: guard.core.router.open_proposal_count(),
            latest_event: guard.log.latest_seq().unwrap_or(0),
            journaled: self.journal.is_some(),
        }
    }

    /// Accounting overview of every vault.
    pub fn vault_overviews(&self) -> Vec<VaultOverview> {
        let guard = self.inner.read();
        guard
            .core
            .registry
            .vaults()
            .map(|record| overview_of(&guard, record.id, record))
            .collect()
    }

    /// Accounting overview of one vault.
    pub fn vault_overview(&self, vault: &VaultId) -> Option<VaultOverview> {
        let guard = self.inner.read();
        let record = guard.core.registry.vault(vault)?;
        Some(overview_of(&guard, *vault, record))
    }

    /// A batch by id.
    pub fn batch(&self, batch: &BatchId) -> Option<Batch> {
        self.inner.read().core.batches.get(batch).ok().cloned()
    }

    /// Every batch currently closed and awaiting settlement, ordered by
    /// vault then sequence. Settlement is sequential per vault, so the
    /// first entry per vault is the one that must settle next.
    pub fn closed_batches(&self) -> Vec<Batch> {
        let guard = self.inner.read();
        let mut batches: Vec<Batch> = guard
            .core
            .batches
            .iter()
            .filter(|record| record.status == BatchStatus::Closed)
            .cloned()
            .collect();
        batches.sort_by_key(|record| (record.vault, record.sequence));
        batches
    }

    /// Balance of `account` in the issued token of `asset`.
    pub fn token_balance(&self, asset: &AssetId, account: &str) -> u64 {
        self.inner.read().core.tokens.balance_of(asset, account)
    }

    /// The escrow and pool accounts of a staking vault's gateway, in
    /// that order. `None` when the vault has no staking gateway.
    pub fn staking_accounts(&self, vault: &VaultId) -> Option<(String, String)> {
        let guard = self.inner.read();
        guard.stakers.get(vault).map(|staker| {
            (
                staker.escrow_account().to_string(),
                staker.pool_account().to_string(),
            )
        })
    }

    /// The attached adapter's live custody total for a vault, or `None`
    /// when no adapter is attached.
    pub fn adapter_total(&self, vault: &VaultId) -> Option<u64> {
        let guard = self.inner.read();
        let record = guard.core.registry.vault(vault)?;
        let adapter = guard.adapters.get(vault)?;
        Some(adapter.total_assets(vault, &record.asset))
    }

    /// Pending stake and unstake requests against a staking vault.
    /// Empty when the vault has no staking gateway.
    pub fn pending_staking_requests(&self, vault: &VaultId) -> (Vec<StakeRequest>, Vec<UnstakeRequest>) {
        let guard = self.inner.read();
        match guard.stakers.get(vault) {
            Some(staker) => (
                staker
                    .stakes()
                    .filter(|request| request.status.is_pending())
                    .cloned()
                    .collect(),
                staker
                    .unstakes()
                    .filter(|request| request.status.is_pending())
                    .cloned()
                    .collect(),
            ),
            None => (Vec::new(), Vec::new()),
        }
    }

    /// Pending institutional redemptions against a primary vault.
    /// Empty when the vault has no gateway bound.
    pub fn pending_redeems(&self, vault: &VaultId) -> Vec<RedeemRequest> {
        let guard = self.inner.read();
        match guard.minters.get(vault) {
            Some(minter) => minter
                .requests()
                .filter(|request| request.status.is_pending())
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// All settlement proposals, pending and resolved.
    pub fn proposals(&self) -> Vec<SettlementProposal> {
        self.inner.read().core.router.proposals().cloned().collect()
    }

    /// A proposal by id.
    pub fn proposal(&self, proposal: &ProposalId) -> Option<SettlementProposal> {
        self.inner.read().core.router.proposal(proposal).cloned()
    }

    /// Backing report for an asset.
    pub fn backing(&self, asset: &AssetId) -> BackingReport {
        self.inner.read().core.backing_report(asset)
    }

    /// Every event with sequence strictly greater than `after`. Served
    /// from the journal when one is attached, so history survives
    /// restarts; otherwise from the in-memory log.
    pub fn events_since(&self, after: u64) -> Result<Vec<EventRecord>, EngineError> {
        if let Some(journal) = &self.journal {
            return Ok(journal.records_after(after)?);
        }
        Ok(self.inner.read().log.since(after).cloned().collect())
    }

    /// The most recent `n` events from the in-memory log, oldest first.
    pub fn recent_events(&self, n: usize) -> Vec<EventRecord> {
        self.inner.read().log.recent(n).to_vec()
    }

    /// Sequence of the latest event, 0 if none.
    pub fn latest_event_seq(&self) -> u64 {
        self.inner.read().log.latest_seq().unwrap_or(0)
    }

    // -- Internals -----------------------------------------------------------

    /// Appends the event to the in-memory log and, when attached, the
    /// journal. Ledger state mutates before the journal write: a sled
    /// failure here surfaces to the caller while memory stays ahead of
    /// disk, which restore resolves in disk's favor.
    fn emit(&self, state: &mut EngineState, event: Event, now: DateTime<Utc>) -> Result<u64, EngineError> {
        let record = state.log.append(event, now);
        if let Some(journal) = &self.journal {
            journal.append(record)?;
        }
        Ok(record.seq)
    }

    fn ensure_admin(&self, caller: &str) -> Result<(), EngineError> {
        if self.auth.is_admin(caller) {
            return Ok(());
        }
        Err(EngineError::Unauthorized {
            account: caller.to_string(),
            required: Role::Admin,
        })
    }

    /// Batch lifecycle is operator work: relayer in production, admin in
    /// bootstrap scripts.
    fn ensure_operator(&self, caller: &str) -> Result<(), EngineError> {
        if self.auth.is_admin(caller) || self.auth.has_role(caller, Role::Relayer) {
            return Ok(());
        }
        Err(EngineError::Unauthorized {
            account: caller.to_string(),
            required: Role::Relayer,
        })
    }

    fn vault_asset(&self, core: &CoreState, vault: &VaultId) -> Result<AssetId, EngineError> {
        Ok(core
            .registry
            .vault(vault)
            .ok_or(RegistryError::VaultNotFound(*vault))?
            .asset)
    }

    fn open_batch_of(&self, core: &CoreState, vault: &VaultId) -> Result<BatchId, EngineError> {
        core.batches
            .open_id_of(vault)
            .ok_or(EngineError::NoOpenBatch { vault: *vault })
    }
}

/// Builds one vault's overview from state under the read lock.
fn overview_of(
    state: &EngineState,
    vault: VaultId,
    record: &cairn_protocol::registry::VaultRecord,
) -> VaultOverview {
    let entry = state.core.router.book().entry(&vault, &record.asset);
    let flow = state.core.router.book().share_flow(&vault);
    let pending_requests = state
        .minters
        .get(&vault)
        .map(|m| m.pending_count())
        .unwrap_or(0)
        + state
            .stakers
            .get(&vault)
            .map(|s| s.pending_count())
            .unwrap_or(0);
    VaultOverview {
        vault,
        name: record.name.clone(),
        kind: record.kind,
        asset: record.asset,
        share_asset: record.share_asset,
        gateway: record.gateway.clone(),
        yield_recipient: record.yield_recipient.clone(),
        open_batch: state.core.batches.open_id_of(&vault),
        baseline: state.core.router.book().baseline(&vault, &record.asset),
        deposited: entry.deposited,
        requested: entry.requested,
        stake_inflow: flow.stake_inflow,
        unstake_shares: flow.unstake_shares,
        pending_requests,
    }
}

/// Rebuilds gateway structures and request bookkeeping from the rebuilt
/// registry and the full record stream.
fn restore_gateways(
    core: &CoreState,
    records: &[EventRecord],
) -> (
    HashMap<VaultId, InstitutionalMinter>,
    HashMap<VaultId, StakingVault>,
) {
    let mut minters = HashMap::new();
    let mut stakers = HashMap::new();
    for record in core.registry.vaults() {
        match record.kind {
            VaultKind::Primary => {
                if let Some(gateway) = &record.gateway {
                    minters.insert(
                        record.id,
                        InstitutionalMinter::new(record.id, record.asset, gateway),
                    );
                }
            }
            VaultKind::Staking => {
                let Some(share_asset) = record.share_asset else {
                    warn!(vault = %record.id, "staking vault without share token; gateway not restored");
                    continue;
                };
                stakers.insert(
                    record.id,
                    StakingVault::new(record.id, record.asset, share_asset, &record.name),
                );
            }
        }
    }

    for record in records {
        match &record.event {
            Event::RedeemRequested {
                request,
                vault,
                asset,
                batch,
                requester,
                recipient,
                amount,
                ..
            } => {
                if let Some(minter) = minters.get_mut(vault) {
                    minter.restore_request(RedeemRequest {
                        id: *request,
                        vault: *vault,
                        asset: *asset,
                        batch: *batch,
                        requester: requester.clone(),
                        recipient: recipient.clone(),
                        amount: *amount,
                        status: RequestStatus::Pending,
                        created_at: record.at,
                        resolved_at: None,
                    });
                }
            }
            Event::RedeemCompleted { request, vault, .. } => {
                if let Some(minter) = minters.get_mut(vault) {
                    minter.restore_resolution(request, RequestStatus::Completed, record.at);
                }
            }
            Event::RedeemCancelled { request, vault, .. } => {
                if let Some(minter) = minters.get_mut(vault) {
                    minter.restore_resolution(request, RequestStatus::Cancelled, record.at);
                }
            }
            Event::StakeRequested {
                request,
                vault,
                asset,
                batch,
                requester,
                recipient,
                amount,
                ..
            } => {
                if let Some(staker) = stakers.get_mut(vault) {
                    staker.restore_stake(StakeRequest {
                        id: *request,
                        vault: *vault,
                        asset: *asset,
                        batch: *batch,
                        requester: requester.clone(),
                        recipient: recipient.clone(),
                        amount: *amount,
                        status: RequestStatus::Pending,
                        created_at: record.at,
                        resolved_at: None,
                    });
                }
            }
            Event::StakeClaimed { request, vault, .. } => {
                if let Some(staker) = stakers.get_mut(vault) {
                    staker.restore_stake_resolution(request, RequestStatus::Completed, record.at);
                }
            }
            Event::StakeCancelled { request, vault, .. } => {
                if let Some(staker) = stakers.get_mut(vault) {
                    staker.restore_stake_resolution(request, RequestStatus::Cancelled, record.at);
                }
            }
            Event::UnstakeRequested {
                request,
                vault,
                share_asset,
                batch,
                requester,
                recipient,
                shares,
                ..
            } => {
                if let Some(staker) = stakers.get_mut(vault) {
                    staker.restore_unstake(UnstakeRequest {
                        id: *request,
                        vault: *vault,
                        share_asset: *share_asset,
                        batch: *batch,
                        requester: requester.clone(),
                        recipient: recipient.clone(),
                        shares: *shares,
                        status: RequestStatus::Pending,
                        created_at: record.at,
                        resolved_at: None,
                    });
                }
            }
            Event::UnstakeClaimed { request, vault, .. } => {
                if let Some(staker) = stakers.get_mut(vault) {
                    staker.restore_unstake_resolution(request, RequestStatus::Completed, record.at);
                }
            }
            Event::UnstakeCancelled { request, vault, .. } => {
                if let Some(staker) = stakers.get_mut(vault) {
                    staker.restore_unstake_resolution(request, RequestStatus::Cancelled, record.at);
                }
            }
            _ => {}
        }
    }
    (minters, stakers)
}
