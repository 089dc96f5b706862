//! # Router Operations
//!
//! The [`VirtualBalanceRouter`] owns the virtual book and the proposal
//! table, and implements every operation that touches them: flow reporting
//! from the gateways, cross-vault rebalancing, and the propose / cancel /
//! execute settlement cycle.
//!
//! The router is deliberately passive about money. It never initiates a
//! settlement; a relayer does. It never trusts a yield figure; it derives
//! the delta between the reported total and its own baseline and rejects
//! anything outside tolerance. And it never applies a settlement
//! synchronously; execution waits out a guardian-cancellable cooldown.
//!
//! Every operation validates completely before mutating anything, and
//! orders its mutations so the only step that can fail on its own runs
//! first. A failed call leaves the router, the batch ledger, the token
//! ledger and the receiver table exactly as they were.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::batch::{BatchError, BatchLedger, BatchPricing, ReceiverError, ReceiverRegistry};
use crate::config::{ProtocolConfig, BPS_SCALE};
use crate::ids::{AssetId, BatchId, ProposalId, VaultId};
use crate::registry::{Authorizer, Registry, RegistryError, Role, VaultKind};
use crate::router::balance::{BalanceError, VirtualBook};
use crate::router::proposal::{ProposalStatus, SettlementProposal};
use crate::token::{TokenError, TokenLedger};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during router operations.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Zero-amount operations are always rejected.
    #[error("amount must be greater than zero")]
    ZeroAmount,

    /// The caller lacks the role this operation requires.
    #[error("account {account} lacks the {required} role")]
    Unauthorized {
        /// The calling account.
        account: String,
        /// The role the operation requires.
        required: Role,
    },

    /// The vault does not account for this asset.
    #[error("vault {vault} does not support asset {asset}")]
    AssetNotSupported {
        /// The vault that was addressed.
        vault: VaultId,
        /// The asset that it does not support.
        asset: AssetId,
    },

    /// The operation applies to the other rail's vault kind.
    #[error("vault {vault} is not a {expected} vault")]
    VaultKindMismatch {
        /// The vault that was addressed.
        vault: VaultId,
        /// The kind the operation requires.
        expected: VaultKind,
    },

    /// The batch does not belong to the vault (or asset) named.
    #[error("batch {batch} does not belong to vault {vault}")]
    BatchMismatch {
        /// The batch that was addressed.
        batch: BatchId,
        /// The vault the caller named.
        vault: VaultId,
    },

    /// The batch already has a live proposal; cancel it before reproposing.
    #[error("batch {batch} already has pending proposal {existing}")]
    ProposalPending {
        /// The batch that was addressed.
        batch: BatchId,
        /// The proposal currently pending against it.
        existing: ProposalId,
    },

    /// No proposal with this id exists.
    #[error("proposal not found: {0}")]
    ProposalNotFound(ProposalId),

    /// The proposal has already been executed. Terminal.
    #[error("proposal {0} already executed")]
    ProposalAlreadyExecuted(ProposalId),

    /// The proposal was cancelled by a guardian. Terminal.
    #[error("proposal {0} was cancelled")]
    ProposalCancelled(ProposalId),

    /// The guardian window has not elapsed yet. Retry after `ready_at`.
    #[error("cooldown not elapsed for proposal {proposal}: executable at {ready_at}")]
    CooldownNotElapsed {
        /// The proposal that was addressed.
        proposal: ProposalId,
        /// The earliest instant execution is allowed.
        ready_at: DateTime<Utc>,
    },

    /// Growth from a zero baseline is unverifiable; only a zero report is
    /// accepted until principal has entered custody.
    #[error("vault {vault} has an empty baseline; reported total {reported} rejected")]
    BaselineEmpty {
        /// The vault being settled.
        vault: VaultId,
        /// The non-zero total that was reported.
        reported: u64,
    },

    /// The derived yield delta exceeds the tolerance in force.
    #[error("yield delta of {delta_bps} bps on vault {vault} exceeds limit of {limit_bps} bps")]
    YieldOutOfTolerance {
        /// The vault being settled.
        vault: VaultId,
        /// The derived delta, in basis points of the baseline.
        delta_bps: u64,
        /// The effective limit (configured tolerance capped by the hard
        /// ceiling).
        limit_bps: u32,
    },

    /// The reported total disagrees with the vault's attached adapters.
    #[error("reported total {reported} does not match adapter total {adapter_total} for vault {vault}")]
    AdapterMismatch {
        /// The vault being settled.
        vault: VaultId,
        /// The relayer-reported total.
        reported: u64,
        /// The sum of `total_assets` across attached adapters.
        adapter_total: u64,
    },

    /// The batch's withdrawal intents exceed the reported custody total.
    #[error("batch {batch} requests {requested} against reported total {reported}")]
    RequestedExceedsReported {
        /// The batch being settled.
        batch: BatchId,
        /// The batch's frozen outflow tally.
        requested: u64,
        /// The reported total.
        reported: u64,
    },

    /// A settlement loss cannot be covered by the yield recipient.
    #[error("yield reserve {recipient} holds {available}, cannot cover loss of {needed}")]
    InsufficientYieldReserve {
        /// The account the loss would burn from.
        recipient: String,
        /// Its current balance.
        available: u64,
        /// The loss to cover.
        needed: u64,
    },

    /// The vault has withdrawal intents but no gateway account bound, so
    /// no receiver can be initialized for them.
    #[error("vault {vault} has no gateway account configured")]
    GatewayNotConfigured {
        /// The vault being settled.
        vault: VaultId,
    },

    /// A staking vault is missing its share-token id. Cannot happen for
    /// vaults created through the registry.
    #[error("staking vault {vault} has no share token")]
    ShareAssetMissing {
        /// The vault being settled.
        vault: VaultId,
    },

    /// Rebasing the baseline left the representable range.
    #[error("baseline overflow rebasing vault {vault}")]
    BaselineOverflow {
        /// The vault being settled.
        vault: VaultId,
    },

    /// Converting shares at the frozen price left the representable range.
    #[error("share conversion overflow for vault {vault}")]
    ConversionOverflow {
        /// The vault being settled.
        vault: VaultId,
    },

    /// Registry lookup failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Batch ledger failure.
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// Virtual book failure.
    #[error(transparent)]
    Balance(#[from] BalanceError),

    /// Token ledger failure.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Receiver table failure.
    #[error(transparent)]
    Receiver(#[from] ReceiverError),
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What a settlement execution did, for callers that emit events and
/// reconcile adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementOutcome {
    /// The executed proposal.
    pub proposal: ProposalId,
    /// The settled vault.
    pub vault: VaultId,
    /// The vault's asset.
    pub asset: AssetId,
    /// The settled batch.
    pub batch: BatchId,
    /// The vault's rail.
    pub kind: VaultKind,
    /// The custodian-reported total the settlement was executed against.
    pub reported_total: u64,
    /// The batch's frozen inflow tally.
    pub deposited: u64,
    /// The batch's frozen outflow tally.
    pub requested: u64,
    /// Magnitude of the applied yield delta.
    pub yield_amount: u64,
    /// Whether the delta was a profit.
    pub is_profit: bool,
    /// Account the yield was minted to / burned from, when any was.
    pub yield_recipient: Option<String>,
    /// Amount set aside in the batch's receiver (primary rail only).
    pub receiver_funded: u64,
    /// The share pricing frozen on the batch (staking rail only).
    pub pricing: Option<BatchPricing>,
    /// The vault's baseline after rebasing.
    pub new_baseline: u64,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// The central accounting hub: virtual book plus proposal state machine.
///
/// Collaborating ledgers (batches, tokens, receivers) are owned elsewhere
/// and passed in per call; the engine serializes all of it behind one
/// write lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualBalanceRouter {
    /// Virtual flow entries, baselines, and share flows.
    book: VirtualBook,
    /// Every proposal ever created, keyed by id. Never pruned.
    proposals: HashMap<ProposalId, SettlementProposal>,
    /// The live (non-terminal) proposal per batch, if any.
    active_by_batch: HashMap<BatchId, ProposalId>,
    /// Monotonic counter folded into proposal ids.
    proposal_nonce: u64,
}

impl VirtualBalanceRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access to the virtual book.
    pub fn book(&self) -> &VirtualBook {
        &self.book
    }

    /// Looks up a proposal by id.
    pub fn proposal(&self, id: &ProposalId) -> Option<&SettlementProposal> {
        self.proposals.get(id)
    }

    /// The live proposal against a batch, if one is pending.
    pub fn active_proposal_for(&self, batch: &BatchId) -> Option<ProposalId> {
        self.active_by_batch.get(batch).copied()
    }

    /// Iterates over every proposal ever created, in no particular order.
    pub fn proposals(&self) -> impl Iterator<Item = &SettlementProposal> {
        self.proposals.values()
    }

    /// Number of proposals still in `Proposed` status.
    pub fn open_proposal_count(&self) -> usize {
        self.active_by_batch.len()
    }

    /// Number of proposals ever created.
    pub fn proposal_count(&self) -> usize {
        self.proposals.len()
    }

    /// Reports an institutional deposit into a primary vault's open batch.
    ///
    /// Credits the flow entry's `deposited` side and the vault baseline in
    /// the same step: principal entering custody is not yield, and crediting
    /// the baseline immediately is what keeps it out of the next settlement
    /// delta. Returns the entry's new `deposited` figure.
    ///
    /// # Errors
    ///
    /// `ZeroAmount`, `Unauthorized` (institution role), `AssetNotSupported`,
    /// `VaultKindMismatch`, `BatchMismatch`, and batch-state errors if the
    /// batch is not open.
    #[allow(clippy::too_many_arguments)]
    pub fn push_assets(
        &mut self,
        auth: &dyn Authorizer,
        caller: &str,
        registry: &Registry,
        batches: &mut BatchLedger,
        vault: &VaultId,
        asset: &AssetId,
        amount: u64,
        batch: &BatchId,
    ) -> Result<u64, RouterError> {
        if amount == 0 {
            return Err(RouterError::ZeroAmount);
        }
        ensure_role(auth, caller, Role::Institution)?;
        self.check_primary_flow_target(registry, batches, vault, asset, batch)?;

        // Dry-run every mutation so a late overflow cannot half-apply.
        let batch_record = batches.get(batch)?;
        batch_record
            .deposited
            .checked_add(amount)
            .ok_or(BatchError::TallyOverflow {
                batch: *batch,
                amount,
            })?;
        let entry = self.book.entry(vault, asset);
        entry
            .deposited
            .checked_add(amount)
            .ok_or(BalanceError::Overflow {
                vault: *vault,
                asset: *asset,
                current: entry.deposited,
                credit: amount,
            })?;
        let baseline = self.book.baseline(vault, asset);
        baseline
            .checked_add(amount)
            .ok_or(BalanceError::Overflow {
                vault: *vault,
                asset: *asset,
                current: baseline,
                credit: amount,
            })?;

        batches.record_deposit(batch, amount)?;
        let total = self.book.credit_deposited(vault, asset, amount)?;
        self.book.credit_baseline(vault, asset, amount)?;
        Ok(total)
    }

    /// Reports an intended withdrawal from a primary vault's open batch.
    ///
    /// Only the `requested` side moves; the coverage bound
    /// (`requested <= reported total`) is checked at execution so deposits
    /// and withdrawals within a batch can net against each other. Returns
    /// the entry's new `requested` figure.
    #[allow(clippy::too_many_arguments)]
    pub fn request_pull(
        &mut self,
        auth: &dyn Authorizer,
        caller: &str,
        registry: &Registry,
        batches: &mut BatchLedger,
        vault: &VaultId,
        asset: &AssetId,
        amount: u64,
        batch: &BatchId,
    ) -> Result<u64, RouterError> {
        if amount == 0 {
            return Err(RouterError::ZeroAmount);
        }
        ensure_role(auth, caller, Role::Institution)?;
        self.check_primary_flow_target(registry, batches, vault, asset, batch)?;

        let batch_record = batches.get(batch)?;
        batch_record
            .requested
            .checked_add(amount)
            .ok_or(BatchError::TallyOverflow {
                batch: *batch,
                amount,
            })?;
        let entry = self.book.entry(vault, asset);
        entry
            .requested
            .checked_add(amount)
            .ok_or(BalanceError::Overflow {
                vault: *vault,
                asset: *asset,
                current: entry.requested,
                credit: amount,
            })?;

        batches.record_request(batch, amount)?;
        let total = self.book.credit_requested(vault, asset, amount)?;
        Ok(total)
    }

    /// Moves baseline claim between two vaults of the same asset.
    ///
    /// Rebalancing only: flow entries and tallies stay untouched, because
    /// they feed receiver funding and must keep describing where requests
    /// actually originated. Returns the source's remaining baseline.
    ///
    /// # Errors
    ///
    /// `Unauthorized` unless the caller is an admin or relayer;
    /// `InsufficientVirtualBalance` if the source baseline cannot cover the
    /// amount.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer_between_vaults(
        &mut self,
        auth: &dyn Authorizer,
        caller: &str,
        registry: &Registry,
        batches: &BatchLedger,
        source: &VaultId,
        target: &VaultId,
        asset: &AssetId,
        amount: u64,
        batch: &BatchId,
    ) -> Result<u64, RouterError> {
        if amount == 0 {
            return Err(RouterError::ZeroAmount);
        }
        if !auth.is_admin(caller) && !auth.is_relayer(caller) {
            return Err(RouterError::Unauthorized {
                account: caller.to_string(),
                required: Role::Relayer,
            });
        }
        for vault in [source, target] {
            let record = registry
                .vault(vault)
                .ok_or(RegistryError::VaultNotFound(*vault))?;
            if record.asset != *asset {
                return Err(RouterError::AssetNotSupported {
                    vault: *vault,
                    asset: *asset,
                });
            }
        }
        let batch_record = batches.get(batch)?;
        if batch_record.vault != *source {
            return Err(RouterError::BatchMismatch {
                batch: *batch,
                vault: *source,
            });
        }
        if !batch_record.status.accepts_flows() {
            return Err(BatchError::InvalidState {
                batch: *batch,
                current: batch_record.status.to_string(),
                expected: "Open".to_string(),
            }
            .into());
        }

        let available = self.book.baseline(source, asset);
        if available < amount {
            return Err(BalanceError::InsufficientVirtualBalance {
                vault: *source,
                asset: *asset,
                available,
                requested: amount,
            }
            .into());
        }
        let target_baseline = self.book.baseline(target, asset);
        target_baseline
            .checked_add(amount)
            .ok_or(BalanceError::Overflow {
                vault: *target,
                asset: *asset,
                current: target_baseline,
                credit: amount,
            })?;

        let remaining = self.book.debit_baseline(source, asset, amount)?;
        self.book.credit_baseline(target, asset, amount)?;
        info!(
            source = %source,
            target = %target,
            asset = %asset,
            amount,
            "moved baseline claim between vaults"
        );
        Ok(remaining)
    }

    /// Reports a retail stake into a staking vault's open batch.
    ///
    /// The inflow is denominated in underlying token units; the share count
    /// is unknowable until settlement freezes a price. Returns the vault's
    /// new pending stake inflow.
    pub fn push_shares(
        &mut self,
        caller: &str,
        registry: &Registry,
        batches: &mut BatchLedger,
        vault: &VaultId,
        amount: u64,
        batch: &BatchId,
    ) -> Result<u64, RouterError> {
        if amount == 0 {
            return Err(RouterError::ZeroAmount);
        }
        self.check_staking_flow_target(registry, batches, vault, batch)?;

        let batch_record = batches.get(batch)?;
        batch_record
            .deposited
            .checked_add(amount)
            .ok_or(BatchError::TallyOverflow {
                batch: *batch,
                amount,
            })?;
        let flow = self.book.share_flow(vault);
        flow.stake_inflow
            .checked_add(amount)
            .ok_or(BalanceError::ShareOverflow {
                vault: *vault,
                current: flow.stake_inflow,
                credit: amount,
            })?;

        batches.record_deposit(batch, amount)?;
        let total = self.book.credit_stake_inflow(vault, amount)?;
        tracing::debug!(caller, vault = %vault, amount, "stake inflow reported");
        Ok(total)
    }

    /// Reports a retail unstake (in shares) from a staking vault's open
    /// batch. Returns the vault's new pending unstake shares.
    pub fn pull_shares(
        &mut self,
        caller: &str,
        registry: &Registry,
        batches: &mut BatchLedger,
        vault: &VaultId,
        shares: u64,
        batch: &BatchId,
    ) -> Result<u64, RouterError> {
        if shares == 0 {
            return Err(RouterError::ZeroAmount);
        }
        self.check_staking_flow_target(registry, batches, vault, batch)?;

        let batch_record = batches.get(batch)?;
        batch_record
            .requested
            .checked_add(shares)
            .ok_or(BatchError::TallyOverflow {
                batch: *batch,
                amount: shares,
            })?;
        let flow = self.book.share_flow(vault);
        flow.unstake_shares
            .checked_add(shares)
            .ok_or(BalanceError::ShareOverflow {
                vault: *vault,
                current: flow.unstake_shares,
                credit: shares,
            })?;

        batches.record_request(batch, shares)?;
        let total = self.book.credit_unstake_shares(vault, shares)?;
        tracing::debug!(caller, vault = %vault, shares, "unstake outflow reported");
        Ok(total)
    }

    /// Reverses a withdrawal intent whose request was cancelled. Only
    /// possible while the batch is still open; closed tallies are frozen
    /// settlement inputs. Returns the entry's new `requested` figure.
    #[allow(clippy::too_many_arguments)]
    pub fn rescind_pull(
        &mut self,
        auth: &dyn Authorizer,
        caller: &str,
        registry: &Registry,
        batches: &mut BatchLedger,
        vault: &VaultId,
        asset: &AssetId,
        amount: u64,
        batch: &BatchId,
    ) -> Result<u64, RouterError> {
        if amount == 0 {
            return Err(RouterError::ZeroAmount);
        }
        ensure_role(auth, caller, Role::Institution)?;
        self.check_primary_flow_target(registry, batches, vault, asset, batch)?;

        let batch_record = batches.get(batch)?;
        batch_record
            .requested
            .checked_sub(amount)
            .ok_or(BatchError::TallyUnderflow {
                batch: *batch,
                amount,
            })?;
        let entry = self.book.entry(vault, asset);
        entry
            .requested
            .checked_sub(amount)
            .ok_or(BalanceError::FlowDrift {
                vault: *vault,
                asset: *asset,
            })?;

        batches.unrecord_request(batch, amount)?;
        let total = self.book.debit_requested(vault, asset, amount)?;
        Ok(total)
    }

    /// Reverses a stake inflow whose request was cancelled while the batch
    /// was open. Returns the vault's new pending stake inflow.
    pub fn rescind_stake(
        &mut self,
        caller: &str,
        registry: &Registry,
        batches: &mut BatchLedger,
        vault: &VaultId,
        amount: u64,
        batch: &BatchId,
    ) -> Result<u64, RouterError> {
        if amount == 0 {
            return Err(RouterError::ZeroAmount);
        }
        self.check_staking_flow_target(registry, batches, vault, batch)?;

        let batch_record = batches.get(batch)?;
        batch_record
            .deposited
            .checked_sub(amount)
            .ok_or(BatchError::TallyUnderflow {
                batch: *batch,
                amount,
            })?;
        let flow = self.book.share_flow(vault);
        flow.stake_inflow
            .checked_sub(amount)
            .ok_or(BalanceError::ShareDrift { vault: *vault })?;

        batches.unrecord_deposit(batch, amount)?;
        let total = self.book.debit_stake_inflow(vault, amount)?;
        tracing::debug!(caller, vault = %vault, amount, "stake inflow rescinded");
        Ok(total)
    }

    /// Reverses an unstake outflow whose request was cancelled while the
    /// batch was open. Returns the vault's new pending unstake shares.
    pub fn rescind_unstake(
        &mut self,
        caller: &str,
        registry: &Registry,
        batches: &mut BatchLedger,
        vault: &VaultId,
        shares: u64,
        batch: &BatchId,
    ) -> Result<u64, RouterError> {
        if shares == 0 {
            return Err(RouterError::ZeroAmount);
        }
        self.check_staking_flow_target(registry, batches, vault, batch)?;

        let batch_record = batches.get(batch)?;
        batch_record
            .requested
            .checked_sub(shares)
            .ok_or(BatchError::TallyUnderflow {
                batch: *batch,
                amount: shares,
            })?;
        let flow = self.book.share_flow(vault);
        flow.unstake_shares
            .checked_sub(shares)
            .ok_or(BalanceError::ShareDrift { vault: *vault })?;

        batches.unrecord_request(batch, shares)?;
        let total = self.book.debit_unstake_shares(vault, shares)?;
        tracing::debug!(caller, vault = %vault, shares, "unstake outflow rescinded");
        Ok(total)
    }

    /// Proposes settling a closed batch against a custodian-reported total.
    ///
    /// The router derives everything it distrusts: netting comes from the
    /// batch's frozen tallies and yield from the delta between
    /// `reported_total` and the vault baseline. The derived delta must sit
    /// within `min(configured tolerance, hard ceiling)` of the baseline,
    /// checked exactly (a delta landing on the boundary is accepted). When
    /// the vault has attached adapters the caller passes their summed
    /// `total_assets` for cross-checking.
    ///
    /// # Errors
    ///
    /// `Unauthorized` (relayer role), `ProposalPending` if the batch
    /// already has a live proposal, `BaselineEmpty`, `YieldOutOfTolerance`,
    /// `AdapterMismatch`, and batch-state errors unless the batch is
    /// closed.
    #[allow(clippy::too_many_arguments)]
    pub fn propose_settle_batch(
        &mut self,
        auth: &dyn Authorizer,
        caller: &str,
        config: &ProtocolConfig,
        registry: &Registry,
        batches: &BatchLedger,
        adapter_total: Option<u64>,
        vault: &VaultId,
        asset: &AssetId,
        batch: &BatchId,
        reported_total: u64,
        now: DateTime<Utc>,
    ) -> Result<ProposalId, RouterError> {
        ensure_role(auth, caller, Role::Relayer)?;
        let vault_record = registry
            .vault(vault)
            .ok_or(RegistryError::VaultNotFound(*vault))?;
        if vault_record.asset != *asset {
            return Err(RouterError::AssetNotSupported {
                vault: *vault,
                asset: *asset,
            });
        }
        let batch_record = batches.get(batch)?;
        if batch_record.vault != *vault || batch_record.asset != *asset {
            return Err(RouterError::BatchMismatch {
                batch: *batch,
                vault: *vault,
            });
        }
        if !batch_record.status.allows_settlement() {
            return Err(BatchError::InvalidState {
                batch: *batch,
                current: batch_record.status.to_string(),
                expected: "Closed".to_string(),
            }
            .into());
        }
        if let Some(existing) = self.active_by_batch.get(batch) {
            return Err(RouterError::ProposalPending {
                batch: *batch,
                existing: *existing,
            });
        }
        if let Some(total) = adapter_total {
            if total != reported_total {
                return Err(RouterError::AdapterMismatch {
                    vault: *vault,
                    reported: reported_total,
                    adapter_total: total,
                });
            }
        }

        let baseline = self.book.baseline(vault, asset);
        let (yield_amount, is_profit) = if reported_total >= baseline {
            (reported_total - baseline, true)
        } else {
            (baseline - reported_total, false)
        };
        if baseline == 0 {
            if reported_total != 0 {
                return Err(RouterError::BaselineEmpty {
                    vault: *vault,
                    reported: reported_total,
                });
            }
        } else if yield_amount > 0 {
            let limit_bps = config.effective_tolerance_bps();
            // Exact boundary check: delta/baseline <= limit/scale without
            // the precision loss of an intermediate division.
            let lhs = u128::from(yield_amount) * u128::from(BPS_SCALE);
            let rhs = u128::from(baseline) * u128::from(limit_bps);
            if lhs > rhs {
                let delta_bps =
                    u64::try_from(lhs / u128::from(baseline)).unwrap_or(u64::MAX);
                return Err(RouterError::YieldOutOfTolerance {
                    vault: *vault,
                    delta_bps,
                    limit_bps,
                });
            }
        }

        let id = ProposalId::derive(vault, batch, asset, self.proposal_nonce);
        self.proposals.insert(
            id,
            SettlementProposal {
                id,
                vault: *vault,
                asset: *asset,
                batch: *batch,
                reported_total,
                deposited: batch_record.deposited,
                requested: batch_record.requested,
                yield_amount,
                is_profit,
                proposed_by: caller.to_string(),
                proposed_at: now,
                execute_after: now + config.cooldown(),
                status: ProposalStatus::Proposed,
                resolved_at: None,
            },
        );
        self.active_by_batch.insert(*batch, id);
        self.proposal_nonce += 1;

        info!(
            proposal = %id,
            vault = %vault,
            batch = %batch,
            reported_total,
            yield_amount,
            is_profit,
            "settlement proposed"
        );
        Ok(id)
    }

    /// Cancels a pending proposal. Guardian circuit breaker: terminal for
    /// the proposal, and frees its batch for a fresh one.
    pub fn cancel_proposal(
        &mut self,
        auth: &dyn Authorizer,
        caller: &str,
        proposal_id: &ProposalId,
        now: DateTime<Utc>,
    ) -> Result<(), RouterError> {
        ensure_role(auth, caller, Role::Guardian)?;
        let proposal = self
            .proposals
            .get(proposal_id)
            .ok_or(RouterError::ProposalNotFound(*proposal_id))?;
        match proposal.status {
            ProposalStatus::Executed => {
                return Err(RouterError::ProposalAlreadyExecuted(*proposal_id))
            }
            ProposalStatus::Cancelled => {
                return Err(RouterError::ProposalCancelled(*proposal_id))
            }
            ProposalStatus::Proposed => {}
        }
        let batch = proposal.batch;
        if let Some(proposal) = self.proposals.get_mut(proposal_id) {
            proposal.status = ProposalStatus::Cancelled;
            proposal.resolved_at = Some(now);
        }
        self.active_by_batch.remove(&batch);

        info!(proposal = %proposal_id, guardian = caller, "settlement proposal cancelled");
        Ok(())
    }

    /// Executes a matured proposal, settling its batch.
    ///
    /// Anyone may call this; the authorization already happened when the
    /// relayer proposed and the guardian declined to cancel. On the primary
    /// rail the derived yield mints to (or burns from) the vault's yield
    /// recipient, the batch's withdrawal total is set aside in its
    /// receiver, and the baseline rebases net of it. On the staking rail
    /// the batch freezes a share price and no supply moves.
    ///
    /// # Errors
    ///
    /// `CooldownNotElapsed` before `execute_after` (recoverable),
    /// `ProposalAlreadyExecuted` / `ProposalCancelled` on terminal
    /// proposals, `RequestedExceedsReported`, `GatewayNotConfigured`,
    /// `InsufficientYieldReserve`, and batch-state errors if the batch
    /// is no longer closed or settles out of order. A failure changes
    /// nothing.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_settle_batch(
        &mut self,
        caller: &str,
        config: &ProtocolConfig,
        registry: &Registry,
        batches: &mut BatchLedger,
        tokens: &mut TokenLedger,
        receivers: &mut ReceiverRegistry,
        proposal_id: &ProposalId,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, RouterError> {
        // Validation pass: read everything, mutate nothing.
        let proposal = self
            .proposals
            .get(proposal_id)
            .ok_or(RouterError::ProposalNotFound(*proposal_id))?;
        match proposal.status {
            ProposalStatus::Executed => {
                return Err(RouterError::ProposalAlreadyExecuted(*proposal_id))
            }
            ProposalStatus::Cancelled => {
                return Err(RouterError::ProposalCancelled(*proposal_id))
            }
            ProposalStatus::Proposed => {}
        }
        if now < proposal.execute_after {
            return Err(RouterError::CooldownNotElapsed {
                proposal: *proposal_id,
                ready_at: proposal.execute_after,
            });
        }
        let vault = proposal.vault;
        let asset = proposal.asset;
        let batch = proposal.batch;
        let reported = proposal.reported_total;
        let yield_amount = proposal.yield_amount;
        let is_profit = proposal.is_profit;

        batches.ensure_settleable(&batch)?;
        let batch_record = batches.get(&batch)?;
        let deposited = batch_record.deposited;
        let requested = batch_record.requested;
        let vault_record = registry
            .vault(&vault)
            .ok_or(RegistryError::VaultNotFound(vault))?;
        let kind = vault_record.kind;
        let baseline = self.book.baseline(&vault, &asset);

        match kind {
            VaultKind::Primary => {
                if requested > reported {
                    return Err(RouterError::RequestedExceedsReported {
                        batch,
                        requested,
                        reported,
                    });
                }
                let gateway = if requested > 0 {
                    Some(
                        vault_record
                            .gateway
                            .clone()
                            .ok_or(RouterError::GatewayNotConfigured { vault })?,
                    )
                } else {
                    None
                };
                let recipient = vault_record
                    .yield_recipient
                    .clone()
                    .unwrap_or_else(|| config.treasury.clone());
                if yield_amount > 0 && !is_profit {
                    let available = tokens.balance_of(&asset, &recipient);
                    if available < yield_amount {
                        return Err(RouterError::InsufficientYieldReserve {
                            recipient,
                            available,
                            needed: yield_amount,
                        });
                    }
                }

                // The baseline rebases by delta, not to an absolute figure,
                // so deposits reported into a successor batch during the
                // cooldown survive: baseline' = baseline + yield - set-aside.
                let mut next = i128::from(baseline);
                next += signed(yield_amount, is_profit);
                next -= i128::from(requested);
                let new_baseline = u64::try_from(next)
                    .map_err(|_| RouterError::BaselineOverflow { vault })?;

                // Mutation pass. The token ledger step is the only one that
                // can fail on its own checks, so it goes first.
                let yield_recipient = if yield_amount > 0 {
                    if is_profit {
                        tokens.mint(asset, &recipient, yield_amount)?;
                    } else {
                        tokens.burn(asset, &recipient, yield_amount)?;
                    }
                    Some(recipient)
                } else {
                    None
                };
                batches.settle(&batch, None, now)?;
                self.book.settle_flows(&vault, &asset, deposited, requested)?;
                self.book.rebase(&vault, &asset, new_baseline);
                if let Some(gateway) = &gateway {
                    receivers.initialize(batch, asset, gateway, now)?;
                    receivers.fund(&batch, requested)?;
                }
                self.resolve_executed(proposal_id, &batch, now);

                let outcome = SettlementOutcome {
                    proposal: *proposal_id,
                    vault,
                    asset,
                    batch,
                    kind,
                    reported_total: reported,
                    deposited,
                    requested,
                    yield_amount,
                    is_profit,
                    yield_recipient,
                    receiver_funded: requested,
                    pricing: None,
                    new_baseline,
                };
                info!(
                    proposal = %proposal_id,
                    vault = %vault,
                    batch = %batch,
                    executor = caller,
                    yield_amount,
                    is_profit,
                    receiver_funded = requested,
                    new_baseline,
                    "primary settlement executed"
                );
                Ok(outcome)
            }
            VaultKind::Staking => {
                let share_asset = vault_record
                    .share_asset
                    .ok_or(RouterError::ShareAssetMissing { vault })?;
                let pricing = BatchPricing {
                    total_assets: reported,
                    total_shares: tokens.total_supply(&share_asset),
                };
                // Value of the batch's unstaked shares at the frozen price:
                // it leaves the pool when those claims are paid.
                let unstake_value = pricing
                    .assets_for_shares(requested)
                    .ok_or(RouterError::ConversionOverflow { vault })?;

                let mut next = i128::from(baseline);
                next += signed(yield_amount, is_profit);
                next += i128::from(deposited);
                next -= i128::from(unstake_value);
                let new_baseline = u64::try_from(next)
                    .map_err(|_| RouterError::BaselineOverflow { vault })?;

                // Mutation pass: no supply moves on this rail, yield shows
                // up as price appreciation only.
                batches.settle(&batch, Some(pricing), now)?;
                self.book.settle_share_flow(&vault, deposited, requested)?;
                self.book.rebase(&vault, &asset, new_baseline);
                self.resolve_executed(proposal_id, &batch, now);

                let outcome = SettlementOutcome {
                    proposal: *proposal_id,
                    vault,
                    asset,
                    batch,
                    kind,
                    reported_total: reported,
                    deposited,
                    requested,
                    yield_amount,
                    is_profit,
                    yield_recipient: None,
                    receiver_funded: 0,
                    pricing: Some(pricing),
                    new_baseline,
                };
                info!(
                    proposal = %proposal_id,
                    vault = %vault,
                    batch = %batch,
                    executor = caller,
                    frozen_assets = pricing.total_assets,
                    frozen_shares = pricing.total_shares,
                    new_baseline,
                    "staking settlement executed"
                );
                Ok(outcome)
            }
        }
    }

    /// Marks a proposal executed and frees its batch slot.
    fn resolve_executed(&mut self, proposal_id: &ProposalId, batch: &BatchId, now: DateTime<Utc>) {
        if let Some(proposal) = self.proposals.get_mut(proposal_id) {
            proposal.status = ProposalStatus::Executed;
            proposal.resolved_at = Some(now);
        }
        self.active_by_batch.remove(batch);
    }

    /// Shared validation for institutional flow reports: the vault must be
    /// a primary vault for the asset and the batch its own, open batch.
    fn check_primary_flow_target(
        &self,
        registry: &Registry,
        batches: &BatchLedger,
        vault: &VaultId,
        asset: &AssetId,
        batch: &BatchId,
    ) -> Result<(), RouterError> {
        let vault_record = registry
            .vault(vault)
            .ok_or(RegistryError::VaultNotFound(*vault))?;
        if vault_record.kind != VaultKind::Primary {
            return Err(RouterError::VaultKindMismatch {
                vault: *vault,
                expected: VaultKind::Primary,
            });
        }
        if vault_record.asset != *asset {
            return Err(RouterError::AssetNotSupported {
                vault: *vault,
                asset: *asset,
            });
        }
        let batch_record = batches.get(batch)?;
        if batch_record.vault != *vault {
            return Err(RouterError::BatchMismatch {
                batch: *batch,
                vault: *vault,
            });
        }
        if !batch_record.status.accepts_flows() {
            return Err(BatchError::InvalidState {
                batch: *batch,
                current: batch_record.status.to_string(),
                expected: "Open".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Shared validation for retail flow reports.
    fn check_staking_flow_target(
        &self,
        registry: &Registry,
        batches: &BatchLedger,
        vault: &VaultId,
        batch: &BatchId,
    ) -> Result<(), RouterError> {
        let vault_record = registry
            .vault(vault)
            .ok_or(RegistryError::VaultNotFound(*vault))?;
        if vault_record.kind != VaultKind::Staking {
            return Err(RouterError::VaultKindMismatch {
                vault: *vault,
                expected: VaultKind::Staking,
            });
        }
        let batch_record = batches.get(batch)?;
        if batch_record.vault != *vault {
            return Err(RouterError::BatchMismatch {
                batch: *batch,
                vault: *vault,
            });
        }
        if !batch_record.status.accepts_flows() {
            return Err(BatchError::InvalidState {
                batch: *batch,
                current: batch_record.status.to_string(),
                expected: "Open".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// A magnitude/direction pair as a signed figure.
fn signed(amount: u64, positive: bool) -> i128 {
    if positive {
        i128::from(amount)
    } else {
        -i128::from(amount)
    }
}

/// Checks a role and reports the caller on failure.
fn ensure_role(auth: &dyn Authorizer, account: &str, role: Role) -> Result<(), RouterError> {
    if !auth.has_role(account, role) {
        return Err(RouterError::Unauthorized {
            account: account.to_string(),
            required: role,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
