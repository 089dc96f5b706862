//! The retail gateway: two-phase staking with batch-frozen pricing.
//!
//! One `StakingVault` fronts one staking vault in the registry. Anyone
//! holding the issued token can stake it; the tokens move into the
//! vault's escrow account and the inflow is reported into the open
//! batch. When that batch settles, the settlement freezes a
//! (`total_assets`, `total_shares`) pair, and every claim against the
//! batch converts at that pair — claim order never changes anyone's
//! rate. Claimed principal moves from escrow into the vault's pool
//! account, where it backs the shares until an unstake pulls it out.
//!
//! Yield on this rail never mints: the custodian's reported totals grow
//! the frozen `total_assets` side, so the share price appreciates and
//! supply stays put.
//!
//! Conversions widen to `u128` and round down; the dust stays in the
//! pool, where it benefits remaining share holders rather than leaking.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use cairn_protocol::batch::{BatchError, BatchStatus};
use cairn_protocol::config::ACCOUNT_PREFIX;
use cairn_protocol::ids::{AssetId, BatchId, RequestId, VaultId};
use cairn_protocol::router::RouterError;
use cairn_protocol::state::CoreState;
use cairn_protocol::token::TokenError;

use crate::requests::{RequestStatus, StakeRequest, UnstakeRequest};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the retail gateway.
#[derive(Debug, Error)]
pub enum StakingError {
    /// The vault has no open batch to ride.
    #[error("vault {vault} has no open batch")]
    NoOpenBatch {
        /// The fronted vault.
        vault: VaultId,
    },

    /// The request id is unknown to this gateway.
    #[error("staking request not found: {0}")]
    RequestNotFound(RequestId),

    /// The request has already been completed or cancelled.
    #[error("staking request {request} is {status}, expected pending")]
    RequestNotPending {
        /// The addressed request.
        request: RequestId,
        /// Its current status.
        status: RequestStatus,
    },

    /// Only the requester may cancel its request.
    #[error("account {caller} cannot act on a request made by {requester}")]
    NotRequester {
        /// Who tried.
        caller: String,
        /// Who may.
        requester: String,
    },

    /// Claims need the request's batch settled first.
    #[error("batch {batch} is {status}; claims convert only after settlement")]
    BatchNotSettled {
        /// The request's batch.
        batch: BatchId,
        /// The batch's current status.
        status: BatchStatus,
    },

    /// Cancellation works only while the request's batch is still open.
    #[error("batch {batch} is {status}; requests cancel only while it is open")]
    BatchNoLongerOpen {
        /// The request's batch.
        batch: BatchId,
        /// The batch's current status.
        status: BatchStatus,
    },

    /// The settled batch carries no frozen pricing.
    #[error("batch {batch} settled without frozen pricing")]
    PricingMissing {
        /// The request's batch.
        batch: BatchId,
    },

    /// The frozen ratio pushed the conversion past `u64`.
    #[error("share conversion overflow for request {request}")]
    ConversionOverflow {
        /// The claiming request.
        request: RequestId,
    },

    /// A share-flow report was rejected by the router.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// A ledger move was rejected.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// A batch lookup failed.
    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// Outcome of [`StakingVault::cancel_request`]: which rail the cancelled
/// request was on, with its final record.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelledRequest {
    /// A stake was withdrawn; the escrowed tokens went back.
    Stake(StakeRequest),
    /// An unstake was withdrawn; the escrowed shares went back.
    Unstake(UnstakeRequest),
}

// ---------------------------------------------------------------------------
// StakingVault
// ---------------------------------------------------------------------------

/// Gateway state for one staking vault.
#[derive(Debug)]
pub struct StakingVault {
    /// The fronted staking vault.
    vault: VaultId,
    /// The underlying asset (the staked token's ledger key).
    asset: AssetId,
    /// The share token minted against the pool.
    share_asset: AssetId,
    /// Ledger account holding tokens and shares of pending requests.
    escrow: String,
    /// Ledger account holding claimed principal, backing live shares.
    pool: String,
    /// Stake requests, live and resolved.
    stakes: HashMap<RequestId, StakeRequest>,
    /// Unstake requests, live and resolved.
    unstakes: HashMap<RequestId, UnstakeRequest>,
    /// Monotonic disambiguator folded into request ids.
    next_request: u64,
}

impl StakingVault {
    /// Creates a gateway for `vault`, deriving its escrow and pool
    /// accounts from the vault's registered name.
    pub fn new(vault: VaultId, asset: AssetId, share_asset: AssetId, name: &str) -> Self {
        Self {
            vault,
            asset,
            share_asset,
            escrow: format!("{ACCOUNT_PREFIX}:vault:{name}:escrow"),
            pool: format!("{ACCOUNT_PREFIX}:vault:{name}:pool"),
            stakes: HashMap::new(),
            unstakes: HashMap::new(),
            next_request: 0,
        }
    }

    // -- Operations ----------------------------------------------------------

    /// Opens a stake: escrows `amount` of the caller's tokens and reports
    /// the inflow into the vault's open batch. Permissionless.
    ///
    /// Returns the pending request record; shares mint to `recipient` at
    /// claim time, at the batch's frozen price.
    pub fn request_stake(
        &mut self,
        caller: &str,
        core: &mut CoreState,
        recipient: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<StakeRequest, StakingError> {
        let batch = self.open_batch_of(core)?;
        self.ensure_balance(core, &self.asset, caller, amount)?;

        let CoreState {
            registry,
            tokens,
            batches,
            router,
            ..
        } = core;
        router.push_shares(caller, registry, batches, &self.vault, amount, &batch)?;
        tokens.transfer(self.asset, caller, &self.escrow, amount)?;

        let id = RequestId::derive(caller, amount, now.timestamp_micros(), self.next_request);
        self.next_request += 1;
        let request = StakeRequest {
            id,
            vault: self.vault,
            asset: self.asset,
            batch,
            requester: caller.to_string(),
            recipient: recipient.to_string(),
            amount,
            status: RequestStatus::Pending,
            created_at: now,
            resolved_at: None,
        };
        self.stakes.insert(id, request.clone());

        info!(
            vault = %self.vault,
            batch = %batch,
            request = %id,
            staker = caller,
            amount,
            "stake requested"
        );
        Ok(request)
    }

    /// Opens an unstake: escrows `shares` of the caller's share tokens
    /// and reports the outflow into the vault's open batch.
    pub fn request_unstake(
        &mut self,
        caller: &str,
        core: &mut CoreState,
        recipient: &str,
        shares: u64,
        now: DateTime<Utc>,
    ) -> Result<UnstakeRequest, StakingError> {
        let batch = self.open_batch_of(core)?;
        self.ensure_balance(core, &self.share_asset, caller, shares)?;

        let CoreState {
            registry,
            tokens,
            batches,
            router,
            ..
        } = core;
        router.pull_shares(caller, registry, batches, &self.vault, shares, &batch)?;
        tokens.transfer(self.share_asset, caller, &self.escrow, shares)?;

        let id = RequestId::derive(caller, shares, now.timestamp_micros(), self.next_request);
        self.next_request += 1;
        let request = UnstakeRequest {
            id,
            vault: self.vault,
            share_asset: self.share_asset,
            batch,
            requester: caller.to_string(),
            recipient: recipient.to_string(),
            shares,
            status: RequestStatus::Pending,
            created_at: now,
            resolved_at: None,
        };
        self.unstakes.insert(id, request.clone());

        info!(
            vault = %self.vault,
            batch = %batch,
            request = %id,
            staker = caller,
            shares,
            "unstake requested"
        );
        Ok(request)
    }

    /// Claims a settled stake: converts the escrowed amount at the
    /// batch's frozen price, moves the principal into the pool, and
    /// mints shares to the recorded recipient.
    ///
    /// Permissionless — anyone may crank a claim; the shares always go
    /// to the recipient named at request time. Returns the completed
    /// record and the share count minted.
    pub fn claim_staked_shares(
        &mut self,
        core: &mut CoreState,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<(StakeRequest, u64), StakingError> {
        let request = self
            .stakes
            .get(request_id)
            .ok_or(StakingError::RequestNotFound(*request_id))?;
        if !request.status.is_pending() {
            return Err(StakingError::RequestNotPending {
                request: *request_id,
                status: request.status,
            });
        }
        let pricing = self.frozen_pricing(core, &request.batch)?;
        let shares = pricing
            .shares_for_assets(request.amount)
            .ok_or(StakingError::ConversionOverflow {
                request: *request_id,
            })?;
        let (batch, amount, recipient) =
            (request.batch, request.amount, request.recipient.clone());

        // The mint comes after the pool transfer, so it must be
        // impossible to fail by then.
        core.tokens
            .total_supply(&self.share_asset)
            .checked_add(shares)
            .ok_or(TokenError::SupplyOverflow { amount: shares })?;

        core.tokens.transfer(self.asset, &self.escrow, &self.pool, amount)?;
        core.tokens.mint(self.share_asset, &recipient, shares)?;

        let request = self
            .stakes
            .get_mut(request_id)
            .ok_or(StakingError::RequestNotFound(*request_id))?;
        request.status = RequestStatus::Completed;
        request.resolved_at = Some(now);

        info!(
            vault = %self.vault,
            batch = %batch,
            request = %request_id,
            recipient,
            amount,
            shares,
            "stake claimed"
        );
        Ok((request.clone(), shares))
    }

    /// Claims a settled unstake: converts the escrowed shares at the
    /// batch's frozen price, burns them, and pays the underlying out of
    /// the pool to the recorded recipient.
    ///
    /// Permissionless. Returns the completed record and the asset amount
    /// paid out.
    pub fn claim_unstaked_assets(
        &mut self,
        core: &mut CoreState,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<(UnstakeRequest, u64), StakingError> {
        let request = self
            .unstakes
            .get(request_id)
            .ok_or(StakingError::RequestNotFound(*request_id))?;
        if !request.status.is_pending() {
            return Err(StakingError::RequestNotPending {
                request: *request_id,
                status: request.status,
            });
        }
        let pricing = self.frozen_pricing(core, &request.batch)?;
        let assets = pricing
            .assets_for_shares(request.shares)
            .ok_or(StakingError::ConversionOverflow {
                request: *request_id,
            })?;
        let (batch, shares, recipient) =
            (request.batch, request.shares, request.recipient.clone());

        // The payout comes after the burn, so it must be impossible to
        // fail by then: check the pool's balance up front.
        self.ensure_balance(core, &self.asset, &self.pool, assets)?;
        core.tokens.burn(self.share_asset, &self.escrow, shares)?;
        core.tokens.transfer(self.asset, &self.pool, &recipient, assets)?;

        let request = self
            .unstakes
            .get_mut(request_id)
            .ok_or(StakingError::RequestNotFound(*request_id))?;
        request.status = RequestStatus::Completed;
        request.resolved_at = Some(now);

        info!(
            vault = %self.vault,
            batch = %batch,
            request = %request_id,
            recipient,
            shares,
            assets,
            "unstake claimed"
        );
        Ok((request.clone(), assets))
    }

    /// Cancels a pending stake or unstake while its batch is still open:
    /// rescinds the flow report and returns the escrowed tokens or
    /// shares.
    pub fn cancel_request(
        &mut self,
        caller: &str,
        core: &mut CoreState,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<CancelledRequest, StakingError> {
        if self.stakes.contains_key(request_id) {
            return self.cancel_stake(caller, core, request_id, now);
        }
        if self.unstakes.contains_key(request_id) {
            return self.cancel_unstake(caller, core, request_id, now);
        }
        Err(StakingError::RequestNotFound(*request_id))
    }

    fn cancel_stake(
        &mut self,
        caller: &str,
        core: &mut CoreState,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<CancelledRequest, StakingError> {
        let request = self
            .stakes
            .get(request_id)
            .ok_or(StakingError::RequestNotFound(*request_id))?;
        self.ensure_cancellable(
            core,
            request.status,
            &request.requester,
            request.batch,
            caller,
            *request_id,
        )?;
        let (batch, amount) = (request.batch, request.amount);

        let CoreState {
            registry,
            tokens,
            batches,
            router,
            ..
        } = core;
        router.rescind_stake(caller, registry, batches, &self.vault, amount, &batch)?;
        tokens.transfer(self.asset, &self.escrow, caller, amount)?;

        let request = self
            .stakes
            .get_mut(request_id)
            .ok_or(StakingError::RequestNotFound(*request_id))?;
        request.status = RequestStatus::Cancelled;
        request.resolved_at = Some(now);

        info!(
            vault = %self.vault,
            batch = %batch,
            request = %request_id,
            staker = caller,
            amount,
            "stake cancelled"
        );
        Ok(CancelledRequest::Stake(request.clone()))
    }

    fn cancel_unstake(
        &mut self,
        caller: &str,
        core: &mut CoreState,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<CancelledRequest, StakingError> {
        let request = self
            .unstakes
            .get(request_id)
            .ok_or(StakingError::RequestNotFound(*request_id))?;
        self.ensure_cancellable(
            core,
            request.status,
            &request.requester,
            request.batch,
            caller,
            *request_id,
        )?;
        let (batch, shares) = (request.batch, request.shares);

        let CoreState {
            registry,
            tokens,
            batches,
            router,
            ..
        } = core;
        router.rescind_unstake(caller, registry, batches, &self.vault, shares, &batch)?;
        tokens.transfer(self.share_asset, &self.escrow, caller, shares)?;

        let request = self
            .unstakes
            .get_mut(request_id)
            .ok_or(StakingError::RequestNotFound(*request_id))?;
        request.status = RequestStatus::Cancelled;
        request.resolved_at = Some(now);

        info!(
            vault = %self.vault,
            batch = %batch,
            request = %request_id,
            staker = caller,
            shares,
            "unstake cancelled"
        );
        Ok(CancelledRequest::Unstake(request.clone()))
    }

    // -- Journal restore -----------------------------------------------------

    /// Re-inserts a stake record during journal restore.
    pub(crate) fn restore_stake(&mut self, request: StakeRequest) {
        self.stakes.insert(request.id, request);
        self.next_request += 1;
    }

    /// Re-inserts an unstake record during journal restore.
    pub(crate) fn restore_unstake(&mut self, request: UnstakeRequest) {
        self.unstakes.insert(request.id, request);
        self.next_request += 1;
    }

    /// Marks a restored stake resolved during journal restore.
    pub(crate) fn restore_stake_resolution(
        &mut self,
        request_id: &RequestId,
        status: RequestStatus,
        at: DateTime<Utc>,
    ) {
        if let Some(request) = self.stakes.get_mut(request_id) {
            request.status = status;
            request.resolved_at = Some(at);
        }
    }

    /// Marks a restored unstake resolved during journal restore.
    pub(crate) fn restore_unstake_resolution(
        &mut self,
        request_id: &RequestId,
        status: RequestStatus,
        at: DateTime<Utc>,
    ) {
        if let Some(request) = self.unstakes.get_mut(request_id) {
            request.status = status;
            request.resolved_at = Some(at);
        }
    }

    // -- Read access ---------------------------------------------------------

    /// The fronted vault.
    pub fn vault(&self) -> VaultId {
        self.vault
    }

    /// The underlying asset.
    pub fn asset(&self) -> AssetId {
        self.asset
    }

    /// The share token.
    pub fn share_asset(&self) -> AssetId {
        self.share_asset
    }

    /// The escrow account pending requests sit in.
    pub fn escrow_account(&self) -> &str {
        &self.escrow
    }

    /// The pool account backing live shares.
    pub fn pool_account(&self) -> &str {
        &self.pool
    }

    /// A stake request by id.
    pub fn stake(&self, id: &RequestId) -> Option<&StakeRequest> {
        self.stakes.get(id)
    }

    /// An unstake request by id.
    pub fn unstake(&self, id: &RequestId) -> Option<&UnstakeRequest> {
        self.unstakes.get(id)
    }

    /// All stake requests, in no particular order.
    pub fn stakes(&self) -> impl Iterator<Item = &StakeRequest> {
        self.stakes.values()
    }

    /// All unstake requests, in no particular order.
    pub fn unstakes(&self) -> impl Iterator<Item = &UnstakeRequest> {
        self.unstakes.values()
    }

    /// Number of requests still pending, both rails.
    pub fn pending_count(&self) -> usize {
        self.stakes.values().filter(|r| r.status.is_pending()).count()
            + self.unstakes.values().filter(|r| r.status.is_pending()).count()
    }

    // -- Shared checks -------------------------------------------------------

    fn open_batch_of(&self, core: &CoreState) -> Result<BatchId, StakingError> {
        core.batches
            .open_id_of(&self.vault)
            .ok_or(StakingError::NoOpenBatch { vault: self.vault })
    }

    fn frozen_pricing(
        &self,
        core: &CoreState,
        batch: &BatchId,
    ) -> Result<cairn_protocol::batch::BatchPricing, StakingError> {
        let record = core.batches.get(batch)?;
        if record.status != BatchStatus::Settled {
            return Err(StakingError::BatchNotSettled {
                batch: *batch,
                status: record.status,
            });
        }
        record
            .pricing
            .ok_or(StakingError::PricingMissing { batch: *batch })
    }

    fn ensure_balance(
        &self,
        core: &CoreState,
        asset: &AssetId,
        account: &str,
        amount: u64,
    ) -> Result<(), StakingError> {
        let balance = core.tokens.balance_of(asset, account);
        if balance < amount {
            return Err(TokenError::InsufficientBalance {
                account: account.to_string(),
                balance,
                amount,
            }
            .into());
        }
        Ok(())
    }

    fn ensure_cancellable(
        &self,
        core: &CoreState,
        status: RequestStatus,
        requester: &str,
        batch: BatchId,
        caller: &str,
        request_id: RequestId,
    ) -> Result<(), StakingError> {
        if !status.is_pending() {
            return Err(StakingError::RequestNotPending {
                request: request_id,
                status,
            });
        }
        if requester != caller {
            return Err(StakingError::NotRequester {
                caller: caller.to_string(),
                requester: requester.to_string(),
            });
        }
        let batch_status = core.batches.get(&batch)?.status;
        if batch_status != BatchStatus::Open {
            return Err(StakingError::BatchNoLongerOpen {
                batch,
                status: batch_status,
            });
        }
        Ok(())
    }
}
