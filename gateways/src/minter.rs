//! The institutional gateway: mint on custody deposit, redeem through
//! escrow.
//!
//! One minter fronts one primary vault. Whitelisted institutions wire
//! assets to the custodian, then mint the issued token 1:1 against the
//! deposit they report. Redemption is two-phase: the tokens move into the
//! gateway's escrow account and a pull is reported into the open batch;
//! once that batch settles, the gateway claims the set-aside custody from
//! the batch receiver, burns the escrowed tokens, and pays the
//! institution off-ledger. Until the batch closes, the institution can
//! cancel and take its tokens back.
//!
//! The minter never touches custody itself — it reports flows through
//! the router and moves tokens on the ledger, and the supply/baseline
//! bookkeeping falls out of those calls.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use cairn_protocol::batch::{BatchError, BatchStatus, ReceiverError};
use cairn_protocol::ids::{AssetId, BatchId, RequestId, VaultId};
use cairn_protocol::registry::Authorizer;
use cairn_protocol::router::RouterError;
use cairn_protocol::state::CoreState;
use cairn_protocol::token::TokenError;

use crate::requests::{RedeemRequest, RequestStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the institutional gateway.
#[derive(Debug, Error)]
pub enum MinterError {
    /// The vault has no open batch to ride.
    #[error("vault {vault} has no open batch")]
    NoOpenBatch {
        /// The fronted vault.
        vault: VaultId,
    },

    /// The request id is unknown to this gateway.
    #[error("redeem request not found: {0}")]
    RequestNotFound(RequestId),

    /// The request has already been completed or cancelled.
    #[error("redeem request {request} is {status}, expected pending")]
    RequestNotPending {
        /// The addressed request.
        request: RequestId,
        /// Its current status.
        status: RequestStatus,
    },

    /// Only the requesting institution may cancel its request.
    #[error("account {caller} cannot act on a request made by {requester}")]
    NotRequester {
        /// Who tried.
        caller: String,
        /// Who may.
        requester: String,
    },

    /// Completion needs the request's batch settled first.
    #[error("batch {batch} is {status}; redemption completes only after settlement")]
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

    /// A flow report was rejected by the router.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// A ledger move was rejected.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// A custody claim was rejected by the batch receiver.
    #[error(transparent)]
    Receiver(#[from] ReceiverError),

    /// A batch lookup failed.
    #[error(transparent)]
    Batch(#[from] BatchError),
}

// ---------------------------------------------------------------------------
// InstitutionalMinter
// ---------------------------------------------------------------------------

/// Gateway state for one primary vault.
#[derive(Debug)]
pub struct InstitutionalMinter {
    /// The fronted primary vault.
    vault: VaultId,
    /// The vault's asset (and the issued token's ledger key).
    asset: AssetId,
    /// Gateway operator account; the only claimant batch receivers accept.
    gateway: String,
    /// Ledger account holding tokens of pending redemptions.
    escrow: String,
    /// Redemption requests, live and resolved.
    requests: HashMap<RequestId, RedeemRequest>,
    /// Monotonic disambiguator folded into request ids.
    next_request: u64,
}

impl InstitutionalMinter {
    /// Creates a gateway for `vault`, deriving the escrow account from
    /// the gateway operator account.
    pub fn new(vault: VaultId, asset: AssetId, gateway: &str) -> Self {
        Self {
            vault,
            asset,
            gateway: gateway.to_string(),
            escrow: format!("{gateway}:escrow"),
            requests: HashMap::new(),
            next_request: 0,
        }
    }

    // -- Operations ----------------------------------------------------------

    /// Mints `amount` of the issued token to `recipient` against a
    /// custody deposit reported into the vault's open batch.
    ///
    /// The caller must hold the institution role; the router enforces it.
    /// Returns the batch the deposit rode in.
    ///
    /// # Errors
    ///
    /// Fails if the vault has no open batch, the caller is not an
    /// institution, or the mint would overflow supply or the recipient's
    /// balance.
    pub fn mint(
        &self,
        auth: &dyn Authorizer,
        caller: &str,
        core: &mut CoreState,
        recipient: &str,
        amount: u64,
    ) -> Result<BatchId, MinterError> {
        let batch = self.open_batch_of(core)?;

        // Dry-run the ledger side so a late overflow cannot strand the
        // flow report.
        core.tokens
            .total_supply(&self.asset)
            .checked_add(amount)
            .ok_or(TokenError::SupplyOverflow { amount })?;
        core.tokens
            .balance_of(&self.asset, recipient)
            .checked_add(amount)
            .ok_or_else(|| TokenError::BalanceOverflow {
                account: recipient.to_string(),
                amount,
            })?;

        let CoreState {
            registry,
            tokens,
            batches,
            router,
            ..
        } = core;
        router.push_assets(
            auth,
            caller,
            registry,
            batches,
            &self.vault,
            &self.asset,
            amount,
            &batch,
        )?;
        tokens.mint(self.asset, recipient, amount)?;

        info!(
            vault = %self.vault,
            batch = %batch,
            institution = caller,
            recipient,
            amount,
            "institutional mint"
        );
        Ok(batch)
    }

    /// Opens a redemption: escrows `amount` of the caller's tokens and
    /// reports the pull into the vault's open batch.
    ///
    /// Returns the pending request record.
    pub fn request_redeem(
        &mut self,
        auth: &dyn Authorizer,
        caller: &str,
        core: &mut CoreState,
        recipient: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<RedeemRequest, MinterError> {
        let batch = self.open_batch_of(core)?;

        // The escrow transfer comes after the flow report, so it must be
        // impossible by then: check the caller's balance up front.
        let balance = core.tokens.balance_of(&self.asset, caller);
        if balance < amount {
            return Err(TokenError::InsufficientBalance {
                account: caller.to_string(),
                balance,
                amount,
            }
            .into());
        }

        let CoreState {
            registry,
            tokens,
            batches,
            router,
            ..
        } = core;
        router.request_pull(
            auth,
            caller,
            registry,
            batches,
            &self.vault,
            &self.asset,
            amount,
            &batch,
        )?;
        tokens.transfer(self.asset, caller, &self.escrow, amount)?;

        let id = RequestId::derive(caller, amount, now.timestamp_micros(), self.next_request);
        self.next_request += 1;
        let request = RedeemRequest {
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
        self.requests.insert(id, request.clone());

        info!(
            vault = %self.vault,
            batch = %batch,
            request = %id,
            institution = caller,
            amount,
            "redemption requested"
        );
        Ok(request)
    }

    /// Completes a redemption after its batch settled: claims the
    /// set-aside custody from the batch receiver and burns the escrowed
    /// tokens.
    ///
    /// Only the gateway operator account completes redemptions; the
    /// receiver rejects any other claimant.
    pub fn redeem(
        &mut self,
        caller: &str,
        core: &mut CoreState,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<RedeemRequest, MinterError> {
        let request = self
            .requests
            .get(request_id)
            .ok_or(MinterError::RequestNotFound(*request_id))?;
        if !request.status.is_pending() {
            return Err(MinterError::RequestNotPending {
                request: *request_id,
                status: request.status,
            });
        }
        let batch_status = core.batches.get(&request.batch)?.status;
        if batch_status != BatchStatus::Settled {
            return Err(MinterError::BatchNotSettled {
                batch: request.batch,
                status: batch_status,
            });
        }
        let (batch, amount) = (request.batch, request.amount);

        // The receiver validates the claimant, so a mismatched caller
        // fails here before any tokens burn.
        core.receivers
            .pull_assets(&batch, &self.asset, caller, amount)?;
        core.tokens.burn(self.asset, &self.escrow, amount)?;

        let request = self
            .requests
            .get_mut(request_id)
            .ok_or(MinterError::RequestNotFound(*request_id))?;
        request.status = RequestStatus::Completed;
        request.resolved_at = Some(now);

        info!(
            vault = %self.vault,
            batch = %batch,
            request = %request_id,
            gateway = caller,
            amount,
            "redemption completed"
        );
        Ok(request.clone())
    }

    /// Cancels a pending redemption while its batch is still open:
    /// rescinds the pull report and returns the escrowed tokens.
    pub fn cancel_request(
        &mut self,
        auth: &dyn Authorizer,
        caller: &str,
        core: &mut CoreState,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<RedeemRequest, MinterError> {
        let request = self
            .requests
            .get(request_id)
            .ok_or(MinterError::RequestNotFound(*request_id))?;
        if !request.status.is_pending() {
            return Err(MinterError::RequestNotPending {
                request: *request_id,
                status: request.status,
            });
        }
        if request.requester != caller {
            return Err(MinterError::NotRequester {
                caller: caller.to_string(),
                requester: request.requester.clone(),
            });
        }
        let batch_status = core.batches.get(&request.batch)?.status;
        if batch_status != BatchStatus::Open {
            return Err(MinterError::BatchNoLongerOpen {
                batch: request.batch,
                status: batch_status,
            });
        }
        let (batch, amount) = (request.batch, request.amount);

        let CoreState {
            registry,
            tokens,
            batches,
            router,
            ..
        } = core;
        router.rescind_pull(
            auth,
            caller,
            registry,
            batches,
            &self.vault,
            &self.asset,
            amount,
            &batch,
        )?;
        tokens.transfer(self.asset, &self.escrow, caller, amount)?;

        let request = self
            .requests
            .get_mut(request_id)
            .ok_or(MinterError::RequestNotFound(*request_id))?;
        request.status = RequestStatus::Cancelled;
        request.resolved_at = Some(now);

        info!(
            vault = %self.vault,
            batch = %batch,
            request = %request_id,
            institution = caller,
            amount,
            "redemption cancelled"
        );
        Ok(request.clone())
    }

    // -- Journal restore -----------------------------------------------------

    /// Re-inserts a request record during journal restore. Core state is
    /// rebuilt by replay; this only rebuilds gateway bookkeeping.
    pub(crate) fn restore_request(&mut self, request: RedeemRequest) {
        self.requests.insert(request.id, request);
        self.next_request += 1;
    }

    /// Marks a restored request resolved during journal restore.
    pub(crate) fn restore_resolution(
        &mut self,
        request_id: &RequestId,
        status: RequestStatus,
        at: DateTime<Utc>,
    ) {
        if let Some(request) = self.requests.get_mut(request_id) {
            request.status = status;
            request.resolved_at = Some(at);
        }
    }

    // -- Read access ---------------------------------------------------------

    /// The fronted vault.
    pub fn vault(&self) -> VaultId {
        self.vault
    }

    /// The vault's asset.
    pub fn asset(&self) -> AssetId {
        self.asset
    }

    /// The gateway operator account.
    pub fn gateway_account(&self) -> &str {
        &self.gateway
    }

    /// The escrow account pending redemptions sit in.
    pub fn escrow_account(&self) -> &str {
        &self.escrow
    }

    /// A request by id.
    pub fn request(&self, id: &RequestId) -> Option<&RedeemRequest> {
        self.requests.get(id)
    }

    /// All requests this gateway has seen, in no particular order.
    pub fn requests(&self) -> impl Iterator<Item = &RedeemRequest> {
        self.requests.values()
    }

    /// Number of requests still pending.
    pub fn pending_count(&self) -> usize {
        self.requests
            .values()
            .filter(|r| r.status.is_pending())
            .count()
    }

    fn open_batch_of(&self, core: &CoreState) -> Result<BatchId, MinterError> {
        core.batches
            .open_id_of(&self.vault)
            .ok_or(MinterError::NoOpenBatch { vault: self.vault })
    }
}
