//! # Protocol Events
//!
//! Every state-changing operation emits exactly one [`Event`]. An event
//! carries the operation's inputs and derived figures, which makes the
//! journal a complete account of how state came to be: replaying the
//! records in sequence rebuilds [`crate::state::CoreState`] bit for bit.
//!
//! The [`EventLog`] is the in-memory tail of that journal. It assigns the
//! monotonic sequence numbers; durable storage of the records is the
//! journal's job (`storage::journal`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::BatchPricing;
use crate::ids::{AssetId, BatchId, ProposalId, RequestId, VaultId};
use crate::registry::VaultKind;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// One state-changing operation, as recorded fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// An asset and its issued token entered the registry.
    AssetRegistered {
        /// The new asset's id.
        asset: AssetId,
        /// Underlying symbol (e.g. "USDY").
        symbol: String,
        /// Issued-token display symbol (e.g. "cUSDY").
        token_symbol: String,
        /// Decimal places of both denominations.
        decimals: u8,
    },
    /// A vault was created for an asset.
    VaultCreated {
        /// The new vault's id.
        vault: VaultId,
        /// The vault's registered name.
        name: String,
        /// The asset it accounts for.
        asset: AssetId,
        /// Which rail the vault serves.
        kind: VaultKind,
        /// The share token id, set on staking vaults only.
        share_asset: Option<AssetId>,
    },
    /// A gateway account was bound to a vault.
    GatewayBound {
        /// The vault.
        vault: VaultId,
        /// The gateway account authorized to pull from its receivers.
        gateway: String,
    },
    /// A vault's settlement yield destination was set.
    YieldRecipientSet {
        /// The vault.
        vault: VaultId,
        /// The account yield mints to (profit) or burns from (loss).
        recipient: String,
    },

    /// A settlement batch opened.
    BatchOpened {
        /// The new batch's id.
        batch: BatchId,
        /// The vault it belongs to.
        vault: VaultId,
        /// The vault's asset.
        asset: AssetId,
        /// Its per-vault sequence number.
        sequence: u64,
    },
    /// A batch closed, freezing its tallies.
    BatchClosed {
        /// The closed batch.
        batch: BatchId,
        /// The vault it belongs to.
        vault: VaultId,
        /// The successor opened in the same step, if one was.
        successor: Option<BatchId>,
    },

    /// An institutional deposit was reported into an open batch.
    AssetsPushed {
        /// The target vault.
        vault: VaultId,
        /// The deposited asset.
        asset: AssetId,
        /// The batch the flow attached to.
        batch: BatchId,
        /// Deposited amount in underlying units.
        amount: u64,
        /// The reporting account.
        by: String,
    },
    /// An intended institutional withdrawal was reported.
    PullRequested {
        /// The target vault.
        vault: VaultId,
        /// The asset to withdraw.
        asset: AssetId,
        /// The batch the intent attached to.
        batch: BatchId,
        /// Requested amount in underlying units.
        amount: u64,
        /// The reporting account.
        by: String,
    },
    /// Baseline claim moved between two vaults of the same asset.
    VaultTransfer {
        /// The vault debited.
        source: VaultId,
        /// The vault credited.
        target: VaultId,
        /// The asset moved.
        asset: AssetId,
        /// The source vault's open batch at the time.
        batch: BatchId,
        /// Amount moved.
        amount: u64,
        /// The operator account.
        by: String,
    },

    /// A settlement was proposed against a closed batch.
    SettlementProposed {
        /// The new proposal's id.
        proposal: ProposalId,
        /// The vault being settled.
        vault: VaultId,
        /// The vault's asset.
        asset: AssetId,
        /// The batch being settled.
        batch: BatchId,
        /// The custodian-reported total.
        reported_total: u64,
        /// Magnitude of the derived yield delta.
        yield_amount: u64,
        /// Whether the delta is a profit.
        is_profit: bool,
        /// The relayer who proposed.
        proposed_by: String,
        /// When the cooldown elapses.
        execute_after: DateTime<Utc>,
    },
    /// A guardian cancelled a pending proposal.
    ProposalCancelled {
        /// The cancelled proposal.
        proposal: ProposalId,
        /// The guardian account.
        by: String,
    },
    /// A matured proposal executed, settling its batch.
    SettlementExecuted {
        /// The executed proposal.
        proposal: ProposalId,
        /// The settled vault.
        vault: VaultId,
        /// The vault's asset.
        asset: AssetId,
        /// The settled batch.
        batch: BatchId,
        /// The reported total settled against.
        reported_total: u64,
        /// Magnitude of the applied yield delta.
        yield_amount: u64,
        /// Whether the delta was a profit.
        is_profit: bool,
        /// Where yield minted to / burned from, when any did.
        yield_recipient: Option<String>,
        /// Amount set aside in the batch receiver (primary rail).
        receiver_funded: u64,
        /// The share pricing frozen on the batch (staking rail).
        pricing: Option<BatchPricing>,
        /// The vault's baseline after rebasing.
        new_baseline: u64,
        /// Whoever triggered execution.
        by: String,
    },

    /// Issued tokens moved between two accounts.
    TokensTransferred {
        /// The asset whose token moved.
        asset: AssetId,
        /// Sending account.
        from: String,
        /// Receiving account.
        to: String,
        /// Amount moved.
        amount: u64,
    },

    /// An institution minted against a custody deposit.
    MintExecuted {
        /// The primary vault deposited into.
        vault: VaultId,
        /// The deposited asset.
        asset: AssetId,
        /// The batch the deposit attached to.
        batch: BatchId,
        /// The minting institution.
        institution: String,
        /// Where the issued tokens landed.
        recipient: String,
        /// Amount deposited and minted, 1:1.
        amount: u64,
    },
    /// An institution escrowed tokens and queued a redemption.
    RedeemRequested {
        /// The new request's id.
        request: RequestId,
        /// The primary vault redeemed from.
        vault: VaultId,
        /// The vault's asset.
        asset: AssetId,
        /// The batch the intent attached to.
        batch: BatchId,
        /// The requesting institution.
        requester: String,
        /// Where the underlying should eventually land.
        recipient: String,
        /// The gateway escrow holding the tokens meanwhile.
        escrow: String,
        /// Token amount escrowed.
        amount: u64,
    },
    /// A settled redemption paid out: escrow burned, receiver drawn down.
    RedeemCompleted {
        /// The completed request.
        request: RequestId,
        /// The vault redeemed from.
        vault: VaultId,
        /// The vault's asset.
        asset: AssetId,
        /// The settled batch whose receiver paid.
        batch: BatchId,
        /// The gateway account that pulled from the receiver.
        gateway: String,
        /// The escrow the burned tokens came from.
        escrow: String,
        /// Who received the underlying.
        recipient: String,
        /// Amount burned and paid.
        amount: u64,
    },
    /// A redemption was cancelled while its batch was still open.
    RedeemCancelled {
        /// The cancelled request.
        request: RequestId,
        /// The vault it targeted.
        vault: VaultId,
        /// The vault's asset.
        asset: AssetId,
        /// The batch it was attached to.
        batch: BatchId,
        /// The requester the escrow returned to.
        requester: String,
        /// The escrow it returned from.
        escrow: String,
        /// Token amount returned.
        amount: u64,
    },

    /// A holder escrowed tokens and queued a stake.
    StakeRequested {
        /// The new request's id.
        request: RequestId,
        /// The staking vault.
        vault: VaultId,
        /// The staked (issued-token) asset.
        asset: AssetId,
        /// The batch the inflow attached to.
        batch: BatchId,
        /// The staking account.
        requester: String,
        /// Who the shares will mint to at claim.
        recipient: String,
        /// The vault escrow holding the tokens meanwhile.
        escrow: String,
        /// Token amount escrowed.
        amount: u64,
    },
    /// A settled stake was claimed: escrow joined the pool, shares minted.
    StakeClaimed {
        /// The claimed request.
        request: RequestId,
        /// The staking vault.
        vault: VaultId,
        /// The staked asset.
        asset: AssetId,
        /// The vault's share token.
        share_asset: AssetId,
        /// The settled batch whose frozen price applied.
        batch: BatchId,
        /// Who the shares minted to.
        recipient: String,
        /// The escrow the stake moved out of.
        escrow: String,
        /// The pool account the stake moved into.
        pool: String,
        /// Staked token amount.
        amount: u64,
        /// Shares minted at the frozen price.
        shares: u64,
    },
    /// A stake was cancelled while its batch was still open.
    StakeCancelled {
        /// The cancelled request.
        request: RequestId,
        /// The staking vault.
        vault: VaultId,
        /// The staked asset.
        asset: AssetId,
        /// The batch it was attached to.
        batch: BatchId,
        /// The requester the escrow returned to.
        requester: String,
        /// The escrow it returned from.
        escrow: String,
        /// Token amount returned.
        amount: u64,
    },
    /// A holder escrowed shares and queued an unstake.
    UnstakeRequested {
        /// The new request's id.
        request: RequestId,
        /// The staking vault.
        vault: VaultId,
        /// The vault's share token.
        share_asset: AssetId,
        /// The batch the outflow attached to.
        batch: BatchId,
        /// The unstaking account.
        requester: String,
        /// Who the underlying will pay to at claim.
        recipient: String,
        /// The vault escrow holding the shares meanwhile.
        escrow: String,
        /// Share amount escrowed.
        shares: u64,
    },
    /// A settled unstake was claimed: shares burned, pool paid out.
    UnstakeClaimed {
        /// The claimed request.
        request: RequestId,
        /// The staking vault.
        vault: VaultId,
        /// The paid (issued-token) asset.
        asset: AssetId,
        /// The vault's share token.
        share_asset: AssetId,
        /// The settled batch whose frozen price applied.
        batch: BatchId,
        /// Who the underlying paid to.
        recipient: String,
        /// The escrow the burned shares came from.
        escrow: String,
        /// The pool account that paid.
        pool: String,
        /// Shares burned.
        shares: u64,
        /// Token amount paid at the frozen price.
        assets: u64,
    },
    /// An unstake was cancelled while its batch was still open.
    UnstakeCancelled {
        /// The cancelled request.
        request: RequestId,
        /// The staking vault.
        vault: VaultId,
        /// The vault's share token.
        share_asset: AssetId,
        /// The batch it was attached to.
        batch: BatchId,
        /// The requester the escrow returned to.
        requester: String,
        /// The escrow it returned from.
        escrow: String,
        /// Share amount returned.
        shares: u64,
    },
}

impl Event {
    /// Stable machine name for the event's kind. Metrics label values and
    /// log fields use these.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::AssetRegistered { .. } => "asset_registered",
            Event::VaultCreated { .. } => "vault_created",
            Event::GatewayBound { .. } => "gateway_bound",
            Event::YieldRecipientSet { .. } => "yield_recipient_set",
            Event::BatchOpened { .. } => "batch_opened",
            Event::BatchClosed { .. } => "batch_closed",
            Event::AssetsPushed { .. } => "assets_pushed",
            Event::PullRequested { .. } => "pull_requested",
            Event::VaultTransfer { .. } => "vault_transfer",
            Event::SettlementProposed { .. } => "settlement_proposed",
            Event::ProposalCancelled { .. } => "proposal_cancelled",
            Event::SettlementExecuted { .. } => "settlement_executed",
            Event::TokensTransferred { .. } => "tokens_transferred",
            Event::MintExecuted { .. } => "mint_executed",
            Event::RedeemRequested { .. } => "redeem_requested",
            Event::RedeemCompleted { .. } => "redeem_completed",
            Event::RedeemCancelled { .. } => "redeem_cancelled",
            Event::StakeRequested { .. } => "stake_requested",
            Event::StakeClaimed { .. } => "stake_claimed",
            Event::StakeCancelled { .. } => "stake_cancelled",
            Event::UnstakeRequested { .. } => "unstake_requested",
            Event::UnstakeClaimed { .. } => "unstake_claimed",
            Event::UnstakeCancelled { .. } => "unstake_cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// EventRecord / EventLog
// ---------------------------------------------------------------------------

/// An event with its place in the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonic journal sequence, starting at 1.
    pub seq: u64,
    /// When the operation happened. Replay uses this as the operation
    /// clock, so recorded and rebuilt state carry identical timestamps.
    pub at: DateTime<Utc>,
    /// The operation itself.
    pub event: Event,
}

/// Append-only in-memory event tail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLog {
    records: Vec<EventRecord>,
    next_seq: u64,
}

impl EventLog {
    /// Creates an empty log; the first record gets sequence 1.
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            next_seq: 1,
        }
    }

    /// Creates an empty log that continues numbering after `last_seq`.
    /// Used when resuming on top of a persisted journal.
    pub fn resuming_after(last_seq: u64) -> Self {
        Self {
            records: Vec::new(),
            next_seq: last_seq.saturating_add(1),
        }
    }

    /// Appends an event, assigning the next sequence number.
    pub fn append(&mut self, event: Event, now: DateTime<Utc>) -> &EventRecord {
        let record = EventRecord {
            seq: self.next_seq,
            at: now,
            event,
        };
        self.next_seq += 1;
        self.records.push(record);
        // Just pushed; the slot exists.
        &self.records[self.records.len() - 1]
    }

    /// Sequence number of the most recent record, if any.
    pub fn latest_seq(&self) -> Option<u64> {
        self.records.last().map(|record| record.seq)
    }

    /// All records in order.
    pub fn iter(&self) -> impl Iterator<Item = &EventRecord> {
        self.records.iter()
    }

    /// Records with sequence strictly greater than `seq`, in order.
    pub fn since(&self, seq: u64) -> impl Iterator<Item = &EventRecord> {
        self.records.iter().filter(move |record| record.seq > seq)
    }

    /// The most recent `n` records, oldest first.
    pub fn recent(&self, n: usize) -> &[EventRecord] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }

    /// Number of records held in memory.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the log holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event::AssetsPushed {
            vault: VaultId::derive("treasury-prime"),
            asset: AssetId::derive("USDY"),
            batch: BatchId::derive(&VaultId::derive("treasury-prime"), &AssetId::derive("USDY"), 1),
            amount: 1_000,
            by: "cairn:inst:alpha".to_string(),
        }
    }

    #[test]
    fn sequences_are_monotonic_from_one() {
        let mut log = EventLog::new();
        let now = Utc::now();
        assert_eq!(log.append(sample_event(), now).seq, 1);
        assert_eq!(log.append(sample_event(), now).seq, 2);
        assert_eq!(log.latest_seq(), Some(2));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn resumed_log_continues_numbering() {
        let mut log = EventLog::resuming_after(41);
        assert_eq!(log.append(sample_event(), Utc::now()).seq, 42);
    }

    #[test]
    fn since_is_exclusive() {
        let mut log = EventLog::new();
        let now = Utc::now();
        for _ in 0..5 {
            log.append(sample_event(), now);
        }
        let seqs: Vec<u64> = log.since(3).map(|r| r.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert_eq!(log.since(5).count(), 0);
    }

    #[test]
    fn recent_returns_the_tail_in_order() {
        let mut log = EventLog::new();
        let now = Utc::now();
        for _ in 0..4 {
            log.append(sample_event(), now);
        }
        let tail = log.recent(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 3);
        assert_eq!(tail[1].seq, 4);
        // Asking for more than exists returns everything.
        assert_eq!(log.recent(100).len(), 4);
    }

    #[test]
    fn records_serialize_round_trip() {
        let mut log = EventLog::new();
        let record = log
            .append(
                Event::SettlementExecuted {
                    proposal: ProposalId::derive(
                        &VaultId::derive("treasury-prime"),
                        &BatchId::derive(
                            &VaultId::derive("treasury-prime"),
                            &AssetId::derive("USDY"),
                            1,
                        ),
                        &AssetId::derive("USDY"),
                        0,
                    ),
                    vault: VaultId::derive("treasury-prime"),
                    asset: AssetId::derive("USDY"),
                    batch: BatchId::derive(
                        &VaultId::derive("treasury-prime"),
                        &AssetId::derive("USDY"),
                        1,
                    ),
                    reported_total: 1_000,
                    yield_amount: 50,
                    is_profit: true,
                    yield_recipient: Some("cairn:pool:usdy".to_string()),
                    receiver_funded: 400,
                    pricing: None,
                    new_baseline: 650,
                    by: "cairn:anyone".to_string(),
                },
                Utc::now(),
            )
            .clone();

        let json = serde_json::to_string(&record).expect("serialize");
        let back: EventRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, record);
        assert_eq!(back.event.kind(), "settlement_executed");
    }

    #[test]
    fn kinds_are_stable_labels() {
        assert_eq!(sample_event().kind(), "assets_pushed");
        let close = Event::BatchClosed {
            batch: BatchId::derive(&VaultId::derive("v"), &AssetId::derive("a"), 1),
            vault: VaultId::derive("v"),
            successor: None,
        };
        assert_eq!(close.kind(), "batch_closed");
    }
}
