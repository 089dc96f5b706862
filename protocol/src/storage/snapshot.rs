//! # Versioned State Snapshots
//!
//! A snapshot is a full [`CoreState`] image taken at a known journal
//! sequence, so a restarting keeper can load it and replay only the
//! records appended after it instead of the whole journal.
//!
//! Snapshots are versioned because the persisted shape has changed once
//! already and will change again:
//!
//! | Version | Era                                                        |
//! |---------|------------------------------------------------------------|
//! | 1       | Institutional rail only -- no share flows, no batch pricing |
//! | 2       | Current -- dual rail, share flows and frozen batch pricing  |
//!
//! A V1 image is upgraded on read by [`migrate_v1`]: share flows start
//! empty and every batch carries no frozen pricing, which is exactly what
//! an institutional-only deployment's state meant. Unknown versions are
//! refused rather than guessed at.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::{Batch, BatchStatus, ReceiverRegistry};
use crate::ids::{AssetId, BatchId, ProposalId, VaultId};
use crate::registry::Registry;
use crate::router::{SettlementProposal, ShareFlowEntry, VirtualBalanceEntry};
use crate::state::CoreState;
use crate::storage::journal::{StoreError, StoreResult};
use crate::token::TokenLedger;

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 2;

// ---------------------------------------------------------------------------
// StateSnapshot
// ---------------------------------------------------------------------------

/// A point-in-time image of core state, pinned to a journal sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    /// The schema the image was written under. Always [`SCHEMA_VERSION`]
    /// after decode; older images are migrated during [`decode`](Self::decode).
    pub schema_version: u32,
    /// The journal sequence the image reflects. Replay resumes after it.
    pub journal_seq: u64,
    /// When the image was captured.
    pub taken_at: DateTime<Utc>,
    /// The captured state.
    pub core: CoreState,
}

/// Everything behind the version header, in the current layout.
#[derive(Serialize, Deserialize)]
struct SnapshotBody {
    journal_seq: u64,
    taken_at: DateTime<Utc>,
    core: CoreState,
}

impl StateSnapshot {
    /// Captures the given state at a journal sequence.
    pub fn capture(core: &CoreState, journal_seq: u64, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            journal_seq,
            taken_at: now,
            core: core.clone(),
        }
    }

    /// Serializes `self` as a version header followed by the body.
    ///
    /// The header is a big-endian `u32` so readers can dispatch on the
    /// version before committing to a body layout.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let body = SnapshotBody {
            journal_seq: self.journal_seq,
            taken_at: self.taken_at,
            core: self.core.clone(),
        };
        let mut bytes = SCHEMA_VERSION.to_be_bytes().to_vec();
        let payload =
            bincode::serialize(&body).map_err(|e| StoreError::Serialization(e.to_string()))?;
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Decodes a persisted snapshot, migrating old schemas forward.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnsupportedSchema`] for versions this build
    /// does not know, and [`StoreError::Serialization`] for images that
    /// do not match their claimed layout.
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        if bytes.len() < 4 {
            return Err(StoreError::Serialization(
                "snapshot shorter than its version header".to_string(),
            ));
        }
        let (header, payload) = bytes.split_at(4);
        let version = u32::from_be_bytes(header.try_into().expect("4-byte header"));

        match version {
            1 => {
                let body: SnapshotBodyV1 = bincode::deserialize(payload)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Self {
                    schema_version: SCHEMA_VERSION,
                    journal_seq: body.journal_seq,
                    taken_at: body.taken_at,
                    core: migrate_v1(body.core)?,
                })
            }
            SCHEMA_VERSION => {
                let body: SnapshotBody = bincode::deserialize(payload)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Self {
                    schema_version: SCHEMA_VERSION,
                    journal_seq: body.journal_seq,
                    taken_at: body.taken_at,
                    core: body.core,
                })
            }
            found => Err(StoreError::UnsupportedSchema { found }),
        }
    }
}

// ---------------------------------------------------------------------------
// V1 Layout
// ---------------------------------------------------------------------------
//
// The institutional-only era. Registry, token ledger, and receivers kept
// their shape across the upgrade; the book had no share flows and batches
// had no pricing slot.

/// Body of a schema-1 snapshot.
#[derive(Serialize, Deserialize)]
struct SnapshotBodyV1 {
    journal_seq: u64,
    taken_at: DateTime<Utc>,
    core: CoreStateV1,
}

/// Schema-1 core state.
#[derive(Serialize, Deserialize)]
pub(crate) struct CoreStateV1 {
    registry: Registry,
    tokens: TokenLedger,
    batches: BatchLedgerV1,
    router: RouterV1,
    receivers: ReceiverRegistry,
}

#[derive(Serialize, Deserialize)]
struct BatchLedgerV1 {
    batches: HashMap<BatchId, BatchV1>,
    open_by_vault: HashMap<VaultId, BatchId>,
    next_sequence: HashMap<VaultId, u64>,
    last_settled: HashMap<VaultId, u64>,
}

/// Schema-1 batch: no `pricing` slot.
#[derive(Serialize, Deserialize)]
struct BatchV1 {
    id: BatchId,
    vault: VaultId,
    asset: AssetId,
    sequence: u64,
    status: BatchStatus,
    deposited: u64,
    requested: u64,
    opened_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    settled_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct RouterV1 {
    book: BookV1,
    proposals: HashMap<ProposalId, SettlementProposal>,
    active_by_batch: HashMap<BatchId, ProposalId>,
    proposal_nonce: u64,
}

/// Schema-1 virtual book: no share flows.
#[derive(Serialize, Deserialize)]
struct BookV1 {
    entries: HashMap<VaultId, HashMap<AssetId, VirtualBalanceEntry>>,
    baselines: HashMap<VaultId, HashMap<AssetId, u64>>,
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

// The live containers keep their fields private, so the upgrade builds a
// current-layout image and re-encodes it. Bincode encodes a struct as its
// fields in declaration order; the image structs below repeat the live
// layouts exactly, so the re-encoded bytes decode as the live types.

#[derive(Serialize)]
struct CoreImage {
    registry: Registry,
    tokens: TokenLedger,
    batches: LedgerImage,
    router: RouterImage,
    receivers: ReceiverRegistry,
}

#[derive(Serialize)]
struct LedgerImage {
    batches: HashMap<BatchId, Batch>,
    open_by_vault: HashMap<VaultId, BatchId>,
    next_sequence: HashMap<VaultId, u64>,
    last_settled: HashMap<VaultId, u64>,
}

#[derive(Serialize)]
struct RouterImage {
    book: BookImage,
    proposals: HashMap<ProposalId, SettlementProposal>,
    active_by_batch: HashMap<BatchId, ProposalId>,
    proposal_nonce: u64,
}

#[derive(Serialize)]
struct BookImage {
    entries: HashMap<VaultId, HashMap<AssetId, VirtualBalanceEntry>>,
    baselines: HashMap<VaultId, HashMap<AssetId, u64>>,
    share_flows: HashMap<VaultId, ShareFlowEntry>,
}

/// Upgrades a schema-1 core image to the current schema.
///
/// Share flows start empty and every batch carries `pricing: None` --
/// no schema-1 deployment ever ran the retail rail, so that is what its
/// state meant all along.
pub(crate) fn migrate_v1(v1: CoreStateV1) -> StoreResult<CoreState> {
    let batches = v1
        .batches
        .batches
        .into_iter()
        .map(|(id, b)| {
            (
                id,
                Batch {
                    id: b.id,
                    vault: b.vault,
                    asset: b.asset,
                    sequence: b.sequence,
                    status: b.status,
                    deposited: b.deposited,
                    requested: b.requested,
                    pricing: None,
                    opened_at: b.opened_at,
                    closed_at: b.closed_at,
                    settled_at: b.settled_at,
                },
            )
        })
        .collect();

    let image = CoreImage {
        registry: v1.registry,
        tokens: v1.tokens,
        batches: LedgerImage {
            batches,
            open_by_vault: v1.batches.open_by_vault,
            next_sequence: v1.batches.next_sequence,
            last_settled: v1.batches.last_settled,
        },
        router: RouterImage {
            book: BookImage {
                entries: v1.router.book.entries,
                baselines: v1.router.book.baselines,
                share_flows: HashMap::new(),
            },
            proposals: v1.router.proposals,
            active_by_batch: v1.router.active_by_batch,
            proposal_nonce: v1.router.proposal_nonce,
        },
        receivers: v1.receivers,
    };

    let bytes =
        bincode::serialize(&image).map_err(|e| StoreError::Serialization(e.to_string()))?;
    bincode::deserialize(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Role, StaticAuthorizer, VaultKind};

    const INSTITUTION: &str = "cairn:inst:alpha";
    const RELAYER: &str = "cairn:relayer:ops";

    /// Builds a state with real flow in it: one asset, a primary vault,
    /// an open batch carrying a deposit, and issued supply.
    fn populated_state() -> CoreState {
        let mut auth = StaticAuthorizer::new();
        auth.grant(INSTITUTION, Role::Institution);
        auth.grant(RELAYER, Role::Relayer);
        let now = Utc::now();

        let mut state = CoreState::new();
        let asset = state
            .registry
            .register_asset("USDY", "cUSDY", 6, now)
            .unwrap();
        let vault = state
            .registry
            .create_vault("treasury-prime", asset, VaultKind::Primary, now)
            .unwrap();
        let batch = state.batches.open_batch(vault, asset, now).unwrap();
        state
            .router
            .push_assets(
                &auth,
                INSTITUTION,
                &state.registry,
                &mut state.batches,
                &vault,
                &asset,
                25_000,
                &batch,
            )
            .unwrap();
        state.tokens.mint(asset, INSTITUTION, 25_000).unwrap();
        state
    }

    /// Serializes a V1 snapshot the way a schema-1 build would have.
    fn v1_bytes(core: CoreStateV1, journal_seq: u64) -> Vec<u8> {
        let body = SnapshotBodyV1 {
            journal_seq,
            taken_at: Utc::now(),
            core,
        };
        let mut bytes = 1u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&bincode::serialize(&body).unwrap());
        bytes
    }

    #[test]
    fn round_trip_preserves_state() {
        let state = populated_state();
        let snapshot = StateSnapshot::capture(&state, 7, Utc::now());

        let bytes = snapshot.encode().unwrap();
        let decoded = StateSnapshot::decode(&bytes).unwrap();

        assert_eq!(decoded.schema_version, SCHEMA_VERSION);
        assert_eq!(decoded.journal_seq, 7);
        assert_eq!(decoded.core, state);
    }

    #[test]
    fn empty_state_round_trips() {
        let snapshot = StateSnapshot::capture(&CoreState::new(), 0, Utc::now());
        let decoded = StateSnapshot::decode(&snapshot.encode().unwrap()).unwrap();
        assert_eq!(decoded.core, CoreState::new());
    }

    #[test]
    fn v1_image_migrates_forward() {
        let now = Utc::now();
        let asset = AssetId::derive("USDY");
        let vault = VaultId::derive("treasury-prime");
        let batch_id = BatchId::derive(&vault, &asset, 1);

        let mut registry = Registry::new();
        registry.register_asset("USDY", "cUSDY", 6, now).unwrap();
        registry
            .create_vault("treasury-prime", asset, VaultKind::Primary, now)
            .unwrap();

        let mut tokens = TokenLedger::new();
        tokens.mint(asset, INSTITUTION, 40_000).unwrap();

        // A settled institutional batch, written in the schema-1 layout.
        let v1 = CoreStateV1 {
            registry,
            tokens,
            batches: BatchLedgerV1 {
                batches: HashMap::from([(
                    batch_id,
                    BatchV1 {
                        id: batch_id,
                        vault,
                        asset,
                        sequence: 1,
                        status: BatchStatus::Settled,
                        deposited: 40_000,
                        requested: 0,
                        opened_at: now,
                        closed_at: Some(now),
                        settled_at: Some(now),
                    },
                )]),
                open_by_vault: HashMap::new(),
                next_sequence: HashMap::from([(vault, 2)]),
                last_settled: HashMap::from([(vault, 1)]),
            },
            router: RouterV1 {
                book: BookV1 {
                    entries: HashMap::new(),
                    baselines: HashMap::from([(vault, HashMap::from([(asset, 40_000u64)]))]),
                },
                proposals: HashMap::new(),
                active_by_batch: HashMap::new(),
                proposal_nonce: 1,
            },
            receivers: ReceiverRegistry::new(),
        };

        let decoded = StateSnapshot::decode(&v1_bytes(v1, 12)).unwrap();
        assert_eq!(decoded.schema_version, SCHEMA_VERSION);
        assert_eq!(decoded.journal_seq, 12);

        let core = &decoded.core;
        assert_eq!(core.registry.asset_count(), 1);
        assert_eq!(core.tokens.total_supply(&asset), 40_000);
        assert_eq!(core.router.book().baseline(&vault, &asset), 40_000);
        assert!(core.router.book().share_flow(&vault).is_zero());

        let migrated_batch = core.batches.get(&batch_id).unwrap();
        assert_eq!(migrated_batch.status, BatchStatus::Settled);
        assert_eq!(migrated_batch.deposited, 40_000);
        assert!(migrated_batch.pricing.is_none());
        assert_eq!(core.batches.last_settled_sequence(&vault), 1);

        // The migrated image still satisfies the backing equation.
        assert!(core.backing_report(&asset).holds());
    }

    #[test]
    fn unknown_version_is_refused() {
        let mut bytes = 9u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 16]);

        match StateSnapshot::decode(&bytes) {
            Err(StoreError::UnsupportedSchema { found }) => assert_eq!(found, 9),
            other => panic!("expected UnsupportedSchema, got {other:?}"),
        }
    }

    #[test]
    fn truncated_header_is_refused() {
        assert!(matches!(
            StateSnapshot::decode(&[0, 0]),
            Err(StoreError::Serialization(_))
        ));
    }
}
