// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # CAIRN Protocol — Core Library
//!
//! This is the beating heart of CAIRN: a dual-track settlement protocol
//! for tokenized real-world assets, built for the world where custody
//! lives at regulated institutions and the ledger has to reconcile with
//! it, not the other way around.
//!
//! CAIRN takes a pragmatic stance: custodians report flows instead of
//! proving them (because T-bills do not emit Merkle proofs), settlement
//! waits out a guardian cooldown (because a lying relayer is a when, not
//! an if), and every holding is a virtual balance until a batch settles
//! (because wire transfers do not clear in one block).
//!
//! ## Architecture
//!
//! The protocol is split into modules that mirror the actual concerns of
//! an asset-tokenization network:
//!
//! - **ids** — Content-derived identifiers. Deterministic, re-derivable.
//! - **registry** — Assets, vaults, and role-based authorization.
//! - **token** — The issued-token ledger: mint, burn, transfer.
//! - **batch** — Settlement batches, frozen pricing, redemption receivers.
//! - **router** — Virtual balances, baselines, and the settlement state
//!   machine (propose → cooldown → execute, guardian cancel).
//! - **state** — The composed core state and the backing report.
//! - **adapter** — Custody adapters that second-source reported totals.
//! - **events** — The protocol event log; one record per operation.
//! - **storage** — sled-backed journal, versioned snapshots, replay.
//! - **config** — Protocol constants and network parameters.
//!
//! ## Design Philosophy
//!
//! 1. Correctness over performance (but we're still fast).
//! 2. Supply is sacred: issued tokens never exceed custody baselines.
//! 3. Every state transition is an event; replay rebuilds the world.
//! 4. If it touches money, it has tests. Plural.

pub mod adapter;
pub mod batch;
pub mod config;
pub mod events;
pub mod ids;
pub mod registry;
pub mod router;
pub mod state;
pub mod storage;
pub mod token;
