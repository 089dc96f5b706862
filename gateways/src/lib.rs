//! # CAIRN Gateways
//!
//! The access layer of the CAIRN protocol: everything a user-facing
//! integration touches lives here, composed over the settlement core in
//! `cairn-protocol`.
//!
//! - **requests** — Two-phase request records shared by both rails.
//! - **minter** — The institutional gateway: whitelisted institutions
//!   mint against custody deposits and redeem through escrow.
//! - **staking** — The retail gateway: permissionless two-phase staking
//!   with batch-frozen share pricing.
//! - **engine** — Single-writer orchestrator: applies operations to core
//!   state, emits exactly one event per operation, journals it, and
//!   restores itself from the journal on restart.
//!
//! ## Design Principles
//!
//! 1. Gateways hold bookkeeping, the core holds money. A gateway may
//!    track requests and derive escrow accounts, but every token move
//!    and every flow report goes through the core's entry points.
//! 2. Escrow, don't burn. Requested funds sit in a gateway escrow
//!    account until settlement resolves them, so cancellation is a
//!    transfer back, never a re-mint.
//! 3. One operation, one event. Replays stay honest because no event
//!    implies a mutation that another event also carries.

pub mod engine;
pub mod minter;
pub mod requests;
pub mod staking;

pub use engine::{Engine, EngineError, EngineStatus, VaultOverview};
pub use minter::{InstitutionalMinter, MinterError};
pub use requests::{RedeemRequest, RequestStatus, StakeRequest, UnstakeRequest};
pub use staking::{CancelledRequest, StakingError, StakingVault};
