//! # Registry & Authorization
//!
//! Configuration truth for the protocol: which assets exist, which vaults
//! account for them, and who holds which role. The rest of the core treats
//! this module as a read-only oracle -- the router and gateways query it on
//! every call, they never mutate it mid-flight.
//!
//! | File            | Purpose                                              |
//! |-----------------|------------------------------------------------------|
//! | `authorizer.rs` | Role vocabulary and the `Authorizer` capability trait |
//! | `registry.rs`   | Asset registration and vault records                 |
//!
//! Authorization is capability-style: every component receives a
//! `&dyn Authorizer` at the call boundary instead of reaching into a global
//! role table. Tests inject a permissive authorizer; deployments inject one
//! backed by governance.

pub mod authorizer;
pub mod registry;

pub use authorizer::{Authorizer, Role, StaticAuthorizer};
pub use registry::{AssetRecord, Registry, RegistryError, VaultKind, VaultRecord};
