//! Role vocabulary and the `Authorizer` capability trait.
//!
//! The core never stores role tables of its own. Every entry point takes a
//! `&dyn Authorizer` and asks a yes/no question about the calling account;
//! what backs the answer (an in-memory table, a governance module, an HSM
//! somewhere) is the deployment's business.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// The four roles the protocol distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Operational governance: registers assets and vaults, wires config.
    Admin,
    /// Circuit breaker: may cancel a pending settlement proposal. Nothing
    /// else. A guardian cannot move funds, only stop a settlement.
    Guardian,
    /// Automation: advances batch lifecycles and proposes settlements.
    Relayer,
    /// Whitelisted institution: may mint and redeem through the
    /// institutional gateway.
    Institution,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Guardian => write!(f, "guardian"),
            Role::Relayer => write!(f, "relayer"),
            Role::Institution => write!(f, "institution"),
        }
    }
}

// ---------------------------------------------------------------------------
// Authorizer
// ---------------------------------------------------------------------------

/// Capability interface for role-membership queries.
///
/// Implementations must answer from current state on every call; the core
/// re-checks on each operation and never caches an answer across calls.
pub trait Authorizer: Send + Sync {
    /// Whether `account` currently holds `role`.
    fn has_role(&self, account: &str, role: Role) -> bool;

    /// Whether `account` is an admin.
    fn is_admin(&self, account: &str) -> bool {
        self.has_role(account, Role::Admin)
    }

    /// Whether `account` is a guardian.
    fn is_guardian(&self, account: &str) -> bool {
        self.has_role(account, Role::Guardian)
    }

    /// Whether `account` is a relayer.
    fn is_relayer(&self, account: &str) -> bool {
        self.has_role(account, Role::Relayer)
    }

    /// Whether `account` is a whitelisted institution.
    fn is_institution(&self, account: &str) -> bool {
        self.has_role(account, Role::Institution)
    }
}

// ---------------------------------------------------------------------------
// StaticAuthorizer
// ---------------------------------------------------------------------------

/// In-memory role table. The reference implementation used by the keeper
/// and by every test in the workspace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticAuthorizer {
    /// Role grants per account. `BTreeSet` keeps serialized output stable.
    grants: HashMap<String, BTreeSet<Role>>,
}

impl StaticAuthorizer {
    /// Creates an empty table: nobody can do anything yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `role` to `account`. Granting twice is a no-op.
    pub fn grant(&mut self, account: &str, role: Role) {
        self.grants.entry(account.to_string()).or_default().insert(role);
    }

    /// Revokes `role` from `account`. Returns whether the grant existed.
    pub fn revoke(&mut self, account: &str, role: Role) -> bool {
        match self.grants.get_mut(account) {
            Some(roles) => {
                let removed = roles.remove(&role);
                if roles.is_empty() {
                    self.grants.remove(account);
                }
                removed
            }
            None => false,
        }
    }

    /// All roles currently held by `account`.
    pub fn roles_of(&self, account: &str) -> Vec<Role> {
        self.grants
            .get(account)
            .map(|roles| roles.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of accounts holding at least one role.
    pub fn account_count(&self) -> usize {
        self.grants.len()
    }
}

impl Authorizer for StaticAuthorizer {
    fn has_role(&self, account: &str, role: Role) -> bool {
        self.grants
            .get(account)
            .map(|roles| roles.contains(&role))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_denies_everything() {
        let auth = StaticAuthorizer::new();
        assert!(!auth.is_admin("cairn:alice"));
        assert!(!auth.is_guardian("cairn:alice"));
        assert!(!auth.is_relayer("cairn:alice"));
        assert!(!auth.is_institution("cairn:alice"));
    }

    #[test]
    fn grant_and_check() {
        let mut auth = StaticAuthorizer::new();
        auth.grant("cairn:ops", Role::Relayer);
        assert!(auth.is_relayer("cairn:ops"));
        // A relayer grant says nothing about other roles.
        assert!(!auth.is_guardian("cairn:ops"));
    }

    #[test]
    fn roles_are_per_account() {
        let mut auth = StaticAuthorizer::new();
        auth.grant("cairn:ops", Role::Relayer);
        assert!(!auth.is_relayer("cairn:other"));
    }

    #[test]
    fn revoke_removes_the_grant() {
        let mut auth = StaticAuthorizer::new();
        auth.grant("cairn:guard", Role::Guardian);
        assert!(auth.revoke("cairn:guard", Role::Guardian));
        assert!(!auth.is_guardian("cairn:guard"));
        // Second revoke reports nothing to remove.
        assert!(!auth.revoke("cairn:guard", Role::Guardian));
    }

    #[test]
    fn multiple_roles_per_account() {
        let mut auth = StaticAuthorizer::new();
        auth.grant("cairn:root", Role::Admin);
        auth.grant("cairn:root", Role::Guardian);
        assert!(auth.is_admin("cairn:root"));
        assert!(auth.is_guardian("cairn:root"));
        assert_eq!(auth.roles_of("cairn:root").len(), 2);
    }

    #[test]
    fn granting_twice_is_idempotent() {
        let mut auth = StaticAuthorizer::new();
        auth.grant("cairn:acme", Role::Institution);
        auth.grant("cairn:acme", Role::Institution);
        assert_eq!(auth.roles_of("cairn:acme"), vec![Role::Institution]);
    }

    #[test]
    fn table_serialization_roundtrip() {
        let mut auth = StaticAuthorizer::new();
        auth.grant("cairn:root", Role::Admin);
        auth.grant("cairn:ops", Role::Relayer);
        let json = serde_json::to_string(&auth).expect("serialize");
        let recovered: StaticAuthorizer = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(auth, recovered);
    }
}
