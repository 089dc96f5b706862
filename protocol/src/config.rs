//! # Protocol Configuration & Constants
//!
//! Every magic number in CAIRN lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! Tolerance and cooldown values are the protocol's blast-radius controls.
//! Changing them on a live network changes how much damage one bad
//! settlement report can do, so treat every edit here as a governance
//! decision, not a tuning knob.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

/// Basis-point scale: 10,000 bps = 100%. All relative-yield math in the
/// router is integer arithmetic over this scale. No floats near money.
pub const BPS_SCALE: u64 = 10_000;

// ---------------------------------------------------------------------------
// Yield Guard
// ---------------------------------------------------------------------------

/// Default yield tolerance: 10% per settlement. A delta-neutral vault that
/// moves more than this in one batch is either a miracle or a bug, and we
/// don't settle miracles without a human looking first.
pub const DEFAULT_YIELD_TOLERANCE_BPS: u32 = 1_000;

/// Hard ceiling on the yield tolerance: 50%. The configured tolerance is
/// clamped to this no matter what governance sets. One settlement can never
/// move the backing ratio by more than half, full stop.
pub const MAX_YIELD_TOLERANCE_BPS: u32 = 5_000;

// ---------------------------------------------------------------------------
// Settlement Timing
// ---------------------------------------------------------------------------

/// Default guardian cooldown between proposal and execution: one hour.
/// Long enough for a paged human to read the figures and hit cancel, short
/// enough that daily batches still settle the same day.
pub const DEFAULT_SETTLE_COOLDOWN_SECS: u64 = 3_600;

/// Default batch cycle length used by the keeper: one day. Institutional
/// flows net out over the day and settle once; nobody needs minute-level
/// batches for custody money.
pub const DEFAULT_BATCH_CYCLE_SECS: u64 = 86_400;

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// Prefix convention for account ids. Purely cosmetic; the ledger treats
/// accounts as opaque strings, but logs read better with a namespace.
pub const ACCOUNT_PREFIX: &str = "cairn";

/// Default treasury account. Settlement yield for a primary vault lands
/// here unless the vault configures its own recipient (usually the staking
/// pool account once the retail rail is live).
pub const DEFAULT_TREASURY_ACCOUNT: &str = "cairn:treasury";

// ---------------------------------------------------------------------------
// Service Defaults
// ---------------------------------------------------------------------------

/// Default keeper HTTP API port (status + metrics).
pub const DEFAULT_API_PORT: u16 = 9750;

/// Protocol rules version. Bump on changes that make replayed history
/// diverge; the snapshot schema versions separately in `storage::snapshot`.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Which deployment flavor a config targets. Local networks may disable
/// the settlement cooldown; anything public may not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    /// Production. Real assets, real institutions, real consequences.
    Mainnet,
    /// Public test deployment with mainnet-shaped rules.
    Testnet,
    /// Single-operator sandbox. Zero cooldown permitted so tests and demos
    /// don't sleep through an hour of wall clock.
    Local,
}

impl Network {
    /// Whether a zero settlement cooldown is acceptable on this network.
    pub fn allows_zero_cooldown(&self) -> bool {
        matches!(self, Network::Local)
    }

    /// Lowercase name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Local => "local",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ---------------------------------------------------------------------------
// ProtocolConfig
// ---------------------------------------------------------------------------

/// Errors from [`ProtocolConfig::validate`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Zero cooldown on a network that requires one.
    #[error("settlement cooldown must be non-zero on {network}")]
    ZeroCooldown {
        /// The network the config targets.
        network: Network,
    },

    /// An empty treasury account cannot receive settlement yield.
    #[error("treasury account must not be empty")]
    EmptyTreasury,
}

/// Injected protocol configuration.
///
/// Constructed once at deployment and handed to the router and gateways;
/// nothing in the core reads global state. The struct is serde-friendly so
/// the keeper can persist it alongside genesis state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Deployment flavor; gates the zero-cooldown escape hatch.
    pub network: Network,

    /// Yield tolerance in basis points. Clamped to
    /// [`MAX_YIELD_TOLERANCE_BPS`] at the point of use regardless of what
    /// is configured here.
    pub yield_tolerance_bps: u32,

    /// Guardian cooldown between proposal and execution, in seconds.
    pub settle_cooldown_secs: u64,

    /// Account receiving primary-vault settlement yield when a vault does
    /// not name its own recipient.
    pub treasury: String,
}

impl ProtocolConfig {
    /// Mainnet-shaped defaults.
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            yield_tolerance_bps: DEFAULT_YIELD_TOLERANCE_BPS,
            settle_cooldown_secs: DEFAULT_SETTLE_COOLDOWN_SECS,
            treasury: DEFAULT_TREASURY_ACCOUNT.to_string(),
        }
    }

    /// Testnet defaults: mainnet rules, shorter cooldown.
    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            settle_cooldown_secs: 300,
            ..Self::mainnet()
        }
    }

    /// Sandbox defaults: zero cooldown so a propose/execute pair runs
    /// back-to-back in tests and demos.
    pub fn local() -> Self {
        Self {
            network: Network::Local,
            settle_cooldown_secs: 0,
            ..Self::mainnet()
        }
    }

    /// Checks the config for values the protocol refuses to run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.settle_cooldown_secs == 0 && !self.network.allows_zero_cooldown() {
            return Err(ConfigError::ZeroCooldown {
                network: self.network,
            });
        }
        if self.treasury.is_empty() {
            return Err(ConfigError::EmptyTreasury);
        }
        Ok(())
    }

    /// The tolerance actually enforced: configured value clamped to the
    /// hard ceiling.
    pub fn effective_tolerance_bps(&self) -> u32 {
        self.yield_tolerance_bps.min(MAX_YIELD_TOLERANCE_BPS)
    }

    /// Cooldown as a chrono duration for `execute_after` arithmetic.
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.settle_cooldown_secs as i64)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self::mainnet()
    }
}
