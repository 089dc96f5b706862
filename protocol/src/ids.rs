//! # Protocol Identifiers
//!
//! Every long-lived object in the CAIRN ledger -- assets, vaults, batches,
//! settlement proposals, gateway requests -- is addressed by a deterministic
//! 32-byte BLAKE3 digest of its canonical properties. The same inputs always
//! produce the same id, so ids can be re-derived anywhere without a
//! coordination step, and accidental reuse across domains is impossible
//! because every derivation is prefixed with a domain tag.
//!
//! Ids serialize as lowercase hex strings in human-readable formats (JSON
//! events, API payloads) and as raw bytes in binary formats (bincode
//! journal/snapshot records).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Computes the BLAKE3 digest of a derivation preimage.
fn digest(preimage: &[u8]) -> [u8; 32] {
    *blake3::hash(preimage).as_bytes()
}

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Creates an id from a raw 32-byte digest.
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Returns the raw 32-byte digest.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Returns the hex-encoded id.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parses a hex-encoded id.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                if bytes.len() != 32 {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({}...)"), &self.to_hex()[..12])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl std::str::FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_hex())
                } else {
                    serializer.serialize_bytes(&self.0)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct IdVisitor;

                impl<'de> serde::de::Visitor<'de> for IdVisitor {
                    type Value = [u8; 32];

                    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("a 32-byte identifier as hex string or raw bytes")
                    }

                    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
                    where
                        E: serde::de::Error,
                    {
                        let bytes = hex::decode(v).map_err(E::custom)?;
                        bytes
                            .as_slice()
                            .try_into()
                            .map_err(|_| E::custom("identifier must be exactly 32 bytes"))
                    }

                    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
                    where
                        E: serde::de::Error,
                    {
                        v.try_into()
                            .map_err(|_| E::custom("identifier must be exactly 32 bytes"))
                    }
                }

                let bytes = if deserializer.is_human_readable() {
                    deserializer.deserialize_str(IdVisitor)?
                } else {
                    deserializer.deserialize_bytes(IdVisitor)?
                };
                Ok(Self(bytes))
            }
        }
    };
}

define_id! {
    /// Identifier of a registered external asset (the underlying unit a
    /// vault accounts for, e.g. a stablecoin).
    ///
    /// Derived from the asset's canonical symbol, so registering the same
    /// symbol twice collides deliberately -- the registry uses this to
    /// enforce exactly-once registration.
    AssetId
}

define_id! {
    /// Identifier of a vault (a named accounting domain).
    VaultId
}

define_id! {
    /// Identifier of one settlement batch within a vault.
    ///
    /// Derived from (vault, asset, sequence). Sequences increase
    /// monotonically per vault and are never reused, so a batch id names
    /// exactly one lifecycle `Open -> Closed -> Settled` forever.
    BatchId
}

define_id! {
    /// Identifier of a settlement proposal.
    ProposalId
}

define_id! {
    /// Identifier of a gateway request (redeem, stake, or unstake).
    ///
    /// The derivation includes a per-gateway monotonic counter so two
    /// requests with identical requester/amount/timestamp still get
    /// distinct ids.
    RequestId
}

impl AssetId {
    /// Derives the id for an asset symbol.
    ///
    /// Preimage: `"asset" || 0x00 || symbol`.
    pub fn derive(symbol: &str) -> Self {
        let mut preimage = Vec::with_capacity(symbol.len() + 8);
        preimage.extend_from_slice(b"asset");
        preimage.push(0x00);
        preimage.extend_from_slice(symbol.as_bytes());
        Self(digest(&preimage))
    }
}

impl VaultId {
    /// Derives the id for a vault name.
    ///
    /// Preimage: `"vault" || 0x00 || name`.
    pub fn derive(name: &str) -> Self {
        let mut preimage = Vec::with_capacity(name.len() + 8);
        preimage.extend_from_slice(b"vault");
        preimage.push(0x00);
        preimage.extend_from_slice(name.as_bytes());
        Self(digest(&preimage))
    }
}

impl BatchId {
    /// Derives the id for a batch.
    ///
    /// Preimage: `"batch" || 0x00 || vault || 0x00 || asset || 0x00 ||
    /// sequence (8 bytes BE)`. Fixed-width fields need no length framing;
    /// the separators keep the layout unambiguous against future fields.
    pub fn derive(vault: &VaultId, asset: &AssetId, sequence: u64) -> Self {
        let mut preimage = Vec::with_capacity(80);
        preimage.extend_from_slice(b"batch");
        preimage.push(0x00);
        preimage.extend_from_slice(vault.as_bytes());
        preimage.push(0x00);
        preimage.extend_from_slice(asset.as_bytes());
        preimage.push(0x00);
        preimage.extend_from_slice(&sequence.to_be_bytes());
        Self(digest(&preimage))
    }
}

impl ProposalId {
    /// Derives the id for a settlement proposal.
    ///
    /// Preimage: `"proposal" || 0x00 || vault || 0x00 || batch || 0x00 ||
    /// asset || 0x00 || nonce (8 bytes BE)`. The nonce is a router-wide
    /// monotonic counter: a cancelled proposal and its replacement for the
    /// same batch must not share an id.
    pub fn derive(vault: &VaultId, batch: &BatchId, asset: &AssetId, nonce: u64) -> Self {
        let mut preimage = Vec::with_capacity(120);
        preimage.extend_from_slice(b"proposal");
        preimage.push(0x00);
        preimage.extend_from_slice(vault.as_bytes());
        preimage.push(0x00);
        preimage.extend_from_slice(batch.as_bytes());
        preimage.push(0x00);
        preimage.extend_from_slice(asset.as_bytes());
        preimage.push(0x00);
        preimage.extend_from_slice(&nonce.to_be_bytes());
        Self(digest(&preimage))
    }
}

impl RequestId {
    /// Derives the id for a gateway request.
    ///
    /// Preimage: `"request" || 0x00 || requester || 0x00 || amount (8 bytes
    /// BE) || timestamp micros (8 bytes BE) || counter (8 bytes BE)`.
    pub fn derive(requester: &str, amount: u64, timestamp_micros: i64, counter: u64) -> Self {
        let mut preimage = Vec::with_capacity(requester.len() + 40);
        preimage.extend_from_slice(b"request");
        preimage.push(0x00);
        preimage.extend_from_slice(requester.as_bytes());
        preimage.push(0x00);
        preimage.extend_from_slice(&amount.to_be_bytes());
        preimage.extend_from_slice(&timestamp_micros.to_be_bytes());
        preimage.extend_from_slice(&counter.to_be_bytes());
        Self(digest(&preimage))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_id_derivation_is_deterministic() {
        assert_eq!(AssetId::derive("USDC"), AssetId::derive("USDC"));
        assert_ne!(AssetId::derive("USDC"), AssetId::derive("USDT"));
    }

    #[test]
    fn domain_tags_separate_id_spaces() {
        // Same input string through different derivations must never collide.
        let asset = AssetId::derive("alpha");
        let vault = VaultId::derive("alpha");
        assert_ne!(asset.as_bytes(), vault.as_bytes());
    }

    #[test]
    fn batch_id_changes_with_sequence() {
        let vault = VaultId::derive("primary-usdc");
        let asset = AssetId::derive("USDC");
        let b0 = BatchId::derive(&vault, &asset, 0);
        let b1 = BatchId::derive(&vault, &asset, 1);
        assert_ne!(b0, b1);
        assert_eq!(b0, BatchId::derive(&vault, &asset, 0));
    }

    #[test]
    fn proposal_id_changes_with_nonce() {
        let vault = VaultId::derive("primary-usdc");
        let asset = AssetId::derive("USDC");
        let batch = BatchId::derive(&vault, &asset, 3);
        let p0 = ProposalId::derive(&vault, &batch, &asset, 0);
        let p1 = ProposalId::derive(&vault, &batch, &asset, 1);
        assert_ne!(p0, p1);
    }

    #[test]
    fn request_id_counter_prevents_same_instant_collision() {
        let a = RequestId::derive("cairn:acme", 1_000, 1_700_000_000_000_000, 0);
        let b = RequestId::derive("cairn:acme", 1_000, 1_700_000_000_000_000, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn hex_roundtrip() {
        let id = VaultId::derive("staking-pool");
        let recovered = VaultId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, recovered);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(AssetId::from_hex("deadbeef").is_err());
    }

    #[test]
    fn display_is_full_hex_and_debug_is_truncated() {
        let id = BatchId::derive(&VaultId::derive("v"), &AssetId::derive("A"), 7);
        assert_eq!(format!("{id}").len(), 64);
        let debug = format!("{id:?}");
        assert!(debug.starts_with("BatchId("));
        assert!(debug.ends_with("...)"));
    }

    #[test]
    fn json_serializes_as_hex_string() {
        let id = AssetId::derive("USDC");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let recovered: AssetId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, recovered);
    }

    #[test]
    fn bincode_roundtrip_uses_raw_bytes() {
        let id = RequestId::derive("cairn:acme", 42, 0, 9);
        let bytes = bincode::serialize(&id).expect("serialize");
        // Length prefix (8 bytes) plus the 32-byte digest.
        assert_eq!(bytes.len(), 40);
        let recovered: RequestId = bincode::deserialize(&bytes).expect("deserialize");
        assert_eq!(id, recovered);
    }

    #[test]
    fn parse_via_fromstr() {
        let id = ProposalId::derive(
            &VaultId::derive("v"),
            &BatchId::derive(&VaultId::derive("v"), &AssetId::derive("A"), 0),
            &AssetId::derive("A"),
            1,
        );
        let parsed: ProposalId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
