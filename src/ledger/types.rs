//! Ledger data model shared by the pipeline and the ledger bindings.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use super::error::LedgerError;

fn parse_fixed_hex<const N: usize>(s: &str) -> Result<[u8; N], String> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(stripped).map_err(|e| format!("invalid hex '{}': {}", s, e))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("expected {} bytes, got {}", N, b.len()))
}

/// Opaque 32-byte position identifier (the loan order hash).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PositionId(pub [u8; 32]);

/// 20-byte ledger account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

macro_rules! hex_newtype {
    ($ty:ident, $len:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_fixed_hex::<$len>(s).map(Self)
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_newtype!(PositionId, 32);
hex_newtype!(Address, 20);

/// An open margin position as listed by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub position_id: PositionId,
    pub counterparty: Address,
    /// Unix seconds
    pub expiry_timestamp: u64,
}

/// Collateral figures for a position, in the ledger base unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginSnapshot {
    pub initial: u128,
    pub maintenance: u128,
    pub current: u128,
}

impl MarginSnapshot {
    pub fn new(initial: u128, maintenance: u128, current: u128) -> Self {
        Self {
            initial,
            maintenance,
            current,
        }
    }

    /// Snapshot used when the margin read fails. Always unsafe.
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_undercollateralized(&self) -> bool {
        self.current <= self.maintenance
    }
}

/// A closing call against one position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureCall {
    pub position_id: PositionId,
    pub counterparty: Address,
    pub sender: Address,
    /// 0 closes the maximum the ledger allows
    pub amount: u128,
}

/// Gas allotted to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasBudget {
    pub gas_limit: u64,
    pub gas_price: u128,
}

/// Final result of a confirmed closure transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureReceipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
}

pub type ConfirmationFuture =
    Pin<Box<dyn Future<Output = Result<ClosureReceipt, LedgerError>> + Send>>;

/// Two-stage submission result: the hash is known as soon as the ledger
/// accepts the transaction, the receipt only after confirmation.
pub struct PendingSubmission {
    pub tx_hash: String,
    pub confirmation: ConfirmationFuture,
}

impl PendingSubmission {
    pub fn new(tx_hash: String, confirmation: ConfirmationFuture) -> Self {
        Self {
            tx_hash,
            confirmation,
        }
    }

    /// Submission whose confirmation outcome is already known.
    pub fn settled(tx_hash: String, result: Result<ClosureReceipt, LedgerError>) -> Self {
        Self {
            tx_hash,
            confirmation: Box::pin(async move { result }),
        }
    }
}

impl fmt::Debug for PendingSubmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSubmission")
            .field("tx_hash", &self.tx_hash)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_id_hex_roundtrip_with_prefix() {
        let raw = "0xb77ef4d44921f346d48c33902de3bce4a89087aad60c7373394a51092c9824f0";
        let id: PositionId = raw.parse().unwrap();
        assert_eq!(id.to_string(), raw);
    }

    #[test]
    fn test_address_rejects_wrong_length() {
        assert!("0xdeadbeef".parse::<Address>().is_err());
        assert!("0xdf2db45ed0df076e5d6d302b416a5971ff5ad61f"
            .parse::<Address>()
            .is_ok());
    }

    #[test]
    fn test_zero_snapshot_is_undercollateralized() {
        assert!(MarginSnapshot::zero().is_undercollateralized());
        assert!(MarginSnapshot::new(200, 150, 150).is_undercollateralized());
        assert!(!MarginSnapshot::new(200, 150, 151).is_undercollateralized());
    }

    #[test]
    fn test_address_serde_as_hex_string() {
        let addr: Address = "0xdf2db45ed0df076e5d6d302b416a5971ff5ad61f".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"0xdf2db45ed0df076e5d6d302b416a5971ff5ad61f\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
