use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{ChainError, ChainResult};

mod block;
mod miner;
mod transaction;
mod vote;

pub use block::PendingBlock;
pub use miner::{unix_timestamp, Miner};
pub use transaction::{Transaction, TxKind};
pub use vote::Vote;

pub type Hash = [u8; 32];

pub const ZERO_HASH: Hash = [0u8; 32];

/// 20-byte account address derived from a secp256k1 public key.
///
/// Rendered as uppercase hex externally; parsing accepts either case.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> ChainResult<Self> {
        let bytes: [u8; 20] = slice
            .try_into()
            .map_err(|_| ChainError::MalformedPayload("address must be 20 bytes".into()))?;
        Ok(Self(bytes))
    }

    pub fn from_hex(raw: &str) -> ChainResult<Self> {
        let bytes = hex::decode(raw.trim_start_matches("0x"))
            .map_err(|err| ChainError::MalformedPayload(format!("invalid address hex: {err}")))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = ChainError;

    fn from_str(raw: &str) -> ChainResult<Self> {
        Self::from_hex(raw)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Address::from_hex(&raw).map_err(D::Error::custom)
    }
}
