//! Deterministic binary encoding shared by every chain entity.
//!
//! Entities serialize as RLP item lists and hash with keccak-256. Monetary
//! values travel as canonical decimal strings (normalized, no trailing
//! zeros) so two nodes never disagree on a hash because of binary float
//! representation.

use std::str::FromStr;

use rlp::{Rlp, RlpStream};
use rust_decimal::Decimal;
use sha3::{Digest, Keccak256};

use crate::errors::{ChainError, ChainResult};
use crate::types::{Address, Hash};

pub fn keccak(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

pub fn append_decimal(stream: &mut RlpStream, value: &Decimal) {
    stream.append(&canonical_decimal(value).into_bytes());
}

pub fn append_hash(stream: &mut RlpStream, hash: &Hash) {
    stream.append(&hash.to_vec());
}

pub fn append_address(stream: &mut RlpStream, address: &Address) {
    stream.append(&address.as_bytes().to_vec());
}

pub fn decimal_at(rlp: &Rlp<'_>, index: usize) -> ChainResult<Decimal> {
    let raw: Vec<u8> = rlp.val_at(index)?;
    let text = String::from_utf8(raw)
        .map_err(|err| ChainError::MalformedPayload(format!("invalid decimal encoding: {err}")))?;
    Decimal::from_str(&text)
        .map(|value| value.normalize())
        .map_err(|err| ChainError::MalformedPayload(format!("invalid decimal value: {err}")))
}

pub fn hash_at(rlp: &Rlp<'_>, index: usize) -> ChainResult<Hash> {
    let raw: Vec<u8> = rlp.val_at(index)?;
    raw.as_slice()
        .try_into()
        .map_err(|_| ChainError::MalformedPayload("hash must be 32 bytes".into()))
}

pub fn address_at(rlp: &Rlp<'_>, index: usize) -> ChainResult<Address> {
    let raw: Vec<u8> = rlp.val_at(index)?;
    Address::from_slice(&raw)
}

/// Normalized decimal rendering used inside every RLP payload.
pub fn canonical_decimal(value: &Decimal) -> String {
    value.normalize().to_string()
}
