use std::fs;
use std::path::Path;

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::codec::keccak;
use crate::errors::{ChainError, ChainResult};
use crate::types::{Address, Hash};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub public_key: String,
    pub secret_key: String,
}

pub fn generate_keypair() -> SigningKey {
    SigningKey::random(&mut OsRng)
}

pub fn load_or_generate_keypair(path: &Path) -> ChainResult<SigningKey> {
    if path.exists() {
        load_keypair(path)
    } else {
        let keypair = generate_keypair();
        save_keypair(path, &keypair)?;
        Ok(keypair)
    }
}

pub fn save_keypair(path: &Path, keypair: &SigningKey) -> ChainResult<()> {
    let stored = StoredKeypair {
        public_key: hex::encode(keypair.verifying_key().to_encoded_point(false).as_bytes()),
        secret_key: hex::encode(keypair.to_bytes()),
    };
    let encoded = toml::to_string_pretty(&stored)
        .map_err(|err| ChainError::Config(format!("failed to encode keypair: {err}")))?;
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    fs::write(path, encoded)?;
    Ok(())
}

pub fn load_keypair(path: &Path) -> ChainResult<SigningKey> {
    let raw = fs::read_to_string(path)?;
    let stored: StoredKeypair = toml::from_str(&raw)
        .map_err(|err| ChainError::Config(format!("failed to decode keypair: {err}")))?;
    let secret_bytes = hex::decode(stored.secret_key)
        .map_err(|err| ChainError::Config(format!("invalid secret key encoding: {err}")))?;
    SigningKey::from_slice(&secret_bytes)
        .map_err(|err| ChainError::Config(format!("invalid secret key bytes: {err}")))
}

/// Signs a 32-byte digest, returning the `(v, r, s)` triple with the
/// recovery id folded into `v` (27/28 convention).
pub fn sign_digest(keypair: &SigningKey, digest: &Hash) -> ChainResult<(u8, [u8; 32], [u8; 32])> {
    let (signature, recovery_id) = keypair
        .sign_prehash_recoverable(digest)
        .map_err(|err| ChainError::Crypto(format!("signing failed: {err}")))?;
    let bytes = signature.to_bytes();
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&bytes[..32]);
    s.copy_from_slice(&bytes[32..]);
    Ok((recovery_id.to_byte() + 27, r, s))
}

/// Recovers the signing public key from a digest and `(v, r, s)`.
pub fn recover_public_key(
    digest: &Hash,
    v: u8,
    r: &[u8; 32],
    s: &[u8; 32],
) -> ChainResult<VerifyingKey> {
    let recovery_id = parse_recovery_id(v)?;
    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(r);
    bytes[32..].copy_from_slice(s);
    let signature = Signature::from_slice(&bytes)
        .map_err(|err| ChainError::InvalidSignature(format!("invalid signature bytes: {err}")))?;
    VerifyingKey::recover_from_prehash(digest, &signature, recovery_id)
        .map_err(|err| ChainError::InvalidSignature(format!("recovery failed: {err}")))
}

/// Derives the 20-byte address: last 20 bytes of keccak-256 over the
/// uncompressed public key without its 0x04 prefix.
pub fn address_from_public_key(public_key: &VerifyingKey) -> Address {
    let encoded = public_key.to_encoded_point(false);
    let digest = keccak(&encoded.as_bytes()[1..]);
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest[12..]);
    Address::from_bytes(bytes)
}

pub fn address_of(keypair: &SigningKey) -> Address {
    address_from_public_key(keypair.verifying_key())
}

fn parse_recovery_id(v: u8) -> ChainResult<RecoveryId> {
    let id = match v {
        0 | 27 => 0,
        1 | 28 => 1,
        other => {
            return Err(ChainError::InvalidSignature(format!(
                "invalid recovery id {other}"
            )))
        }
    };
    RecoveryId::try_from(id)
        .map_err(|err| ChainError::InvalidSignature(format!("invalid recovery id: {err}")))
}

#[cfg(test)]
pub(crate) fn deterministic_keypair(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed; 32]).expect("deterministic secret key")
}
