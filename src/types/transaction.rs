use k256::ecdsa::SigningKey;
use rlp::{Rlp, RlpStream};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::codec::{self, keccak};
use crate::crypto::{address_from_public_key, recover_public_key, sign_digest};
use crate::errors::{ChainError, ChainResult};

use super::{Address, Hash};

/// Recognized tags inside a transaction's opaque JSON `data` field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxKind {
    Transfer,
    Coinbase,
    Slash,
}

#[derive(Deserialize)]
struct TaggedData {
    tx_type: String,
    #[serde(default)]
    byzantine_behavior_proof: Option<String>,
}

#[derive(Serialize)]
struct CoinbaseData<'a> {
    tx_type: &'a str,
}

#[derive(Serialize)]
struct SlashData<'a> {
    tx_type: &'a str,
    byzantine_behavior_proof: String,
}

/// A signed transaction. The sender is never stored; it is recovered from
/// the signature over the unsigned encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub nonce: u64,
    pub to: Address,
    pub value: Decimal,
    pub fee: Decimal,
    pub data: Vec<u8>,
    pub v: u8,
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub hash: Hash,
}

impl Transaction {
    /// Builds and signs a transaction with the given key.
    pub fn create(
        nonce: u64,
        to: Address,
        value: Decimal,
        fee: Decimal,
        data: Vec<u8>,
        keypair: &SigningKey,
    ) -> ChainResult<Self> {
        let mut tx = Self {
            nonce,
            to,
            value: value.normalize(),
            fee: fee.normalize(),
            data,
            v: 0,
            r: [0u8; 32],
            s: [0u8; 32],
            hash: [0u8; 32],
        };
        let digest = keccak(&tx.unsigned_bytes());
        let (v, r, s) = sign_digest(keypair, &digest)?;
        tx.v = v;
        tx.r = r;
        tx.s = s;
        tx.hash = keccak(&tx.encode());
        Ok(tx)
    }

    pub fn coinbase(
        to: Address,
        value: Decimal,
        fee: Decimal,
        keypair: &SigningKey,
    ) -> ChainResult<Self> {
        let data = serde_json::to_vec(&CoinbaseData {
            tx_type: "coinbase",
        })
        .map_err(|err| ChainError::MalformedPayload(err.to_string()))?;
        Self::create(0, to, value, fee, data, keypair)
    }

    pub fn slash(
        nonce: u64,
        offender: Address,
        fee: Decimal,
        proof: &[u8],
        keypair: &SigningKey,
    ) -> ChainResult<Self> {
        let data = serde_json::to_vec(&SlashData {
            tx_type: "slash",
            byzantine_behavior_proof: hex::encode(proof),
        })
        .map_err(|err| ChainError::MalformedPayload(err.to_string()))?;
        Self::create(nonce, offender, Decimal::ZERO, fee, data, keypair)
    }

    /// RLP of the fields covered by the signature.
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(5);
        stream.append(&self.nonce);
        codec::append_address(&mut stream, &self.to);
        codec::append_decimal(&mut stream, &self.value);
        codec::append_decimal(&mut stream, &self.fee);
        stream.append(&self.data);
        stream.out().to_vec()
    }

    /// Full RLP encoding including the signature; the transaction hash is
    /// keccak-256 over these bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(8);
        stream.append(&self.nonce);
        codec::append_address(&mut stream, &self.to);
        codec::append_decimal(&mut stream, &self.value);
        codec::append_decimal(&mut stream, &self.fee);
        stream.append(&self.data);
        stream.append(&self.v);
        stream.append(&self.r.to_vec());
        stream.append(&self.s.to_vec());
        stream.out().to_vec()
    }

    pub fn decode(bytes: &[u8]) -> ChainResult<Self> {
        let rlp = Rlp::new(bytes);
        if rlp.item_count()? != 8 {
            return Err(ChainError::MalformedPayload(
                "transaction must have 8 fields".into(),
            ));
        }
        let r: Vec<u8> = rlp.val_at(6)?;
        let s: Vec<u8> = rlp.val_at(7)?;
        let mut tx = Self {
            nonce: rlp.val_at(0)?,
            to: codec::address_at(&rlp, 1)?,
            value: codec::decimal_at(&rlp, 2)?,
            fee: codec::decimal_at(&rlp, 3)?,
            data: rlp.val_at(4)?,
            v: rlp.val_at(5)?,
            r: r.as_slice()
                .try_into()
                .map_err(|_| ChainError::MalformedPayload("r must be 32 bytes".into()))?,
            s: s.as_slice()
                .try_into()
                .map_err(|_| ChainError::MalformedPayload("s must be 32 bytes".into()))?,
            hash: [0u8; 32],
        };
        tx.hash = keccak(&tx.encode());
        Ok(tx)
    }

    /// Recovers the sender address from the signature.
    pub fn sender(&self) -> ChainResult<Address> {
        let digest = keccak(&self.unsigned_bytes());
        let public_key = recover_public_key(&digest, self.v, &self.r, &self.s)?;
        Ok(address_from_public_key(&public_key))
    }

    /// Checks hash integrity and recovers the sender.
    pub fn verify(&self) -> ChainResult<Address> {
        if self.hash != keccak(&self.encode()) {
            return Err(ChainError::MalformedPayload(
                "transaction hash does not match its encoding".into(),
            ));
        }
        self.sender()
    }

    pub fn kind(&self) -> TxKind {
        match serde_json::from_slice::<TaggedData>(&self.data) {
            Ok(tagged) if tagged.tx_type == "coinbase" => TxKind::Coinbase,
            Ok(tagged) if tagged.tx_type == "slash" => TxKind::Slash,
            _ => TxKind::Transfer,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.kind() == TxKind::Coinbase
    }

    /// Extracts the hex-decoded equivocation proof from a slash transaction.
    pub fn slash_proof(&self) -> ChainResult<Vec<u8>> {
        let tagged: TaggedData = serde_json::from_slice(&self.data)
            .map_err(|err| ChainError::MalformedPayload(format!("invalid tx data: {err}")))?;
        if tagged.tx_type != "slash" {
            return Err(ChainError::MalformedPayload(
                "transaction is not a slash transaction".into(),
            ));
        }
        let proof = tagged.byzantine_behavior_proof.ok_or_else(|| {
            ChainError::MalformedPayload("slash transaction carries no proof".into())
        })?;
        hex::decode(proof)
            .map_err(|err| ChainError::MalformedPayload(format!("invalid proof hex: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::crypto::{address_of, deterministic_keypair};

    fn sample_tx(keypair: &SigningKey) -> Transaction {
        Transaction::create(
            1,
            Address::from_bytes([2u8; 20]),
            Decimal::from_str("10.50").unwrap(),
            Decimal::from_str("0.30").unwrap(),
            Vec::new(),
            keypair,
        )
        .unwrap()
    }

    #[test]
    fn encoding_round_trips() {
        let keypair = deterministic_keypair(9);
        let tx = sample_tx(&keypair);
        let decoded = Transaction::decode(&tx.encode()).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn hash_covers_signed_encoding() {
        let keypair = deterministic_keypair(9);
        let tx = sample_tx(&keypair);
        assert_eq!(tx.hash, keccak(&tx.encode()));
    }

    #[test]
    fn sender_recovery_matches_signer() {
        let keypair = deterministic_keypair(4);
        let tx = sample_tx(&keypair);
        assert_eq!(tx.verify().unwrap(), address_of(&keypair));
    }

    #[test]
    fn tampered_payload_changes_sender() {
        let keypair = deterministic_keypair(4);
        let mut tx = sample_tx(&keypair);
        tx.nonce = 99;
        tx.hash = keccak(&tx.encode());
        // Signature no longer covers the payload, so either recovery fails
        // or it yields a different address.
        match tx.verify() {
            Ok(address) => assert_ne!(address, address_of(&keypair)),
            Err(err) => assert!(matches!(err, ChainError::InvalidSignature(_))),
        }
    }

    #[test]
    fn decimals_are_normalized_in_hashes() {
        let keypair = deterministic_keypair(5);
        let a = Transaction::create(
            1,
            Address::from_bytes([2u8; 20]),
            Decimal::from_str("10.50").unwrap(),
            Decimal::from_str("1.0").unwrap(),
            Vec::new(),
            &keypair,
        )
        .unwrap();
        let b = Transaction::create(
            1,
            Address::from_bytes([2u8; 20]),
            Decimal::from_str("10.5").unwrap(),
            Decimal::from_str("1").unwrap(),
            Vec::new(),
            &keypair,
        )
        .unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn coinbase_and_slash_are_tagged() {
        let keypair = deterministic_keypair(6);
        let coinbase = Transaction::coinbase(
            address_of(&keypair),
            Decimal::from_str("2.0").unwrap(),
            Decimal::ONE,
            &keypair,
        )
        .unwrap();
        assert_eq!(coinbase.kind(), TxKind::Coinbase);

        let slash = Transaction::slash(
            1,
            Address::from_bytes([9u8; 20]),
            Decimal::ONE,
            b"proof-bytes",
            &keypair,
        )
        .unwrap();
        assert_eq!(slash.kind(), TxKind::Slash);
        assert_eq!(slash.value, Decimal::ZERO);
        assert_eq!(slash.slash_proof().unwrap(), b"proof-bytes");
    }

    #[test]
    fn plain_transfer_is_untagged() {
        let keypair = deterministic_keypair(6);
        let tx = sample_tx(&keypair);
        assert_eq!(tx.kind(), TxKind::Transfer);
        assert!(tx.slash_proof().is_err());
    }
}
