use k256::ecdsa::SigningKey;
use rlp::{Rlp, RlpStream};

use crate::codec::{self, keccak};
use crate::crypto::{address_from_public_key, recover_public_key, sign_digest};
use crate::errors::{ChainError, ChainResult};

use super::{Address, Hash};

/// A signed vote for one pending block at `(block_number, voting_round)`.
///
/// Identity for deduplication is `hash`; the equivocation key is
/// `(miner_address, block_number, voting_round)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vote {
    pub miner_address: Address,
    pub block_number: u64,
    pub block_hash: Hash,
    pub voting_round: u32,
    pub v: u8,
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub hash: Hash,
}

impl Vote {
    pub fn create(
        miner_address: Address,
        block_number: u64,
        block_hash: Hash,
        voting_round: u32,
        keypair: &SigningKey,
    ) -> ChainResult<Self> {
        let mut vote = Self {
            miner_address,
            block_number,
            block_hash,
            voting_round,
            v: 0,
            r: [0u8; 32],
            s: [0u8; 32],
            hash: [0u8; 32],
        };
        let digest = keccak(&vote.unsigned_bytes());
        let (v, r, s) = sign_digest(keypair, &digest)?;
        vote.v = v;
        vote.r = r;
        vote.s = s;
        vote.hash = keccak(&vote.encode());
        Ok(vote)
    }

    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(4);
        codec::append_address(&mut stream, &self.miner_address);
        stream.append(&self.block_number);
        codec::append_hash(&mut stream, &self.block_hash);
        stream.append(&self.voting_round);
        stream.out().to_vec()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(7);
        codec::append_address(&mut stream, &self.miner_address);
        stream.append(&self.block_number);
        codec::append_hash(&mut stream, &self.block_hash);
        stream.append(&self.voting_round);
        stream.append(&self.v);
        stream.append(&self.r.to_vec());
        stream.append(&self.s.to_vec());
        stream.out().to_vec()
    }

    pub fn decode(bytes: &[u8]) -> ChainResult<Self> {
        let rlp = Rlp::new(bytes);
        if rlp.item_count()? != 7 {
            return Err(ChainError::MalformedPayload("vote must have 7 fields".into()));
        }
        let r: Vec<u8> = rlp.val_at(5)?;
        let s: Vec<u8> = rlp.val_at(6)?;
        let mut vote = Self {
            miner_address: codec::address_at(&rlp, 0)?,
            block_number: rlp.val_at(1)?,
            block_hash: codec::hash_at(&rlp, 2)?,
            voting_round: rlp.val_at(3)?,
            v: rlp.val_at(4)?,
            r: r.as_slice()
                .try_into()
                .map_err(|_| ChainError::MalformedPayload("r must be 32 bytes".into()))?,
            s: s.as_slice()
                .try_into()
                .map_err(|_| ChainError::MalformedPayload("s must be 32 bytes".into()))?,
            hash: [0u8; 32],
        };
        vote.hash = keccak(&vote.encode());
        Ok(vote)
    }

    /// Recovers the signer and requires it to equal the declared miner.
    pub fn verify(&self) -> ChainResult<Address> {
        if self.hash != keccak(&self.encode()) {
            return Err(ChainError::MalformedPayload(
                "vote hash does not match its encoding".into(),
            ));
        }
        let digest = keccak(&self.unsigned_bytes());
        let public_key = recover_public_key(&digest, self.v, &self.r, &self.s)?;
        let recovered = address_from_public_key(&public_key);
        if recovered != self.miner_address {
            return Err(ChainError::SenderMismatch {
                declared: self.miner_address,
                recovered,
            });
        }
        Ok(recovered)
    }

    pub fn round_key(&self) -> (Address, u64, u32) {
        (self.miner_address, self.block_number, self.voting_round)
    }
}
