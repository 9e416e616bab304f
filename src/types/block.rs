use rlp::{Rlp, RlpStream};

use crate::codec::{self, keccak};
use crate::errors::{ChainError, ChainResult};

use super::{Hash, Transaction, ZERO_HASH};

/// A proposed block. Confirmed blocks share the same layout and hash
/// domain; confirmation only moves the header into the blocks table.
///
/// The header row never carries the body; bodies live in the
/// content-addressed trie store keyed by the block hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingBlock {
    pub prev_hash: Hash,
    pub number: u64,
    pub state_root: Hash,
    pub receipt_root: Hash,
    pub tx_root: Hash,
    pub hash: Hash,
    pub body: Option<Vec<Transaction>>,
}

impl PendingBlock {
    pub fn new(
        prev_hash: Hash,
        number: u64,
        state_root: Hash,
        receipt_root: Hash,
        tx_root: Hash,
        body: Vec<Transaction>,
    ) -> Self {
        let mut block = Self {
            prev_hash,
            number,
            state_root,
            receipt_root,
            tx_root,
            hash: ZERO_HASH,
            body: Some(body),
        };
        block.hash = keccak(&block.header_bytes());
        block
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash == ZERO_HASH
    }

    /// RLP of the five header fields; the block hash is keccak-256 over it.
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(5);
        codec::append_hash(&mut stream, &self.prev_hash);
        stream.append(&self.number);
        codec::append_hash(&mut stream, &self.state_root);
        codec::append_hash(&mut stream, &self.receipt_root);
        codec::append_hash(&mut stream, &self.tx_root);
        stream.out().to_vec()
    }

    pub fn decode_header(bytes: &[u8]) -> ChainResult<Self> {
        let rlp = Rlp::new(bytes);
        if rlp.item_count()? != 5 {
            return Err(ChainError::MalformedPayload(
                "block header must have 5 fields".into(),
            ));
        }
        let mut block = Self {
            prev_hash: codec::hash_at(&rlp, 0)?,
            number: rlp.val_at(1)?,
            state_root: codec::hash_at(&rlp, 2)?,
            receipt_root: codec::hash_at(&rlp, 3)?,
            tx_root: codec::hash_at(&rlp, 4)?,
            hash: ZERO_HASH,
            body: None,
        };
        block.hash = keccak(&block.header_bytes());
        Ok(block)
    }

    /// Strips the in-memory body, leaving the bare header row.
    pub fn without_body(&self) -> Self {
        Self {
            body: None,
            ..self.clone()
        }
    }
}
