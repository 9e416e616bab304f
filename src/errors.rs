use std::io;

use thiserror::Error;

use crate::types::Address;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("recovered signer {recovered} does not match declared sender {declared}")]
    SenderMismatch {
        declared: Address,
        recovered: Address,
    },
    #[error("miner {0} is not registered")]
    UnknownMiner(Address),
    #[error("nonce gap: expected {expected}, found {found}")]
    NonceGap { expected: u64, found: u64 },
    #[error("insufficient balance: have {balance}, need more than {required}")]
    InsufficientBalance { balance: String, required: String },
    #[error("entity already known: {0}")]
    DuplicateHash(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("mempool is full")]
    MempoolFull,
    #[error("no candidate block for height {0}")]
    NoCandidateBlock(u64),
    #[error("cannot assemble a block from an empty transaction batch")]
    EmptyTransactionBatch,
    #[error("{0} not found")]
    NotFound(String),
    #[error("block body trie is missing or pruned: {0}")]
    TrieMissing(String),
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;

impl From<rlp::DecoderError> for ChainError {
    fn from(err: rlp::DecoderError) -> Self {
        ChainError::MalformedPayload(err.to_string())
    }
}
