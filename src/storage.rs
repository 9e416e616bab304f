use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options,
};

use crate::errors::{ChainError, ChainResult};
use crate::trie::Trie;
use crate::types::{Hash, Miner, PendingBlock, Transaction, Vote, ZERO_HASH};

pub const STORAGE_SCHEMA_VERSION: u32 = 1;

/// Default bound for table listings.
pub const DEFAULT_QUERY_LIMIT: usize = 2_000;

const CF_PENDING_TRANSACTIONS: &str = "pending_transactions";
const CF_PENDING_BLOCKS: &str = "pending_blocks";
const CF_BLOCKS: &str = "blocks";
const CF_VOTES: &str = "votes";
const CF_MINERS: &str = "miners";
const CF_BODY_NODES: &str = "pending_block_bodies";
const CF_METADATA: &str = "metadata";

const HEAD_HASH_KEY: &[u8] = b"head_hash";
const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";
const SLASH_MARKER_PREFIX: &[u8] = b"slashed/";

const COLUMN_FAMILIES: [&str; 7] = [
    CF_PENDING_TRANSACTIONS,
    CF_PENDING_BLOCKS,
    CF_BLOCKS,
    CF_VOTES,
    CF_MINERS,
    CF_BODY_NODES,
    CF_METADATA,
];

pub struct Storage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

impl Storage {
    pub fn open(path: &Path) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, descriptors)?;
        let storage = Self { db: Arc::new(db) };
        storage.ensure_schema_supported()?;
        Ok(storage)
    }

    fn cf(&self, name: &str) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainError::Config(format!("missing column family {name}")))
    }

    fn ensure_schema_supported(&self) -> ChainResult<()> {
        let metadata = self.cf(CF_METADATA)?;
        match self.db.get_cf(&metadata, SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Config("invalid schema version encoding".into()))?;
                let version = u32::from_be_bytes(bytes);
                if version != STORAGE_SCHEMA_VERSION {
                    return Err(ChainError::Config(format!(
                        "database schema version {version} is not supported (expected {STORAGE_SCHEMA_VERSION})"
                    )));
                }
                Ok(())
            }
            None => {
                self.db.put_cf(
                    &metadata,
                    SCHEMA_VERSION_KEY,
                    STORAGE_SCHEMA_VERSION.to_be_bytes(),
                )?;
                Ok(())
            }
        }
    }

    // --- pending transactions ------------------------------------------------

    pub fn put_pending_transaction(&self, tx: &Transaction) -> ChainResult<()> {
        let cf = self.cf(CF_PENDING_TRANSACTIONS)?;
        self.db.put_cf(&cf, tx.hash, tx.encode())?;
        Ok(())
    }

    pub fn get_pending_transaction(&self, hash: &Hash) -> ChainResult<Option<Transaction>> {
        let cf = self.cf(CF_PENDING_TRANSACTIONS)?;
        match self.db.get_cf(&cf, hash)? {
            Some(bytes) => Ok(Some(Transaction::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_pending_transaction(&self, hash: &Hash) -> ChainResult<()> {
        let cf = self.cf(CF_PENDING_TRANSACTIONS)?;
        self.db.delete_cf(&cf, hash)?;
        Ok(())
    }

    pub fn list_pending_transactions(&self, limit: usize) -> ChainResult<Vec<Transaction>> {
        let cf = self.cf(CF_PENDING_TRANSACTIONS)?;
        let mut transactions = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            if transactions.len() >= limit {
                break;
            }
            let (_key, value) = entry?;
            transactions.push(Transaction::decode(&value)?);
        }
        Ok(transactions)
    }

    pub fn count_pending_transactions(&self) -> ChainResult<usize> {
        let cf = self.cf(CF_PENDING_TRANSACTIONS)?;
        let mut count = 0usize;
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    // --- pending blocks ------------------------------------------------------

    /// Persists a pending block. When a body is attached it is moved into
    /// the content-addressed trie namespace; the header row never carries it.
    pub fn put_pending_block(&self, block: &PendingBlock) -> ChainResult<()> {
        if let Some(transactions) = &block.body {
            self.persist_body(&block.hash, &block.tx_root, transactions)?;
        }
        let cf = self.cf(CF_PENDING_BLOCKS)?;
        self.db.put_cf(&cf, block.hash, block.header_bytes())?;
        Ok(())
    }

    pub fn get_pending_block(&self, hash: &Hash) -> ChainResult<Option<PendingBlock>> {
        let cf = self.cf(CF_PENDING_BLOCKS)?;
        match self.db.get_cf(&cf, hash)? {
            Some(bytes) => Ok(Some(PendingBlock::decode_header(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_pending_blocks(&self, limit: usize) -> ChainResult<Vec<PendingBlock>> {
        let cf = self.cf(CF_PENDING_BLOCKS)?;
        let mut blocks = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            if blocks.len() >= limit {
                break;
            }
            let (_key, value) = entry?;
            blocks.push(PendingBlock::decode_header(&value)?);
        }
        Ok(blocks)
    }

    pub fn list_pending_blocks_at(&self, number: u64) -> ChainResult<Vec<PendingBlock>> {
        let mut blocks = self.list_pending_blocks(DEFAULT_QUERY_LIMIT)?;
        blocks.retain(|block| block.number == number);
        blocks.sort_by(|a, b| a.hash.cmp(&b.hash));
        Ok(blocks)
    }

    pub fn delete_pending_block(&self, hash: &Hash) -> ChainResult<()> {
        let cf = self.cf(CF_PENDING_BLOCKS)?;
        self.db.delete_cf(&cf, hash)?;
        self.delete_body(hash)?;
        Ok(())
    }

    // --- block bodies --------------------------------------------------------

    fn persist_body(
        &self,
        block_hash: &Hash,
        tx_root: &Hash,
        transactions: &[Transaction],
    ) -> ChainResult<()> {
        let trie = body_trie(transactions)?;
        if trie.root_hash() != *tx_root {
            return Err(ChainError::MalformedPayload(
                "body does not match the declared transaction root".into(),
            ));
        }
        let cf = self.cf(CF_BODY_NODES)?;
        for (node_hash, bytes) in trie.nodes() {
            let mut key = Vec::with_capacity(64);
            key.extend_from_slice(block_hash);
            key.extend_from_slice(node_hash);
            self.db.put_cf(&cf, key, bytes)?;
        }
        self.db.put_cf(&cf, block_hash, trie.root_hash())?;
        Ok(())
    }

    /// Loads and decodes the transaction list for a block hash. Fails with
    /// `TrieMissing` when the trie was pruned.
    pub fn load_block_body(&self, block_hash: &Hash) -> ChainResult<Vec<Transaction>> {
        let cf = self.cf(CF_BODY_NODES)?;
        let root: Hash = match self.db.get_cf(&cf, block_hash)? {
            Some(bytes) => bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainError::Config("invalid body root encoding".into()))?,
            None => return Err(ChainError::TrieMissing(hex::encode_upper(block_hash))),
        };
        let mut nodes = HashMap::new();
        for entry in self
            .db
            .iterator_cf(&cf, IteratorMode::From(block_hash, Direction::Forward))
        {
            let (key, value) = entry?;
            if !key.starts_with(block_hash) {
                break;
            }
            if key.len() != 64 {
                // the root marker shares the 32-byte prefix
                continue;
            }
            let node_hash: Hash = key[32..]
                .try_into()
                .map_err(|_| ChainError::Config("invalid body node key".into()))?;
            nodes.insert(node_hash, value.to_vec());
        }
        let trie = Trie::from_parts(root, nodes);
        let mut transactions = Vec::new();
        for index in 0u64.. {
            match trie.get(&rlp::encode(&index))? {
                Some(bytes) => transactions.push(Transaction::decode(&bytes)?),
                None => break,
            }
        }
        Ok(transactions)
    }

    fn delete_body(&self, block_hash: &Hash) -> ChainResult<()> {
        let cf = self.cf(CF_BODY_NODES)?;
        let mut keys = Vec::new();
        for entry in self
            .db
            .iterator_cf(&cf, IteratorMode::From(block_hash, Direction::Forward))
        {
            let (key, _value) = entry?;
            if !key.starts_with(block_hash) {
                break;
            }
            keys.push(key.to_vec());
        }
        for key in keys {
            self.db.delete_cf(&cf, key)?;
        }
        Ok(())
    }

    // --- confirmed blocks ----------------------------------------------------

    /// Commits a block. The header is copied into the blocks table and the
    /// head pointer advances; the body must already live in the trie store
    /// (or be attached).
    pub fn put_block(&self, block: &PendingBlock) -> ChainResult<()> {
        if let Some(transactions) = &block.body {
            self.persist_body(&block.hash, &block.tx_root, transactions)?;
        }
        let cf = self.cf(CF_BLOCKS)?;
        self.db.put_cf(&cf, block.hash, block.header_bytes())?;
        let metadata = self.cf(CF_METADATA)?;
        let advance = match self.head_block()? {
            Some(head) => block.number >= head.number,
            None => true,
        };
        if advance {
            self.db.put_cf(&metadata, HEAD_HASH_KEY, block.hash)?;
        }
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash) -> ChainResult<Option<PendingBlock>> {
        let cf = self.cf(CF_BLOCKS)?;
        match self.db.get_cf(&cf, hash)? {
            Some(bytes) => Ok(Some(PendingBlock::decode_header(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn head_block(&self) -> ChainResult<Option<PendingBlock>> {
        let metadata = self.cf(CF_METADATA)?;
        let hash: Hash = match self.db.get_cf(&metadata, HEAD_HASH_KEY)? {
            Some(bytes) => bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainError::Config("invalid head hash encoding".into()))?,
            None => return Ok(None),
        };
        self.get_block(&hash)
    }

    pub fn list_blocks(&self, limit: usize) -> ChainResult<Vec<PendingBlock>> {
        let cf = self.cf(CF_BLOCKS)?;
        let mut blocks = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            if blocks.len() >= limit {
                break;
            }
            let (_key, value) = entry?;
            blocks.push(PendingBlock::decode_header(&value)?);
        }
        Ok(blocks)
    }

    /// Walks `prev_hash` links from the given block back to genesis. The
    /// starting block is included first.
    pub fn list_preceding_blocks(&self, block: &PendingBlock) -> ChainResult<Vec<PendingBlock>> {
        let mut chain = vec![block.without_body()];
        let mut prev = block.prev_hash;
        while prev != ZERO_HASH {
            let parent = self
                .get_block(&prev)?
                .ok_or_else(|| ChainError::NotFound(format!("block {}", hex::encode_upper(prev))))?;
            prev = parent.prev_hash;
            chain.push(parent);
        }
        Ok(chain)
    }

    // --- votes ---------------------------------------------------------------

    pub fn put_vote(&self, vote: &Vote) -> ChainResult<()> {
        let cf = self.cf(CF_VOTES)?;
        self.db.put_cf(&cf, vote.hash, vote.encode())?;
        Ok(())
    }

    pub fn get_vote(&self, hash: &Hash) -> ChainResult<Option<Vote>> {
        let cf = self.cf(CF_VOTES)?;
        match self.db.get_cf(&cf, hash)? {
            Some(bytes) => Ok(Some(Vote::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_votes(&self, limit: usize) -> ChainResult<Vec<Vote>> {
        let cf = self.cf(CF_VOTES)?;
        let mut votes = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            if votes.len() >= limit {
                break;
            }
            let (_key, value) = entry?;
            votes.push(Vote::decode(&value)?);
        }
        Ok(votes)
    }

    // --- miners --------------------------------------------------------------

    pub fn put_miner(&self, miner: &Miner) -> ChainResult<()> {
        let cf = self.cf(CF_MINERS)?;
        let data = bincode::serialize(miner)?;
        self.db.put_cf(&cf, miner.address.as_bytes(), data)?;
        Ok(())
    }

    pub fn get_miner(&self, address: &crate::types::Address) -> ChainResult<Option<Miner>> {
        let cf = self.cf(CF_MINERS)?;
        match self.db.get_cf(&cf, address.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_miners(&self, limit: usize) -> ChainResult<Vec<Miner>> {
        let cf = self.cf(CF_MINERS)?;
        let mut miners: Vec<Miner> = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            if miners.len() >= limit {
                break;
            }
            let (_key, value) = entry?;
            miners.push(bincode::deserialize(&value)?);
        }
        miners.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(miners)
    }

    // --- slash markers -------------------------------------------------------

    fn slash_marker_key(offender: &crate::types::Address, height: u64, round: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(SLASH_MARKER_PREFIX.len() + 20 + 8 + 4);
        key.extend_from_slice(SLASH_MARKER_PREFIX);
        key.extend_from_slice(offender.as_bytes());
        key.extend_from_slice(&height.to_be_bytes());
        key.extend_from_slice(&round.to_be_bytes());
        key
    }

    pub fn has_slash_marker(
        &self,
        offender: &crate::types::Address,
        height: u64,
        round: u32,
    ) -> ChainResult<bool> {
        let metadata = self.cf(CF_METADATA)?;
        Ok(self
            .db
            .get_cf(&metadata, Self::slash_marker_key(offender, height, round))?
            .is_some())
    }

    pub fn put_slash_marker(
        &self,
        offender: &crate::types::Address,
        height: u64,
        round: u32,
    ) -> ChainResult<()> {
        let metadata = self.cf(CF_METADATA)?;
        self.db
            .put_cf(&metadata, Self::slash_marker_key(offender, height, round), [1u8])?;
        Ok(())
    }
}

/// Builds the body trie over `(rlp(index) -> rlp(tx))` entries.
pub fn body_trie(transactions: &[Transaction]) -> ChainResult<Trie> {
    let mut trie = Trie::new();
    for (index, tx) in transactions.iter().enumerate() {
        trie.insert(&rlp::encode(&(index as u64)), tx.encode())?;
    }
    Ok(trie)
}
