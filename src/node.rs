use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use k256::ecdsa::SigningKey;
use rlp::RlpStream;
use serde::Serialize;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accounts::AccountsView;
use crate::assembler::{BlockAssembler, WorldState};
use crate::codec::keccak;
use crate::config::NodeConfig;
use crate::crypto::{address_of, load_or_generate_keypair};
use crate::errors::ChainResult;
use crate::gossip::{Gossip, NoopGossip};
use crate::mempool::Mempool;
use crate::storage::{Storage, DEFAULT_QUERY_LIMIT};
use crate::types::{Address, Hash, Miner, PendingBlock, Transaction, Vote};
use crate::voting::{VoteManager, VotingConfig};

/// Deterministic stand-in for the external world-state computation: a
/// keccak over the batch's transaction hashes. Independent nodes assembling
/// the same batch produce the same root.
struct HashingWorldState;

impl WorldState for HashingWorldState {
    fn state_root(&self, transactions: &[Transaction]) -> ChainResult<Hash> {
        let mut stream = RlpStream::new_list(transactions.len());
        for tx in transactions {
            stream.append(&tx.hash.to_vec());
        }
        Ok(keccak(&stream.out()))
    }
}

pub struct Node {
    inner: Arc<NodeInner>,
}

#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    keypair: SigningKey,
    address: Address,
    session_id: Uuid,
    storage: Storage,
    mempool: Arc<Mempool>,
    assembler: BlockAssembler,
    votes: VoteManager,
    gossip: Arc<dyn Gossip>,
    mining_interval: Duration,
    gc_interval: Duration,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeStatus {
    pub address: Address,
    pub session_id: Uuid,
    pub chain_id: String,
    pub height: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct MempoolStatus {
    pub pending_transactions: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConsensusStatus {
    pub height: u64,
    pub current_round: u32,
    pub registered_miners: usize,
}

impl Node {
    pub fn new(config: NodeConfig) -> ChainResult<Self> {
        Self::with_gossip(config, Arc::new(NoopGossip))
    }

    pub fn with_gossip(config: NodeConfig, gossip: Arc<dyn Gossip>) -> ChainResult<Self> {
        config.ensure_directories()?;
        let keypair = load_or_generate_keypair(&config.key_path)?;
        let address = address_of(&keypair);
        let storage = Storage::open(&config.data_dir.join("db"))?;

        if storage.list_miners(1)?.is_empty() {
            for entry in &config.genesis.miners {
                storage.put_miner(&Miner::new(entry.address, entry.stake))?;
            }
        }

        let allocations: HashMap<_, _> = config
            .genesis
            .allocations
            .iter()
            .map(|entry| (entry.address, entry.balance))
            .collect();
        let accounts = AccountsView::new(storage.clone(), allocations);
        let mempool = Arc::new(Mempool::new(
            storage.clone(),
            accounts.clone(),
            config.mempool_limit,
            config.pending_query_limit,
            config.target_txs_per_block,
        ));
        let votes = VoteManager::new(
            storage.clone(),
            mempool.clone(),
            accounts,
            gossip.clone(),
            keypair.clone(),
            VotingConfig::from(&config),
        );
        let assembler = BlockAssembler::new(storage.clone(), Arc::new(HashingWorldState));

        let inner = Arc::new(NodeInner {
            mining_interval: Duration::from_millis(config.mining_interval_ms),
            gc_interval: Duration::from_millis(config.gc_interval_ms),
            config,
            keypair,
            address,
            session_id: Uuid::new_v4(),
            storage,
            mempool,
            assembler,
            votes,
            gossip,
        });
        Ok(Self { inner })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            inner: self.inner.clone(),
        }
    }

    pub async fn start(self) -> ChainResult<()> {
        self.inner.run().await
    }
}

impl NodeHandle {
    /// Admits a transaction to the mempool and propagates it.
    pub fn submit_transaction(&self, tx: Transaction) -> ChainResult<Hash> {
        let hash = self.inner.mempool.admit(tx.clone())?;
        self.inner.gossip.broadcast_transaction(&tx);
        Ok(hash)
    }

    /// Records a vote received from a peer.
    pub fn submit_vote(&self, vote: Vote) -> ChainResult<Hash> {
        let hash = vote.hash;
        self.inner.votes.register_vote(vote)?;
        Ok(hash)
    }

    pub fn get_block(&self, hash: &Hash) -> ChainResult<Option<PendingBlock>> {
        self.inner.storage.get_block(hash)
    }

    pub fn head_block(&self) -> ChainResult<Option<PendingBlock>> {
        self.inner.storage.head_block()
    }

    pub fn block_transactions(&self, hash: &Hash) -> ChainResult<Vec<Transaction>> {
        self.inner.storage.load_block_body(hash)
    }

    pub fn address(&self) -> Address {
        self.inner.address
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn node_status(&self) -> ChainResult<NodeStatus> {
        Ok(NodeStatus {
            address: self.inner.address,
            session_id: self.inner.session_id,
            chain_id: self.inner.config.genesis.chain_id.clone(),
            height: self.inner.storage.head_block()?.map(|block| block.number),
        })
    }

    pub fn mempool_status(&self) -> ChainResult<MempoolStatus> {
        Ok(MempoolStatus {
            pending_transactions: self.inner.mempool.len()?,
        })
    }

    pub fn consensus_status(&self) -> ChainResult<ConsensusStatus> {
        let next_height = self
            .inner
            .storage
            .head_block()?
            .map(|block| block.number + 1)
            .unwrap_or(0);
        Ok(ConsensusStatus {
            height: next_height,
            current_round: self.inner.votes.current_voting_round(next_height)?,
            registered_miners: self.inner.storage.list_miners(DEFAULT_QUERY_LIMIT)?.len(),
        })
    }
}

impl NodeInner {
    async fn run(self: Arc<Self>) -> ChainResult<()> {
        info!(address = %self.address, session = %self.session_id, "starting node");
        let gc_inner = self.clone();
        tokio::spawn(async move { gc_inner.gc_loop().await });

        let mut ticker = time::interval(self.mining_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.mine_once().await {
                warn!(%err, "mining round failed");
            }
        }
    }

    /// One pass of the mining loop: drain a fee-ordered batch, assemble a
    /// pending block and drive its height through the voting rounds.
    async fn mine_once(&self) -> ChainResult<()> {
        let batch = self.mempool.get_batch_of_valid_pending_transactions()?;
        if batch.is_empty() {
            debug!("no valid pending transactions, skipping mining slot");
            return Ok(());
        }
        let block = self.assembler.generate_pending_block(batch, &self.keypair)?;
        self.storage.put_pending_block(&block)?;
        self.gossip.broadcast_block(&block);
        info!(
            height = block.number,
            hash = %hex::encode_upper(block.hash),
            "proposed pending block"
        );
        let committed = self.votes.run_height(block.number, Some(&block.hash)).await?;
        info!(
            height = committed.number,
            hash = %hex::encode_upper(committed.hash),
            "height sealed"
        );
        Ok(())
    }

    async fn gc_loop(self: Arc<Self>) {
        let mut ticker = time::interval(self.gc_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.collect_garbage() {
                warn!(%err, "pending-block garbage collection failed");
            }
        }
    }

    /// Drops pending blocks (and their body tries) that sank below the
    /// irreversible height and never got committed.
    fn collect_garbage(&self) -> ChainResult<()> {
        let Some(head) = self.storage.head_block()? else {
            return Ok(());
        };
        let last_irreversible = head.number.saturating_sub(self.config.irreversible_depth);
        for block in self.storage.list_pending_blocks(DEFAULT_QUERY_LIMIT)? {
            if block.number < last_irreversible && self.storage.get_block(&block.hash)?.is_none() {
                debug!(
                    number = block.number,
                    hash = %hex::encode_upper(block.hash),
                    "pruning stale pending block"
                );
                self.storage.delete_pending_block(&block.hash)?;
            }
        }
        Ok(())
    }
}
