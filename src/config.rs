use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::Address;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub rpc_listen: SocketAddr,
    #[serde(default = "default_mining_interval_ms")]
    pub mining_interval_ms: u64,
    #[serde(default = "default_target_txs_per_block")]
    pub target_txs_per_block: usize,
    #[serde(default = "default_mempool_limit")]
    pub mempool_limit: usize,
    #[serde(default = "default_pending_query_limit")]
    pub pending_query_limit: usize,
    #[serde(default = "default_vote_collection_timeout_ms")]
    pub vote_collection_timeout_ms: u64,
    #[serde(default = "default_vote_collection_intervals")]
    pub vote_collection_intervals: u32,
    #[serde(default = "default_early_vote_counting_threshold")]
    pub early_vote_counting_threshold: usize,
    #[serde(default = "default_quorum_size")]
    pub quorum_size: usize,
    #[serde(default = "default_warm_up_secs")]
    pub warm_up_secs: u64,
    #[serde(default)]
    pub enforce_warm_up: bool,
    #[serde(default = "default_irreversible_depth")]
    pub irreversible_depth: u64,
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,
    #[serde(default = "default_transaction_fee")]
    pub default_transaction_fee: Decimal,
    pub genesis: GenesisConfig,
}

fn default_mining_interval_ms() -> u64 {
    5_000
}

fn default_target_txs_per_block() -> usize {
    2
}

fn default_mempool_limit() -> usize {
    8_192
}

fn default_pending_query_limit() -> usize {
    2_000
}

fn default_vote_collection_timeout_ms() -> u64 {
    500
}

fn default_vote_collection_intervals() -> u32 {
    6
}

fn default_early_vote_counting_threshold() -> usize {
    50
}

fn default_quorum_size() -> usize {
    1
}

fn default_warm_up_secs() -> u64 {
    48 * 60 * 60
}

fn default_irreversible_depth() -> u64 {
    6
}

fn default_gc_interval_ms() -> u64 {
    60_000
}

fn default_transaction_fee() -> Decimal {
    Decimal::ONE
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.toml"),
            rpc_listen: "127.0.0.1:7070".parse().expect("valid socket addr"),
            mining_interval_ms: default_mining_interval_ms(),
            target_txs_per_block: default_target_txs_per_block(),
            mempool_limit: default_mempool_limit(),
            pending_query_limit: default_pending_query_limit(),
            vote_collection_timeout_ms: default_vote_collection_timeout_ms(),
            vote_collection_intervals: default_vote_collection_intervals(),
            early_vote_counting_threshold: default_early_vote_counting_threshold(),
            quorum_size: default_quorum_size(),
            warm_up_secs: default_warm_up_secs(),
            enforce_warm_up: false,
            irreversible_depth: default_irreversible_depth(),
            gc_interval_ms: default_gc_interval_ms(),
            default_transaction_fee: default_transaction_fee(),
            genesis: GenesisConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: String,
    /// Stands in for the external deposit workflow on a fresh network.
    #[serde(default)]
    pub miners: Vec<GenesisMiner>,
    #[serde(default)]
    pub allocations: Vec<GenesisAllocation>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            chain_id: "basalt-local".to_string(),
            miners: Vec::new(),
            allocations: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisMiner {
    pub address: Address,
    pub stake: Decimal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAllocation {
    pub address: Address,
    pub balance: Decimal,
}
