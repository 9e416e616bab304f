use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::errors::{ChainError, ChainResult};
use crate::storage::Storage;
use crate::types::{Address, Hash, TxKind};

/// Snapshot of one account for a single validation pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountState {
    pub nonce: u64,
    pub balance: Decimal,
}

/// Pure view over the confirmed chain producing per-address nonce and
/// balance. Nonce is the count of confirmed transactions sent by the
/// address; balance is received value minus sent value and fees plus
/// coinbase payouts. Slash penalties debit registered stake, not this
/// balance.
#[derive(Clone)]
pub struct AccountsView {
    storage: Storage,
    genesis_allocations: Arc<HashMap<Address, Decimal>>,
}

impl AccountsView {
    pub fn new(storage: Storage, allocations: HashMap<Address, Decimal>) -> Self {
        Self {
            storage,
            genesis_allocations: Arc::new(allocations),
        }
    }

    fn base_balance(&self, address: &Address) -> Decimal {
        self.genesis_allocations
            .get(address)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Account state at `at_block` (or head when `None`).
    pub fn state(&self, address: &Address, at_block: Option<&Hash>) -> ChainResult<AccountState> {
        let start = match at_block {
            Some(hash) => Some(self.storage.get_block(hash)?.ok_or_else(|| {
                ChainError::NotFound(format!("block {}", hex::encode_upper(hash)))
            })?),
            None => self.storage.head_block()?,
        };
        let mut state = AccountState {
            nonce: 0,
            balance: self.base_balance(address),
        };
        let Some(start) = start else {
            return Ok(state);
        };
        for block in self.storage.list_preceding_blocks(&start)? {
            let transactions = self.storage.load_block_body(&block.hash)?;
            for tx in &transactions {
                if tx.kind() == TxKind::Coinbase {
                    if &tx.to == address {
                        state.balance += tx.value;
                    }
                    continue;
                }
                let sender = tx.sender()?;
                if &sender == address {
                    state.nonce += 1;
                    state.balance -= tx.value + tx.fee;
                }
                if &tx.to == address {
                    state.balance += tx.value;
                }
            }
        }
        Ok(state)
    }

    pub fn nonce(&self, address: &Address, at_block: Option<&Hash>) -> ChainResult<u64> {
        Ok(self.state(address, at_block)?.nonce)
    }

    pub fn balance(&self, address: &Address, at_block: Option<&Hash>) -> ChainResult<Decimal> {
        Ok(self.state(address, at_block)?.balance)
    }

    /// True iff the hash appears in no confirmed block up to head.
    pub fn is_unmined(&self, tx_hash: &Hash) -> ChainResult<bool> {
        let Some(head) = self.storage.head_block()? else {
            return Ok(true);
        };
        for block in self.storage.list_preceding_blocks(&head)? {
            let transactions = self.storage.load_block_body(&block.hash)?;
            if transactions.iter().any(|tx| &tx.hash == tx_hash) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
