use tracing::debug;

use crate::accounts::AccountsView;
use crate::errors::{ChainError, ChainResult};
use crate::storage::Storage;
use crate::types::{Hash, Transaction};

/// Admission, validation and fee-ordered batching of pending transactions.
///
/// Admission checks hash integrity and the signature; account-state checks
/// happen at batching time so a transaction with a nonce gap or a short
/// balance stays queued and may become valid later.
pub struct Mempool {
    storage: Storage,
    accounts: AccountsView,
    limit: usize,
    query_limit: usize,
    target_txs_per_block: usize,
}

impl Mempool {
    pub fn new(
        storage: Storage,
        accounts: AccountsView,
        limit: usize,
        query_limit: usize,
        target_txs_per_block: usize,
    ) -> Self {
        Self {
            storage,
            accounts,
            limit,
            query_limit,
            target_txs_per_block,
        }
    }

    /// Admits a transaction. Rejects duplicates and bad signatures; evicts
    /// the lowest-fee entry when the pool is full and the newcomer pays
    /// more.
    pub fn admit(&self, tx: Transaction) -> ChainResult<Hash> {
        tx.verify()?;
        if self.storage.get_pending_transaction(&tx.hash)?.is_some() {
            return Err(ChainError::DuplicateHash(hex::encode_upper(tx.hash)));
        }
        if self.storage.count_pending_transactions()? >= self.limit {
            self.evict_for(&tx)?;
        }
        self.storage.put_pending_transaction(&tx)?;
        Ok(tx.hash)
    }

    fn evict_for(&self, incoming: &Transaction) -> ChainResult<()> {
        let pending = self.storage.list_pending_transactions(self.query_limit)?;
        let cheapest = pending
            .iter()
            .min_by(|a, b| a.fee.cmp(&b.fee).then(a.hash.cmp(&b.hash)))
            .cloned();
        match cheapest {
            Some(victim) if incoming.fee > victim.fee => {
                debug!(victim = %hex::encode_upper(victim.hash), "evicting lowest-fee transaction");
                self.storage.delete_pending_transaction(&victim.hash)
            }
            _ => Err(ChainError::MempoolFull),
        }
    }

    /// Validates one transaction against the head account state: the nonce
    /// must be exactly the next one and the balance must strictly exceed
    /// the value (fees are settled at block-apply time, so the strict
    /// comparison leaves room for them).
    pub fn validate(&self, tx: &Transaction) -> ChainResult<()> {
        let sender = tx.sender()?;
        let state = self.accounts.state(&sender, None)?;
        if tx.nonce != state.nonce + 1 {
            return Err(ChainError::NonceGap {
                expected: state.nonce + 1,
                found: tx.nonce,
            });
        }
        if state.balance <= tx.value {
            return Err(ChainError::InsufficientBalance {
                balance: state.balance.to_string(),
                required: tx.value.to_string(),
            });
        }
        Ok(())
    }

    /// Snapshot of the pool ordered by fee descending (hash ascending on
    /// ties, for cross-node determinism), filtered to currently valid
    /// transactions, at most `target_txs_per_block` entries. Skipped
    /// transactions stay queued.
    pub fn get_batch_of_valid_pending_transactions(&self) -> ChainResult<Vec<Transaction>> {
        let mut pending = self.storage.list_pending_transactions(self.query_limit)?;
        pending.sort_by(|a, b| b.fee.cmp(&a.fee).then(a.hash.cmp(&b.hash)));
        let mut batch = Vec::with_capacity(self.target_txs_per_block);
        for tx in pending {
            if batch.len() >= self.target_txs_per_block {
                break;
            }
            match self.validate(&tx) {
                Ok(()) => batch.push(tx),
                Err(err) => {
                    debug!(tx = %hex::encode_upper(tx.hash), %err, "skipping transaction");
                }
            }
        }
        Ok(batch)
    }

    /// True iff the transaction hash appears in no confirmed block.
    pub fn unmined(&self, tx_hash: &Hash) -> ChainResult<bool> {
        self.accounts.is_unmined(tx_hash)
    }

    /// Drops transactions that were included in a committed block.
    pub fn remove_mined(&self, transactions: &[Transaction]) -> ChainResult<()> {
        for tx in transactions {
            self.storage.delete_pending_transaction(&tx.hash)?;
        }
        Ok(())
    }

    pub fn len(&self) -> ChainResult<usize> {
        self.storage.count_pending_transactions()
    }

    pub fn is_empty(&self) -> ChainResult<bool> {
        Ok(self.len()? == 0)
    }
}
