use std::sync::Arc;

use k256::ecdsa::SigningKey;
use rust_decimal::Decimal;

use crate::crypto::address_of;
use crate::errors::{ChainError, ChainResult};
use crate::storage::{body_trie, Storage};
use crate::trie::empty_trie_root;
use crate::types::{Hash, PendingBlock, Transaction, ZERO_HASH};

/// Fixed fee carried by every coinbase transaction.
pub const COINBASE_FEE: Decimal = Decimal::ONE;

/// Opaque world-state function. The node wires a concrete provider; tests
/// substitute deterministic fakes.
pub trait WorldState: Send + Sync {
    fn state_root(&self, transactions: &[Transaction]) -> ChainResult<Hash>;
}

/// Builds pending blocks: drains a transaction batch, appends the coinbase,
/// computes the transaction root over the exact ordering chosen and links
/// the header to the current head.
pub struct BlockAssembler {
    storage: Storage,
    world_state: Arc<dyn WorldState>,
}

impl BlockAssembler {
    pub fn new(storage: Storage, world_state: Arc<dyn WorldState>) -> Self {
        Self {
            storage,
            world_state,
        }
    }

    pub fn generate_pending_block(
        &self,
        mut transactions: Vec<Transaction>,
        proposer: &SigningKey,
    ) -> ChainResult<PendingBlock> {
        if transactions.is_empty() {
            return Err(ChainError::EmptyTransactionBatch);
        }
        let coinbase = mint_coinbase(&transactions, proposer)?;
        transactions.push(coinbase);

        let (number, prev_hash) = match self.storage.head_block()? {
            Some(head) => (head.number + 1, head.hash),
            None => (0, ZERO_HASH),
        };
        let tx_root = body_trie(&transactions)?.root_hash();
        let state_root = self.world_state.state_root(&transactions)?;
        Ok(PendingBlock::new(
            prev_hash,
            number,
            state_root,
            empty_trie_root(),
            tx_root,
            transactions,
        ))
    }
}

/// Sum of fees over a batch; zero for an empty batch.
pub fn sum_transaction_fees(transactions: &[Transaction]) -> Decimal {
    transactions
        .iter()
        .fold(Decimal::ZERO, |total, tx| total + tx.fee)
        .normalize()
}

/// Mints the proposer's fee-collection transaction: pays the batch's fee
/// sum to the proposer, placed last in the block.
pub fn mint_coinbase(batch: &[Transaction], proposer: &SigningKey) -> ChainResult<Transaction> {
    Transaction::coinbase(
        address_of(proposer),
        sum_transaction_fees(batch),
        COINBASE_FEE,
        proposer,
    )
}

/// Validator rule for received blocks: exactly one coinbase, placed last,
/// paying out exactly the fee sum of every other transaction.
pub fn verify_coinbase(transactions: &[Transaction]) -> ChainResult<()> {
    let coinbases: Vec<&Transaction> = transactions.iter().filter(|tx| tx.is_coinbase()).collect();
    let [coinbase] = coinbases.as_slice() else {
        return Err(ChainError::MalformedPayload(format!(
            "block carries {} coinbase transactions, expected exactly 1",
            coinbases.len()
        )));
    };
    match transactions.last() {
        Some(last) if last.hash == coinbase.hash => {}
        _ => {
            return Err(ChainError::MalformedPayload(
                "coinbase must be the last transaction in the block".into(),
            ))
        }
    }
    let fee_sum = sum_transaction_fees(
        &transactions
            .iter()
            .filter(|tx| tx.hash != coinbase.hash)
            .cloned()
            .collect::<Vec<_>>(),
    );
    if coinbase.value != fee_sum {
        return Err(ChainError::MalformedPayload(format!(
            "coinbase pays {} but the block's fees sum to {}",
            coinbase.value, fee_sum
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::codec::keccak;
    use crate::crypto::deterministic_keypair;
    use crate::types::Address;

    fn dec(raw: &str) -> Decimal {
        Decimal::from_str(raw).unwrap()
    }

    struct FixedWorldState;

    impl WorldState for FixedWorldState {
        fn state_root(&self, transactions: &[Transaction]) -> ChainResult<Hash> {
            let mut data = Vec::new();
            for tx in transactions {
                data.extend_from_slice(&tx.hash);
            }
            Ok(keccak(&data))
        }
    }

    fn assembler(dir: &tempfile::TempDir) -> BlockAssembler {
        let storage = Storage::open(dir.path()).unwrap();
        BlockAssembler::new(storage, Arc::new(FixedWorldState))
    }

    fn transfer(seed: u8, nonce: u64, fee: &str) -> Transaction {
        let keypair = deterministic_keypair(seed);
        Transaction::create(
            nonce,
            Address::from_bytes([0x55; 20]),
            dec("5"),
            dec(fee),
            Vec::new(),
            &keypair,
        )
        .unwrap()
    }

    #[test]
    fn empty_batch_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let proposer = deterministic_keypair(61);
        let err = assembler(&dir)
            .generate_pending_block(Vec::new(), &proposer)
            .unwrap_err();
        assert!(matches!(err, ChainError::EmptyTransactionBatch));
    }

    #[test]
    fn coinbase_pays_the_fee_sum_to_the_proposer() {
        let dir = tempfile::tempdir().unwrap();
        let proposer = deterministic_keypair(61);
        let block = assembler(&dir)
            .generate_pending_block(vec![transfer(62, 1, "1.1"), transfer(63, 1, "0.9")], &proposer)
            .unwrap();

        let body = block.body.as_ref().unwrap();
        assert_eq!(body.len(), 3);
        let coinbase = body.last().unwrap();
        assert!(coinbase.is_coinbase());
        assert_eq!(coinbase.value, dec("2"));
        assert_eq!(coinbase.to, address_of(&proposer));
        assert_eq!(coinbase.fee, COINBASE_FEE);
        verify_coinbase(body).unwrap();
    }

    #[test]
    fn genesis_block_links_to_the_zero_hash() {
        let dir = tempfile::tempdir().unwrap();
        let proposer = deterministic_keypair(61);
        let block = assembler(&dir)
            .generate_pending_block(vec![transfer(62, 1, "1")], &proposer)
            .unwrap();
        assert_eq!(block.number, 0);
        assert_eq!(block.prev_hash, ZERO_HASH);
        assert!(block.is_genesis());
    }

    #[test]
    fn next_block_links_to_the_head() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = assembler(&dir);
        let proposer = deterministic_keypair(61);
        let genesis = assembler
            .generate_pending_block(vec![transfer(62, 1, "1")], &proposer)
            .unwrap();
        assembler.storage.put_block(&genesis).unwrap();

        let next = assembler
            .generate_pending_block(vec![transfer(62, 2, "1")], &proposer)
            .unwrap();
        assert_eq!(next.number, 1);
        assert_eq!(next.prev_hash, genesis.hash);
    }

    #[test]
    fn same_batch_yields_identical_roots_on_independent_nodes() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let proposer = deterministic_keypair(61);
        let batch = vec![transfer(62, 1, "1.5"), transfer(63, 1, "0.5")];

        let block_a = assembler(&dir_a)
            .generate_pending_block(batch.clone(), &proposer)
            .unwrap();
        let block_b = assembler(&dir_b)
            .generate_pending_block(batch, &proposer)
            .unwrap();

        assert_eq!(block_a.tx_root, block_b.tx_root);
        assert_eq!(block_a.hash, block_b.hash);
    }

    #[test]
    fn coinbase_validation_rejects_wrong_payout() {
        let proposer = deterministic_keypair(61);
        let txs = vec![transfer(62, 1, "1.1"), transfer(63, 1, "0.9")];
        let wrong = Transaction::coinbase(address_of(&proposer), dec("3"), COINBASE_FEE, &proposer)
            .unwrap();
        let mut block_txs = txs.clone();
        block_txs.push(wrong);
        assert!(verify_coinbase(&block_txs).is_err());

        let none_at_all = txs;
        assert!(verify_coinbase(&none_at_all).is_err());
    }
}
