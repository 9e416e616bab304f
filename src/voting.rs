use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use k256::ecdsa::SigningKey;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rust_decimal::Decimal;
use tokio::time;
use tracing::{debug, info, warn};

use crate::accounts::AccountsView;
use crate::assembler::verify_coinbase;
use crate::config::NodeConfig;
use crate::crypto::address_of;
use crate::errors::{ChainError, ChainResult};
use crate::gossip::Gossip;
use crate::mempool::Mempool;
use crate::participation;
use crate::slashing;
use crate::storage::{Storage, DEFAULT_QUERY_LIMIT};
use crate::types::{unix_timestamp, Address, Hash, PendingBlock, Vote};

#[derive(Clone, Debug)]
pub struct VotingConfig {
    pub collection_timeout: Duration,
    pub collection_intervals: u32,
    pub early_vote_counting_threshold: usize,
    pub quorum_size: usize,
    pub warm_up: Duration,
    pub enforce_warm_up: bool,
    pub default_transaction_fee: Decimal,
}

impl From<&NodeConfig> for VotingConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            collection_timeout: Duration::from_millis(config.vote_collection_timeout_ms),
            collection_intervals: config.vote_collection_intervals,
            early_vote_counting_threshold: config.early_vote_counting_threshold,
            quorum_size: config.quorum_size,
            warm_up: Duration::from_secs(config.warm_up_secs),
            enforce_warm_up: config.enforce_warm_up,
            default_transaction_fee: config.default_transaction_fee,
        }
    }
}

/// Per-height voting state machine.
///
/// For a height, rounds run until one pending block gathers at least two
/// thirds of the stake-weighted voting power of the round's distinct
/// voters. A round always completes: it either commits a winner or
/// escalates to the next round. Escalation is a cooperative loop, never
/// synchronous recursion.
pub struct VoteManager {
    storage: Storage,
    mempool: Arc<Mempool>,
    accounts: AccountsView,
    gossip: Arc<dyn Gossip>,
    keypair: SigningKey,
    address: Address,
    config: VotingConfig,
    /// Insertion order in a round's log is the tie-break authority.
    rounds: Mutex<HashMap<(u64, u32), Vec<Vote>>>,
}

impl VoteManager {
    pub fn new(
        storage: Storage,
        mempool: Arc<Mempool>,
        accounts: AccountsView,
        gossip: Arc<dyn Gossip>,
        keypair: SigningKey,
        config: VotingConfig,
    ) -> Self {
        let address = address_of(&keypair);
        Self {
            storage,
            mempool,
            accounts,
            gossip,
            keypair,
            address,
            config,
            rounds: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_address(&self) -> Address {
        self.address
    }

    /// Validates and records a vote. Duplicates (by hash) are ignored.
    /// A conflicting vote by the same miner in the same round triggers a
    /// slash transaction; the conflicting vote itself is still recorded as
    /// evidence.
    pub fn register_vote(&self, vote: Vote) -> ChainResult<()> {
        vote.verify()?;
        let miner = self
            .storage
            .get_miner(&vote.miner_address)?
            .ok_or(ChainError::UnknownMiner(vote.miner_address))?;
        if self.config.enforce_warm_up {
            let age = unix_timestamp().saturating_sub(miner.inserted_at);
            if age <= self.config.warm_up.as_secs() {
                warn!(miner = %vote.miner_address, "vote from miner still in warm-up");
                return Err(ChainError::UnknownMiner(vote.miner_address));
            }
        }

        let conflict = {
            let mut rounds = self.rounds.lock();
            let log = rounds.entry((vote.block_number, vote.voting_round)).or_default();
            if log.iter().any(|known| known.hash == vote.hash)
                || self.storage.get_vote(&vote.hash)?.is_some()
            {
                return Ok(());
            }
            let conflict = slashing::find_equivocation(&vote, log);
            log.push(vote.clone());
            conflict
        };
        self.storage.put_vote(&vote)?;

        if let Some(existing) = conflict {
            warn!(
                miner = %vote.miner_address,
                height = vote.block_number,
                round = vote.voting_round,
                "equivocation detected"
            );
            if let Err(err) = self.emit_slash(&existing, &vote) {
                warn!(%err, "failed to emit slash transaction");
            }
        }
        Ok(())
    }

    fn emit_slash(&self, first: &Vote, second: &Vote) -> ChainResult<()> {
        let offender = first.miner_address;
        let proof = slashing::encode_proof(first, second);
        let nonce = self.accounts.nonce(&self.address, None)? + 1;
        let tx = slashing::build_slash_transaction(
            offender,
            &proof,
            nonce,
            self.config.default_transaction_fee,
            &self.keypair,
        )?;
        let hash = self.mempool.admit(tx.clone())?;
        self.gossip.broadcast_transaction(&tx);
        info!(%offender, slash_tx = %hex::encode_upper(hash), "slash transaction queued");
        Ok(())
    }

    /// True iff this node already cast a vote in `(height, round)` for a
    /// pending block it knows locally.
    pub fn already_voted(&self, height: u64, round: u32) -> ChainResult<bool> {
        let candidates: Vec<Hash> = {
            let rounds = self.rounds.lock();
            rounds
                .get(&(height, round))
                .map(|log| {
                    log.iter()
                        .filter(|vote| vote.miner_address == self.address)
                        .map(|vote| vote.block_hash)
                        .collect()
                })
                .unwrap_or_default()
        };
        for hash in candidates {
            if self.storage.get_pending_block(&hash)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Next round to run for a height: one past the highest round seen in
    /// the persisted votes, or 0 when none exist. Used to resume after a
    /// restart.
    pub fn current_voting_round(&self, height: u64) -> ChainResult<u32> {
        let votes = self.storage.list_votes(DEFAULT_QUERY_LIMIT)?;
        Ok(votes
            .iter()
            .filter(|vote| vote.block_number == height)
            .map(|vote| vote.voting_round + 1)
            .max()
            .unwrap_or(0))
    }

    fn select_candidate(
        &self,
        height: u64,
        round: u32,
        proposal: Option<&Hash>,
    ) -> ChainResult<PendingBlock> {
        if round == 0 {
            let hash = proposal.ok_or(ChainError::NoCandidateBlock(height))?;
            return self
                .storage
                .get_pending_block(hash)?
                .ok_or(ChainError::NoCandidateBlock(height));
        }
        // TODO: weight the choice by prior-round vote counts instead of
        // picking uniformly at random.
        let known = self.storage.list_pending_blocks_at(height)?;
        known
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(ChainError::NoCandidateBlock(height))
    }

    fn cast_vote(&self, height: u64, round: u32, candidate: &Hash) -> ChainResult<()> {
        if self.already_voted(height, round)? {
            debug!(height, round, "already voted in this round");
            return Ok(());
        }
        let vote = Vote::create(self.address, height, *candidate, round, &self.keypair)?;
        self.register_vote(vote.clone())?;
        self.gossip.broadcast_vote(&vote);
        debug!(height, round, candidate = %hex::encode_upper(candidate), "vote cast");
        Ok(())
    }

    fn round_vote_count(&self, height: u64, round: u32) -> usize {
        self.rounds
            .lock()
            .get(&(height, round))
            .map(Vec::len)
            .unwrap_or(0)
    }

    async fn collect_votes(&self, height: u64, round: u32) {
        for _ in 0..self.config.collection_intervals {
            if self.round_vote_count(height, round) >= self.config.early_vote_counting_threshold {
                debug!(height, round, "early vote-counting threshold reached");
                return;
            }
            time::sleep(self.config.collection_timeout).await;
        }
    }

    /// Groups the round's votes by block hash, weighting each vote by its
    /// miner's current stake. A group wins with at least two thirds of the
    /// total stake of the round's distinct voters; ties break to the
    /// lexicographically smallest block hash.
    fn tally(&self, height: u64, round: u32) -> ChainResult<(Option<Hash>, HashSet<Address>)> {
        let votes: Vec<Vote> = self
            .rounds
            .lock()
            .get(&(height, round))
            .cloned()
            .unwrap_or_default();

        let mut voters: HashSet<Address> = HashSet::new();
        let mut total = Decimal::ZERO;
        let mut weights: HashMap<Hash, Decimal> = HashMap::new();
        for vote in &votes {
            let Some(miner) = self.storage.get_miner(&vote.miner_address)? else {
                continue;
            };
            if voters.insert(vote.miner_address) {
                total += miner.stake_amount;
            }
            *weights.entry(vote.block_hash).or_insert(Decimal::ZERO) += miner.stake_amount;
        }

        if voters.len() < self.config.quorum_size || total <= Decimal::ZERO {
            return Ok((None, voters));
        }
        let winner = weights
            .iter()
            .filter(|(_hash, weight)| **weight * Decimal::from(3) >= total * Decimal::from(2))
            .map(|(hash, _weight)| *hash)
            .min();
        Ok((winner, voters))
    }

    fn commit(&self, height: u64, winner: &Hash) -> ChainResult<PendingBlock> {
        let header = self
            .storage
            .get_pending_block(winner)?
            .ok_or_else(|| ChainError::NotFound(format!("pending block {}", hex::encode_upper(winner))))?;
        let transactions = self.storage.load_block_body(winner)?;
        verify_coinbase(&transactions)?;
        self.storage.put_block(&header)?;
        slashing::apply_block_slashes(&self.storage, &transactions)?;
        self.mempool.remove_mined(&transactions)?;
        self.gossip.broadcast_block(&header);

        let mut rounds = self.rounds.lock();
        rounds.retain(|(h, _round), _log| *h != height);
        drop(rounds);

        info!(height, hash = %hex::encode_upper(winner), "committed block");
        Ok(header)
    }

    /// Runs one voting round: select a candidate, cast, collect, tally.
    /// Returns the committed block on a supermajority win, `None` when the
    /// round must escalate.
    pub async fn run_round(
        &self,
        height: u64,
        round: u32,
        proposal: Option<&Hash>,
    ) -> ChainResult<Option<PendingBlock>> {
        match self.select_candidate(height, round, proposal) {
            Ok(candidate) => {
                if let Err(err) = self.cast_vote(height, round, &candidate.hash) {
                    warn!(height, round, %err, "could not cast vote");
                }
            }
            Err(err) => {
                debug!(height, round, %err, "no local candidate, collecting only");
            }
        }

        self.collect_votes(height, round).await;

        let (winner, voters) = self.tally(height, round)?;
        participation::record_round(&self.storage, &voters)?;
        match winner {
            Some(hash) => self.commit(height, &hash).map(Some),
            None => {
                info!(height, round, voters = voters.len(), "no supermajority winner");
                Ok(None)
            }
        }
    }

    /// Drives a height to commitment, escalating rounds until a winner
    /// emerges. Resumes from the persisted round counter.
    pub async fn run_height(
        &self,
        height: u64,
        proposal: Option<&Hash>,
    ) -> ChainResult<PendingBlock> {
        let mut round = self.current_voting_round(height)?;
        loop {
            match self.run_round(height, round, proposal).await? {
                Some(block) => return Ok(block),
                None => {
                    round += 1;
                    debug!(height, round, "escalating to next voting round");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;
    use std::str::FromStr;

    use super::*;
    use crate::assembler::{BlockAssembler, WorldState};
    use crate::codec::keccak;
    use crate::crypto::deterministic_keypair;
    use crate::gossip::NoopGossip;
    use crate::types::{Miner, Transaction};

    fn dec(raw: &str) -> Decimal {
        Decimal::from_str(raw).unwrap()
    }

    struct FixedWorldState;

    impl WorldState for FixedWorldState {
        fn state_root(&self, _transactions: &[Transaction]) -> ChainResult<Hash> {
            Ok(keccak(b"world-state"))
        }
    }

    fn test_config() -> VotingConfig {
        VotingConfig {
            collection_timeout: Duration::from_millis(5),
            collection_intervals: 1,
            early_vote_counting_threshold: 50,
            quorum_size: 1,
            warm_up: Duration::from_secs(48 * 60 * 60),
            enforce_warm_up: false,
            default_transaction_fee: Decimal::ONE,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Storage,
        manager: VoteManager,
        assembler: BlockAssembler,
    }

    fn fixture(local_seed: u8, stakes: &[(u8, &str)]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let mut allocations = StdHashMap::new();
        for (seed, stake) in stakes {
            let keypair = deterministic_keypair(*seed);
            let address = address_of(&keypair);
            let mut miner = Miner::new(address, dec(stake));
            miner.participation_rate = 0.5;
            storage.put_miner(&miner).unwrap();
            allocations.insert(address, dec("1000"));
        }
        let accounts = AccountsView::new(storage.clone(), allocations);
        let mempool = Arc::new(Mempool::new(
            storage.clone(),
            accounts.clone(),
            1_000,
            DEFAULT_QUERY_LIMIT,
            2,
        ));
        let manager = VoteManager::new(
            storage.clone(),
            mempool,
            accounts,
            Arc::new(NoopGossip),
            deterministic_keypair(local_seed),
            test_config(),
        );
        let assembler = BlockAssembler::new(storage.clone(), Arc::new(FixedWorldState));
        Fixture {
            _dir: dir,
            storage,
            manager,
            assembler,
        }
    }

    fn propose_block(fixture: &Fixture, proposer_seed: u8, tx_seed: u8) -> PendingBlock {
        let proposer = deterministic_keypair(proposer_seed);
        let sender = deterministic_keypair(tx_seed);
        let tx = Transaction::create(
            1,
            Address::from_bytes([0x22; 20]),
            dec("1"),
            dec("0.5"),
            Vec::new(),
            &sender,
        )
        .unwrap();
        let block = fixture
            .assembler
            .generate_pending_block(vec![tx], &proposer)
            .unwrap();
        fixture.storage.put_pending_block(&block).unwrap();
        block
    }

    fn foreign_vote(seed: u8, height: u64, block_hash: Hash, round: u32) -> Vote {
        let keypair = deterministic_keypair(seed);
        Vote::create(address_of(&keypair), height, block_hash, round, &keypair).unwrap()
    }

    #[test]
    fn unknown_miners_cannot_vote() {
        let fixture = fixture(81, &[(81, "10")]);
        let vote = foreign_vote(99, 0, keccak(b"candidate"), 0);
        let err = fixture.manager.register_vote(vote).unwrap_err();
        assert!(matches!(err, ChainError::UnknownMiner(_)));
    }

    #[test]
    fn duplicate_votes_are_ignored() {
        let fixture = fixture(81, &[(81, "10"), (82, "5")]);
        let vote = foreign_vote(82, 0, keccak(b"candidate"), 0);
        fixture.manager.register_vote(vote.clone()).unwrap();
        fixture.manager.register_vote(vote).unwrap();
        assert_eq!(fixture.manager.round_vote_count(0, 0), 1);
    }

    #[test]
    fn current_round_is_zero_without_votes() {
        let fixture = fixture(81, &[(81, "10")]);
        assert_eq!(fixture.manager.current_voting_round(7).unwrap(), 0);
    }

    #[test]
    fn current_round_resumes_past_the_highest_vote() {
        let fixture = fixture(81, &[(81, "10"), (82, "5")]);
        fixture
            .manager
            .register_vote(foreign_vote(82, 3, keccak(b"candidate"), 2))
            .unwrap();
        assert_eq!(fixture.manager.current_voting_round(3).unwrap(), 3);
        assert_eq!(fixture.manager.current_voting_round(4).unwrap(), 0);
    }

    #[tokio::test]
    async fn unanimous_round_commits_the_block() {
        // Three miners with stakes 4, 3 and 2 all vote for the same block.
        let fixture = fixture(81, &[(81, "4"), (82, "3"), (83, "2")]);
        let block = propose_block(&fixture, 81, 84);
        for seed in [82, 83] {
            fixture
                .manager
                .register_vote(foreign_vote(seed, block.number, block.hash, 0))
                .unwrap();
        }

        let committed = fixture
            .manager
            .run_round(block.number, 0, Some(&block.hash))
            .await
            .unwrap()
            .expect("supermajority win");
        assert_eq!(committed.hash, block.hash);
        assert!(fixture.storage.get_block(&block.hash).unwrap().is_some());

        // every voter's participation rose by one step
        for seed in [81u8, 82, 83] {
            let address = address_of(&deterministic_keypair(seed));
            let miner = fixture.storage.get_miner(&address).unwrap().unwrap();
            assert!((miner.participation_rate - 0.51).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn split_vote_escalates_without_a_winner() {
        // Stakes 3/3/2 split across two blocks: 5/8 < 2/3, no winner.
        let fixture = fixture(81, &[(81, "3"), (82, "3"), (83, "2")]);
        let block_one = propose_block(&fixture, 81, 84);
        let block_two = propose_block(&fixture, 82, 85);
        fixture
            .manager
            .register_vote(foreign_vote(82, block_one.number, block_two.hash, 0))
            .unwrap();
        fixture
            .manager
            .register_vote(foreign_vote(83, block_one.number, block_one.hash, 0))
            .unwrap();

        let outcome = fixture
            .manager
            .run_round(block_one.number, 0, Some(&block_one.hash))
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(fixture.storage.get_block(&block_one.hash).unwrap().is_none());

        // miner 82 abstains in round 1 while the others vote again
        let before = fixture
            .storage
            .get_miner(&address_of(&deterministic_keypair(82)))
            .unwrap()
            .unwrap()
            .participation_rate;
        fixture
            .manager
            .register_vote(foreign_vote(83, block_one.number, block_one.hash, 1))
            .unwrap();
        fixture
            .manager
            .run_round(block_one.number, 1, Some(&block_one.hash))
            .await
            .unwrap();
        let after = fixture
            .storage
            .get_miner(&address_of(&deterministic_keypair(82)))
            .unwrap()
            .unwrap()
            .participation_rate;
        assert!(after < before);
    }

    #[tokio::test]
    async fn supermajority_weight_is_checked_against_distinct_voters() {
        // Stakes 4/3/2: block one gathers 7/9 >= 2/3 and wins even though
        // miner 83 dissents.
        let fixture = fixture(81, &[(81, "4"), (82, "3"), (83, "2")]);
        let block_one = propose_block(&fixture, 81, 84);
        let block_two = propose_block(&fixture, 82, 85);
        fixture
            .manager
            .register_vote(foreign_vote(82, block_one.number, block_one.hash, 0))
            .unwrap();
        fixture
            .manager
            .register_vote(foreign_vote(83, block_one.number, block_two.hash, 0))
            .unwrap();

        let committed = fixture
            .manager
            .run_round(block_one.number, 0, Some(&block_one.hash))
            .await
            .unwrap()
            .expect("7 of 9 stake is a supermajority");
        assert_eq!(committed.hash, block_one.hash);
    }

    #[test]
    fn equivocation_queues_a_slash_transaction() {
        let fixture = fixture(81, &[(81, "10"), (82, "100")]);
        let first = foreign_vote(82, 10, keccak(b"block-one"), 0);
        let second = foreign_vote(82, 10, keccak(b"block-two"), 0);
        fixture.manager.register_vote(first).unwrap();
        fixture.manager.register_vote(second).unwrap();

        let pending = fixture
            .storage
            .list_pending_transactions(DEFAULT_QUERY_LIMIT)
            .unwrap();
        assert_eq!(pending.len(), 1);
        let slash_tx = &pending[0];
        assert_eq!(slash_tx.to, address_of(&deterministic_keypair(82)));
        let proof = slash_tx.slash_proof().unwrap();
        slashing::verify_proof(&slash_tx.to, &proof).unwrap();
    }

    #[tokio::test]
    async fn commit_fails_cleanly_when_the_body_was_pruned() {
        let fixture = fixture(81, &[(81, "10")]);
        let block = propose_block(&fixture, 81, 84);
        // simulate the garbage collector racing the commit
        fixture.storage.delete_pending_block(&block.hash).unwrap();
        fixture.storage.put_pending_block(&block.without_body()).unwrap();

        let err = fixture
            .manager
            .run_round(block.number, 0, Some(&block.hash))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::TrieMissing(_)));
    }
}
