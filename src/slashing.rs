use k256::ecdsa::SigningKey;
use rlp::{Rlp, RlpStream};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::errors::{ChainError, ChainResult};
use crate::storage::Storage;
use crate::types::{Address, Transaction, TxKind, Vote};

/// Fraction of stake burned per proven equivocation.
pub fn slash_penalty_percentage() -> Decimal {
    Decimal::new(20, 2)
}

/// Searches a round's votes for a conflicting vote by the same miner:
/// same `(miner, height, round)`, different block hash.
pub fn find_equivocation(vote: &Vote, peers: &[Vote]) -> Option<Vote> {
    peers
        .iter()
        .find(|other| {
            other.round_key() == vote.round_key()
                && other.block_hash != vote.block_hash
                && other.hash != vote.hash
        })
        .cloned()
}

/// Encodes a conflicting vote pair as the proof payload carried inside a
/// slash transaction.
pub fn encode_proof(first: &Vote, second: &Vote) -> Vec<u8> {
    let mut stream = RlpStream::new_list(2);
    stream.append_raw(&first.encode(), 1);
    stream.append_raw(&second.encode(), 1);
    stream.out().to_vec()
}

pub fn decode_proof(bytes: &[u8]) -> ChainResult<(Vote, Vote)> {
    let rlp = Rlp::new(bytes);
    if rlp.item_count()? != 2 {
        return Err(ChainError::MalformedPayload(
            "equivocation proof must contain exactly two votes".into(),
        ));
    }
    let first = Vote::decode(rlp.at(0)?.as_raw())?;
    let second = Vote::decode(rlp.at(1)?.as_raw())?;
    Ok((first, second))
}

/// Verifies an equivocation proof against the named offender: both votes
/// share the equivocation key, name distinct blocks, and carry signatures
/// recovering to the offender.
pub fn verify_proof(offender: &Address, bytes: &[u8]) -> ChainResult<(Vote, Vote)> {
    let (first, second) = decode_proof(bytes)?;
    if first.round_key() != second.round_key() {
        return Err(ChainError::MalformedPayload(
            "proof votes target different rounds".into(),
        ));
    }
    if first.block_hash == second.block_hash {
        return Err(ChainError::MalformedPayload(
            "proof votes agree on the block hash".into(),
        ));
    }
    if &first.miner_address != offender {
        return Err(ChainError::SenderMismatch {
            declared: *offender,
            recovered: first.miner_address,
        });
    }
    first.verify()?;
    second.verify()?;
    Ok((first, second))
}

/// Builds a slash transaction targeting the offender, carrying the
/// hex-encoded proof in its data field.
pub fn build_slash_transaction(
    offender: Address,
    proof: &[u8],
    nonce: u64,
    fee: Decimal,
    keypair: &SigningKey,
) -> ChainResult<Transaction> {
    Transaction::slash(nonce, offender, fee, proof, keypair)
}

/// Applies every verifying slash transaction of a committed block: the
/// offender's stake is cut by the penalty fraction, once per
/// `(offender, height, round)`. Non-verifying proofs are logged and
/// skipped; they never fail the commit.
pub fn apply_block_slashes(storage: &Storage, transactions: &[Transaction]) -> ChainResult<()> {
    for tx in transactions.iter().filter(|tx| tx.kind() == TxKind::Slash) {
        let offender = tx.to;
        let proof = match tx.slash_proof() {
            Ok(proof) => proof,
            Err(err) => {
                warn!(%offender, %err, "ignoring slash transaction with unreadable proof");
                continue;
            }
        };
        let (first, _second) = match verify_proof(&offender, &proof) {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%offender, %err, "ignoring slash transaction with invalid proof");
                continue;
            }
        };
        let height = first.block_number;
        let round = first.voting_round;
        if storage.has_slash_marker(&offender, height, round)? {
            continue;
        }
        let Some(mut miner) = storage.get_miner(&offender)? else {
            warn!(%offender, "slash transaction targets an unregistered miner");
            continue;
        };
        let before = miner.stake_amount;
        miner.stake_amount =
            (miner.stake_amount * (Decimal::ONE - slash_penalty_percentage())).normalize();
        storage.put_miner(&miner)?;
        storage.put_slash_marker(&offender, height, round)?;
        info!(
            %offender,
            height,
            round,
            stake_before = %before,
            stake_after = %miner.stake_amount,
            "applied stake slash for equivocation"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::codec::keccak;
    use crate::crypto::{address_of, deterministic_keypair};
    use crate::types::Miner;

    fn dec(raw: &str) -> Decimal {
        Decimal::from_str(raw).unwrap()
    }

    fn conflicting_votes(seed: u8, height: u64, round: u32) -> (Vote, Vote, Address) {
        let keypair = deterministic_keypair(seed);
        let miner = address_of(&keypair);
        let first = Vote::create(miner, height, keccak(b"block-one"), round, &keypair).unwrap();
        let second = Vote::create(miner, height, keccak(b"block-two"), round, &keypair).unwrap();
        (first, second, miner)
    }

    #[test]
    fn equivocation_is_detected_within_a_round() {
        let (first, second, _miner) = conflicting_votes(71, 10, 0);
        assert_eq!(find_equivocation(&second, &[first.clone()]), Some(first.clone()));
        // same vote twice is not an equivocation
        assert_eq!(find_equivocation(&first, &[first.clone()]), None);
    }

    #[test]
    fn votes_for_the_same_block_do_not_conflict() {
        let keypair = deterministic_keypair(72);
        let miner = address_of(&keypair);
        let first = Vote::create(miner, 10, keccak(b"same"), 0, &keypair).unwrap();
        let second = Vote::create(miner, 10, keccak(b"same"), 0, &keypair).unwrap();
        assert_eq!(find_equivocation(&second, &[first]), None);
    }

    #[test]
    fn proof_round_trips_and_verifies() {
        let (first, second, miner) = conflicting_votes(73, 10, 0);
        let proof = encode_proof(&first, &second);
        let (a, b) = verify_proof(&miner, &proof).unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
    }

    #[test]
    fn proof_naming_the_wrong_offender_is_rejected() {
        let (first, second, _miner) = conflicting_votes(74, 10, 0);
        let stranger = address_of(&deterministic_keypair(75));
        let proof = encode_proof(&first, &second);
        assert!(verify_proof(&stranger, &proof).is_err());
    }

    #[test]
    fn proof_with_matching_hashes_is_rejected() {
        let keypair = deterministic_keypair(76);
        let miner = address_of(&keypair);
        let first = Vote::create(miner, 10, keccak(b"same"), 0, &keypair).unwrap();
        let second = Vote::create(miner, 10, keccak(b"same"), 0, &keypair).unwrap();
        let proof = encode_proof(&first, &second);
        assert!(verify_proof(&miner, &proof).is_err());
    }

    #[test]
    fn applying_a_slash_cuts_stake_by_a_fifth() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let (first, second, offender) = conflicting_votes(77, 10, 0);
        storage
            .put_miner(&Miner::new(offender, dec("100")))
            .unwrap();

        let emitter = deterministic_keypair(78);
        let proof = encode_proof(&first, &second);
        let slash_tx =
            build_slash_transaction(offender, &proof, 1, Decimal::ONE, &emitter).unwrap();

        apply_block_slashes(&storage, &[slash_tx.clone()]).unwrap();
        let miner = storage.get_miner(&offender).unwrap().unwrap();
        assert_eq!(miner.stake_amount, dec("80"));

        // idempotent per (offender, height, round)
        apply_block_slashes(&storage, &[slash_tx]).unwrap();
        let miner = storage.get_miner(&offender).unwrap().unwrap();
        assert_eq!(miner.stake_amount, dec("80"));
    }

    #[test]
    fn invalid_proofs_are_skipped_without_failing_the_block() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let offender = address_of(&deterministic_keypair(79));
        storage.put_miner(&Miner::new(offender, dec("100"))).unwrap();

        let emitter = deterministic_keypair(78);
        let bogus =
            build_slash_transaction(offender, b"not-a-proof", 1, Decimal::ONE, &emitter).unwrap();
        apply_block_slashes(&storage, &[bogus]).unwrap();
        let miner = storage.get_miner(&offender).unwrap().unwrap();
        assert_eq!(miner.stake_amount, dec("100"));
    }
}
