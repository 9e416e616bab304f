use std::collections::HashSet;

use tracing::debug;

use crate::errors::ChainResult;
use crate::storage::{Storage, DEFAULT_QUERY_LIMIT};
use crate::types::Address;

pub const MIN_PARTICIPATION_RATE: f64 = 0.0001;
pub const MAX_PARTICIPATION_RATE: f64 = 1.0;
const PARTICIPATION_STEP: f64 = 0.01;

/// One step of the rolling participation score.
pub fn adjusted_rate(rate: f64, voted: bool) -> f64 {
    if voted {
        (rate + PARTICIPATION_STEP).min(MAX_PARTICIPATION_RATE)
    } else {
        (rate - PARTICIPATION_STEP).max(MIN_PARTICIPATION_RATE)
    }
}

/// Applies one tally's participation update to the whole miner registry:
/// +0.01 for miners that cast a valid vote this round, -0.01 for the rest,
/// clamped to `[MIN_PARTICIPATION_RATE, MAX_PARTICIPATION_RATE]`.
pub fn record_round(storage: &Storage, voters: &HashSet<Address>) -> ChainResult<()> {
    for mut miner in storage.list_miners(DEFAULT_QUERY_LIMIT)? {
        let voted = voters.contains(&miner.address);
        let updated = adjusted_rate(miner.participation_rate, voted);
        if (updated - miner.participation_rate).abs() > f64::EPSILON {
            debug!(
                miner = %miner.address,
                voted,
                rate = updated,
                "participation rate adjusted"
            );
        }
        miner.participation_rate = updated;
        storage.put_miner(&miner)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rust_decimal::Decimal;

    use super::*;
    use crate::types::Miner;

    #[test]
    fn rate_rises_for_voters_and_falls_for_abstainers() {
        assert!((adjusted_rate(0.5, true) - 0.51).abs() < 1e-9);
        assert!((adjusted_rate(0.5, false) - 0.49).abs() < 1e-9);
    }

    #[test]
    fn rate_is_clipped_at_both_bounds() {
        let mut rising = MIN_PARTICIPATION_RATE;
        let mut falling = MAX_PARTICIPATION_RATE;
        for _ in 0..10_000 {
            rising = adjusted_rate(rising, true);
            falling = adjusted_rate(falling, false);
        }
        assert_eq!(rising, MAX_PARTICIPATION_RATE);
        assert_eq!(falling, MIN_PARTICIPATION_RATE);
    }

    #[test]
    fn record_round_updates_every_registered_miner() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let mut voter = Miner::new(
            crate::types::Address::from_bytes([1u8; 20]),
            Decimal::from_str("10").unwrap(),
        );
        voter.participation_rate = 0.5;
        let mut absent = Miner::new(
            crate::types::Address::from_bytes([2u8; 20]),
            Decimal::from_str("10").unwrap(),
        );
        absent.participation_rate = 0.5;
        storage.put_miner(&voter).unwrap();
        storage.put_miner(&absent).unwrap();

        let voters: HashSet<_> = [voter.address].into_iter().collect();
        record_round(&storage, &voters).unwrap();

        let voter = storage.get_miner(&voter.address).unwrap().unwrap();
        let absent = storage.get_miner(&absent.address).unwrap().unwrap();
        assert!((voter.participation_rate - 0.51).abs() < 1e-9);
        assert!((absent.participation_rate - 0.49).abs() < 1e-9);
    }
}
