use std::time::{SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Address;

/// A registered miner. Created by the deposit workflow, mutated by
/// participation accounting and slashing; never deleted (stake may reach 0).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Miner {
    pub address: Address,
    pub stake_amount: Decimal,
    pub inserted_at: u64,
    pub participation_rate: f64,
}

impl Miner {
    pub fn new(address: Address, stake_amount: Decimal) -> Self {
        Self {
            address,
            stake_amount,
            inserted_at: unix_timestamp(),
            participation_rate: crate::participation::MAX_PARTICIPATION_RATE,
        }
    }
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
