use crate::types::{PendingBlock, Transaction, Vote};

/// Best-effort propagation seam to the peer transport. Implementations must
/// never block the caller; delivery failures are their own concern and are
/// at most logged.
pub trait Gossip: Send + Sync {
    fn broadcast_transaction(&self, tx: &Transaction);
    fn broadcast_vote(&self, vote: &Vote);
    fn broadcast_block(&self, block: &PendingBlock);
}

/// Stand-alone node without peers.
pub struct NoopGossip;

impl Gossip for NoopGossip {
    fn broadcast_transaction(&self, _tx: &Transaction) {}
    fn broadcast_vote(&self, _vote: &Vote) {}
    fn broadcast_block(&self, _block: &PendingBlock) {}
}
