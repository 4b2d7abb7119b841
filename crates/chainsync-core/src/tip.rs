//! Chain tip: the engine's current position in the chain.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::BlockHash;

/// The `(height, hash)` of the highest block committed locally.
///
/// Owned by the state store and handed back from every operation that moves
/// it; there is no process-wide copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub height: u64,
    pub hash: BlockHash,
}

impl ChainTip {
    pub fn new(height: u64, hash: BlockHash) -> Self {
        Self { height, hash }
    }

    /// Advance the tip to a newly committed block.
    pub fn advance(&mut self, height: u64, hash: BlockHash) {
        self.height = height;
        self.hash = hash;
    }

    /// Returns the next height to fetch (tip + 1).
    pub fn next_height(&self) -> u64 {
        self.height + 1
    }
}

impl fmt::Display for ChainTip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.height, self.hash)
    }
}
