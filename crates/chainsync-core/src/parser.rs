//! Parser contract. Turns a raw block into indexed records.

use crate::error::IndexerError;
use crate::types::{Block, IndexedRecord};

/// Decodes a raw block into the records the state store persists.
///
/// Implementations must be deterministic: parsing the same block twice yields
/// identical records, which is what makes reparse idempotent. Positions are
/// dense from 0 within a block.
pub trait BlockParser: Send + Sync {
    fn parse(&self, block: &Block) -> Result<Vec<IndexedRecord>, IndexerError>;
}

impl<P: BlockParser + ?Sized> BlockParser for Box<P> {
    fn parse(&self, block: &Block) -> Result<Vec<IndexedRecord>, IndexerError> {
        (**self).parse(block)
    }
}

impl<P: BlockParser + ?Sized> BlockParser for std::sync::Arc<P> {
    fn parse(&self, block: &Block) -> Result<Vec<IndexedRecord>, IndexerError> {
        (**self).parse(block)
    }
}
