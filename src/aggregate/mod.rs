//! Pageblock aggregation
//!
//! Rolls classified runs up into per-pageblock results:
//! - Coarse: regular / unmovable-bearing / dropped blocks with samples
//! - Fine: category totals cross-tabulated against declared migratetype

pub mod coarse;
pub mod fine;

pub use coarse::{BlockOutcome, CoarseAggregator, CoarseTally};
pub use fine::{
    BlockTotals, CategoryCounts, FineAggregator, FineBlockOutcome, MismatchCounters, MismatchKind,
    NonLruInMovable, NonSlabInReclaimable, SlabLruInUnmovable,
};

use crate::{ScanError, ScanResult};

/// Page counts of one unmovable-bearing pageblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSample {
    pub block_pfn: u64,
    pub movable: u64,
    pub unmovable: u64,
    /// `block size - movable - unmovable`; reserved pages land here too.
    pub free: u64,
}

impl BlockSample {
    /// Build a sample, rejecting counts that overflow the block.
    pub fn new(block_pfn: u64, block_size: u64, movable: u64, unmovable: u64) -> ScanResult<Self> {
        let free = movable
            .checked_add(unmovable)
            .and_then(|used| block_size.checked_sub(used))
            .ok_or(ScanError::NegativeFreePages {
                block_pfn,
                movable,
                unmovable,
            })?;
        Ok(Self {
            block_pfn,
            movable,
            unmovable,
            free,
        })
    }
}
