//! Fine pageblock aggregation
//!
//! Cross-tabulates fine page categories against each block's declared
//! migratetype. Pages in a block whose migratetype says they should not be
//! there are the scanner's findings: they are counted and logged, never
//! fatal.

#[cfg(feature = "log")]
use log::warn;

use crate::classify::{PageCategory, NR_CATEGORIES};
use crate::layout::{MigratetypeTable, MAX_MIGRATETYPE_TAGS};
use crate::page::Migratetype;
use crate::walker::{BlockContent, BlockScan};

/// Pages per fine category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryCounts {
    counts: [u64; NR_CATEGORIES],
}

impl CategoryCounts {
    #[inline]
    pub fn add(&mut self, category: PageCategory, nr_pages: u64) {
        self.counts[category.index()] += nr_pages;
    }

    #[inline]
    pub fn get(&self, category: PageCategory) -> u64 {
        self.counts[category.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PageCategory, u64)> + '_ {
        PageCategory::ALL.iter().map(|&c| (c, self.get(c)))
    }
}

/// One block's pages folded into the buckets the cross-tabulation uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockTotals {
    /// Free and unreferenced pages.
    pub buddy: u64,
    /// LRU, active, clean page cache and zsmalloc pages.
    pub lru: u64,
    pub reserved: u64,
    /// Reclaimable slab.
    pub slab: u64,
    /// Unreclaimable slab and memcg-charged kernel memory.
    pub kmem: u64,
    pub other: u64,
}

impl BlockTotals {
    pub fn add(&mut self, category: PageCategory, nr_pages: u64) {
        match category {
            PageCategory::Buddy | PageCategory::Unreferenced => self.buddy += nr_pages,
            PageCategory::Lru | PageCategory::Zsmalloc => self.lru += nr_pages,
            PageCategory::Reserved => self.reserved += nr_pages,
            PageCategory::ReclaimableSlab => self.slab += nr_pages,
            PageCategory::UnreclaimableSlab | PageCategory::Kmem => self.kmem += nr_pages,
            PageCategory::Other => self.other += nr_pages,
        }
    }
}

/// Category found in a block declared for something else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchKind {
    LruInUnmovable,
    LruInReclaimable,
    UnreclaimableSlabInMovable,
    ReclaimableSlabInMovable,
    ReclaimableSlabInUnmovable,
    OtherInReclaimable,
}

impl MismatchKind {
    /// The finding, if any, for a run of `category` under `migratetype`.
    pub fn detect(category: PageCategory, migratetype: Migratetype) -> Option<Self> {
        match (category, migratetype) {
            (PageCategory::Lru, Migratetype::Unmovable) => Some(Self::LruInUnmovable),
            (PageCategory::Lru, Migratetype::Reclaimable) => Some(Self::LruInReclaimable),
            (PageCategory::UnreclaimableSlab, Migratetype::Movable) => {
                Some(Self::UnreclaimableSlabInMovable)
            }
            (PageCategory::ReclaimableSlab, Migratetype::Movable) => {
                Some(Self::ReclaimableSlabInMovable)
            }
            (PageCategory::ReclaimableSlab, Migratetype::Unmovable) => {
                Some(Self::ReclaimableSlabInUnmovable)
            }
            (PageCategory::Other, Migratetype::Reclaimable) => Some(Self::OtherInReclaimable),
            _ => None,
        }
    }

    pub const fn describe(&self) -> &'static str {
        match self {
            Self::LruInUnmovable => "lru page in unmovable?",
            Self::LruInReclaimable => "lru page in reclaimable?",
            Self::UnreclaimableSlabInMovable => "unreclaimable slab page in movable?",
            Self::ReclaimableSlabInMovable => "reclaimable slab page in movable?",
            Self::ReclaimableSlabInUnmovable => "reclaimable slab page in unmovable?",
            Self::OtherInReclaimable => "other page in reclaimable?",
        }
    }
}

/// Number of runs found per [`MismatchKind`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MismatchCounters {
    pub lru_in_unmovable: u64,
    pub lru_in_reclaimable: u64,
    pub unreclaimable_slab_in_movable: u64,
    pub reclaimable_slab_in_movable: u64,
    pub reclaimable_slab_in_unmovable: u64,
    pub other_in_reclaimable: u64,
}

impl MismatchCounters {
    pub fn record(&mut self, kind: MismatchKind) {
        let counter = match kind {
            MismatchKind::LruInUnmovable => &mut self.lru_in_unmovable,
            MismatchKind::LruInReclaimable => &mut self.lru_in_reclaimable,
            MismatchKind::UnreclaimableSlabInMovable => &mut self.unreclaimable_slab_in_movable,
            MismatchKind::ReclaimableSlabInMovable => &mut self.reclaimable_slab_in_movable,
            MismatchKind::ReclaimableSlabInUnmovable => &mut self.reclaimable_slab_in_unmovable,
            MismatchKind::OtherInReclaimable => &mut self.other_in_reclaimable,
        };
        *counter += 1;
    }

    pub fn total(&self) -> u64 {
        self.lru_in_unmovable
            + self.lru_in_reclaimable
            + self.unreclaimable_slab_in_movable
            + self.reclaimable_slab_in_movable
            + self.reclaimable_slab_in_unmovable
            + self.other_in_reclaimable
    }
}

/// Slab and LRU pages sitting in unmovable blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabLruInUnmovable {
    pub slab: u64,
    pub lru: u64,
    pub blocks: u64,
}

/// Non-slab pages sitting in reclaimable blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NonSlabInReclaimable {
    pub lru: u64,
    pub kmem: u64,
    pub other: u64,
    pub blocks: u64,
}

/// Non-LRU pages sitting in movable blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NonLruInMovable {
    pub slab: u64,
    pub kmem: u64,
    pub other: u64,
    pub blocks: u64,
}

/// What one block contributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FineBlockOutcome {
    pub migratetype: Migratetype,
    pub totals: BlockTotals,
    /// Holds unreclaimable slab, kmem or other pages.
    pub has_nonmovable: bool,
    /// Mismatching runs found in this block.
    pub mismatches: u64,
}

/// Accumulates fine results over one scan pass.
#[derive(Debug, Clone)]
pub struct FineAggregator {
    table: MigratetypeTable,
    total_blocks: u64,
    blocks_with_nonmovable: u64,
    blocks_by_migratetype: [u64; MAX_MIGRATETYPE_TAGS],
    categories_by_migratetype: [CategoryCounts; MAX_MIGRATETYPE_TAGS],
    slablru_in_unmovable: SlabLruInUnmovable,
    nonslab_in_reclaimable: NonSlabInReclaimable,
    nonlru_in_movable: NonLruInMovable,
    mismatches: MismatchCounters,
}

impl FineAggregator {
    pub fn new(table: MigratetypeTable) -> Self {
        Self {
            table,
            total_blocks: 0,
            blocks_with_nonmovable: 0,
            blocks_by_migratetype: [0; MAX_MIGRATETYPE_TAGS],
            categories_by_migratetype: [CategoryCounts::default(); MAX_MIGRATETYPE_TAGS],
            slablru_in_unmovable: SlabLruInUnmovable::default(),
            nonslab_in_reclaimable: NonSlabInReclaimable::default(),
            nonlru_in_movable: NonLruInMovable::default(),
            mismatches: MismatchCounters::default(),
        }
    }

    /// Fold in one scanned pageblock.
    pub fn add_block(&mut self, block: &BlockScan<PageCategory>) -> FineBlockOutcome {
        let tag = block.migratetype as usize % MAX_MIGRATETYPE_TAGS;
        let mt = self.table.decode(block.migratetype);
        let mut totals = BlockTotals::default();
        let mut has_nonmovable = false;
        let mut mismatches = 0;

        match &block.content {
            BlockContent::AssumedMovable => {
                totals.add(PageCategory::Lru, block.nr_pages());
                self.categories_by_migratetype[tag].add(PageCategory::Lru, block.nr_pages());
            }
            BlockContent::Classified(runs) => {
                for run in runs {
                    totals.add(run.class, run.nr_pages);
                    self.categories_by_migratetype[tag].add(run.class, run.nr_pages);
                    if matches!(
                        run.class,
                        PageCategory::UnreclaimableSlab | PageCategory::Kmem | PageCategory::Other
                    ) {
                        has_nonmovable = true;
                    }
                    if let Some(kind) = MismatchKind::detect(run.class, mt) {
                        warn!(
                            "{} {} ({} pages)",
                            block.start_pfn + run.offset,
                            kind.describe(),
                            run.nr_pages
                        );
                        self.mismatches.record(kind);
                        mismatches += 1;
                    }
                }
            }
        }

        match mt {
            Migratetype::Unmovable => {
                let x = &mut self.slablru_in_unmovable;
                x.slab += totals.slab;
                x.lru += totals.lru;
                if totals.slab != 0 || totals.lru != 0 {
                    x.blocks += 1;
                }
            }
            Migratetype::Reclaimable => {
                let x = &mut self.nonslab_in_reclaimable;
                x.lru += totals.lru;
                x.kmem += totals.kmem;
                x.other += totals.other;
                if totals.lru != 0 || totals.kmem != 0 || totals.other != 0 {
                    x.blocks += 1;
                }
            }
            Migratetype::Movable => {
                let x = &mut self.nonlru_in_movable;
                x.slab += totals.slab;
                x.kmem += totals.kmem;
                x.other += totals.other;
                if totals.slab != 0 || totals.kmem != 0 || totals.other != 0 {
                    x.blocks += 1;
                }
            }
            _ => {}
        }

        self.blocks_by_migratetype[tag] += 1;
        self.total_blocks += 1;
        if has_nonmovable {
            self.blocks_with_nonmovable += 1;
        }

        FineBlockOutcome {
            migratetype: mt,
            totals,
            has_nonmovable,
            mismatches,
        }
    }

    pub fn migratetype_table(&self) -> &MigratetypeTable {
        &self.table
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn blocks_with_nonmovable(&self) -> u64 {
        self.blocks_with_nonmovable
    }

    pub fn blocks_by_migratetype(&self) -> &[u64; MAX_MIGRATETYPE_TAGS] {
        &self.blocks_by_migratetype
    }

    pub fn categories_by_migratetype(&self) -> &[CategoryCounts; MAX_MIGRATETYPE_TAGS] {
        &self.categories_by_migratetype
    }

    pub fn slablru_in_unmovable(&self) -> SlabLruInUnmovable {
        self.slablru_in_unmovable
    }

    pub fn nonslab_in_reclaimable(&self) -> NonSlabInReclaimable {
        self.nonslab_in_reclaimable
    }

    pub fn nonlru_in_movable(&self) -> NonLruInMovable {
        self.nonlru_in_movable
    }

    pub fn mismatches(&self) -> MismatchCounters {
        self.mismatches
    }
}
