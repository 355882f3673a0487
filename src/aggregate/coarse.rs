//! Coarse pageblock aggregation
//!
//! Sorts every scanned pageblock into dropped (all reserved), regular
//! (no unmovable page) or unmovable-bearing, and collects the block starts
//! the region coalescer works from.

use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::error;

use super::BlockSample;
use crate::classify::CoarseClass;
use crate::layout::{Geometry, MAX_MIGRATETYPE_TAGS};
use crate::walker::{BlockContent, BlockScan, PageRun};
use crate::ScanResult;

/// Page counts of one pageblock by coarse class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoarseTally {
    pub movable: u64,
    pub unmovable: u64,
    pub reserved: u64,
    pub free: u64,
}

impl CoarseTally {
    pub fn add(&mut self, class: CoarseClass, nr_pages: u64) {
        match class {
            CoarseClass::Free => self.free += nr_pages,
            CoarseClass::Reserved => self.reserved += nr_pages,
            c if c.is_movable() => self.movable += nr_pages,
            _ => self.unmovable += nr_pages,
        }
    }

    pub fn from_runs(runs: &[PageRun<CoarseClass>]) -> Self {
        let mut tally = Self::default();
        for run in runs {
            tally.add(run.class, run.nr_pages);
        }
        tally
    }
}

/// What a pageblock contributed to the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Entirely reserved; can host nothing.
    Dropped,
    /// No unmovable page: the whole block can be made available.
    Regular,
    UnmovableBearing(BlockSample),
}

/// Accumulates coarse results over one scan pass.
#[derive(Debug, Clone)]
pub struct CoarseAggregator {
    geometry: Geometry,
    regular_blocks: u64,
    dropped_blocks: u64,
    movable_block_pfns: Vec<u64>,
    free_region_pfns: Vec<u64>,
    samples: Vec<BlockSample>,
    blocks_by_migratetype: [u64; MAX_MIGRATETYPE_TAGS],
}

impl CoarseAggregator {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            regular_blocks: 0,
            dropped_blocks: 0,
            movable_block_pfns: Vec::new(),
            free_region_pfns: Vec::new(),
            samples: Vec::new(),
            blocks_by_migratetype: [0; MAX_MIGRATETYPE_TAGS],
        }
    }

    /// Fold in one scanned pageblock (or one multi-block run).
    ///
    /// A multi-block scan records every covered block with the same
    /// outcome, which is returned.
    pub fn add_block(&mut self, block: &BlockScan<CoarseClass>) -> ScanResult<BlockOutcome> {
        let block_size = self.geometry.pageblock_nr_pages();
        let tag = block.migratetype as usize % MAX_MIGRATETYPE_TAGS;

        let runs = match &block.content {
            BlockContent::AssumedMovable => {
                self.blocks_by_migratetype[tag] += 1;
                let tally = CoarseTally {
                    movable: block.nr_pages(),
                    ..Default::default()
                };
                return self.record(block.start_pfn, block.nr_pages(), tally);
            }
            BlockContent::Classified(runs) => runs,
        };

        if !block.is_multi_block(&self.geometry) {
            self.blocks_by_migratetype[tag] += 1;
            let tally = CoarseTally::from_runs(runs);
            return self.record(block.start_pfn, block.nr_pages(), tally);
        }

        // a single free or compound run covering several blocks
        let class = runs.first().map_or(CoarseClass::Free, |run| run.class);
        let mut per_block = CoarseTally::default();
        per_block.add(class, block_size);

        if class == CoarseClass::Free {
            let chunk = block_size << 1;
            let mut pfn = block.start_pfn;
            while pfn + chunk <= block.end_pfn {
                self.free_region_pfns.push(pfn);
                pfn += chunk;
            }
        }

        let mut outcome = BlockOutcome::Dropped;
        let mut pfn = block.start_pfn;
        while pfn < block.end_pfn {
            self.blocks_by_migratetype[tag] += 1;
            outcome = self.record(pfn, block_size, per_block)?;
            pfn += block_size;
        }
        Ok(outcome)
    }

    fn record(&mut self, block_pfn: u64, span: u64, tally: CoarseTally) -> ScanResult<BlockOutcome> {
        if tally.reserved == span {
            self.dropped_blocks += 1;
            return Ok(BlockOutcome::Dropped);
        }
        if tally.unmovable == 0 {
            self.regular_blocks += 1;
            self.movable_block_pfns.push(block_pfn);
            return Ok(BlockOutcome::Regular);
        }
        let block_size = self.geometry.pageblock_nr_pages();
        let sample = match BlockSample::new(block_pfn, block_size, tally.movable, tally.unmovable) {
            Ok(sample) => sample,
            Err(e) => {
                error!("{}", e);
                return Err(e);
            }
        };
        self.samples.push(sample);
        Ok(BlockOutcome::UnmovableBearing(sample))
    }

    pub fn regular_blocks(&self) -> u64 {
        self.regular_blocks
    }

    pub fn dropped_blocks(&self) -> u64 {
        self.dropped_blocks
    }

    pub fn unmovable_blocks(&self) -> u64 {
        self.samples.len() as u64
    }

    /// Starts of blocks free of unmovable pages, at pageblock order.
    pub fn movable_block_pfns(&self) -> &[u64] {
        &self.movable_block_pfns
    }

    /// Starts of fully free regions at pageblock order + 1.
    pub fn free_region_pfns(&self) -> &[u64] {
        &self.free_region_pfns
    }

    pub fn samples(&self) -> &[BlockSample] {
        &self.samples
    }

    /// Blocks seen per raw migratetype tag.
    pub fn blocks_by_migratetype(&self) -> &[u64; MAX_MIGRATETYPE_TAGS] {
        &self.blocks_by_migratetype
    }

    /// Unmovable pages summed over all unmovable-bearing blocks.
    pub fn total_unmovable_pages(&self) -> u64 {
        self.samples.iter().map(|s| s.unmovable).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    const G: Geometry = Geometry::REFERENCE;

    fn run(offset: u64, nr_pages: u64, class: CoarseClass) -> PageRun<CoarseClass> {
        PageRun {
            offset,
            nr_pages,
            class,
        }
    }

    fn block(start_pfn: u64, end_pfn: u64, runs: Vec<PageRun<CoarseClass>>) -> BlockScan<CoarseClass> {
        BlockScan {
            start_pfn,
            end_pfn,
            migratetype: 1,
            content: BlockContent::Classified(runs),
        }
    }

    #[test]
    fn test_regular_block() {
        let mut agg = CoarseAggregator::new(G);
        let b = block(0, 512, vec![run(0, 256, CoarseClass::Free), run(256, 256, CoarseClass::Movable)]);
        assert_eq!(agg.add_block(&b), Ok(BlockOutcome::Regular));
        assert_eq!(agg.regular_blocks(), 1);
        assert_eq!(agg.movable_block_pfns(), &[0]);
        assert_eq!(agg.blocks_by_migratetype()[1], 1);
    }

    #[test]
    fn test_reserved_block_dropped() {
        let mut agg = CoarseAggregator::new(G);
        let runs = (0..512).map(|i| run(i, 1, CoarseClass::Reserved)).collect();
        assert_eq!(agg.add_block(&block(512, 1024, runs)), Ok(BlockOutcome::Dropped));
        assert_eq!(agg.regular_blocks(), 0);
        assert_eq!(agg.unmovable_blocks(), 0);
        assert_eq!(agg.dropped_blocks(), 1);
    }

    #[test]
    fn test_partly_reserved_block_is_regular() {
        let mut agg = CoarseAggregator::new(G);
        let b = block(0, 512, vec![run(0, 511, CoarseClass::Movable), run(511, 1, CoarseClass::Reserved)]);
        assert_eq!(agg.add_block(&b), Ok(BlockOutcome::Regular));
    }

    #[test]
    fn test_unmovable_bearing_block() {
        let mut agg = CoarseAggregator::new(G);
        let b = block(
            1024,
            1536,
            vec![
                run(0, 4, CoarseClass::Compound { movable: false }),
                run(4, 100, CoarseClass::Movable),
                run(104, 8, CoarseClass::Reserved),
                run(112, 400, CoarseClass::Free),
            ],
        );
        let outcome = agg.add_block(&b).unwrap();
        let sample = BlockSample {
            block_pfn: 1024,
            movable: 100,
            unmovable: 4,
            free: 408,
        };
        assert_eq!(outcome, BlockOutcome::UnmovableBearing(sample));
        assert_eq!(agg.samples(), &[sample]);
        assert_eq!(agg.total_unmovable_pages(), 4);
        assert!(agg.movable_block_pfns().is_empty());
    }

    #[test]
    fn test_multi_block_free_run() {
        let mut agg = CoarseAggregator::new(G);
        let b = block(2048, 3072, vec![run(0, 1024, CoarseClass::Free)]);
        assert_eq!(agg.add_block(&b), Ok(BlockOutcome::Regular));
        assert_eq!(agg.regular_blocks(), 2);
        assert_eq!(agg.movable_block_pfns(), &[2048, 2560]);
        assert_eq!(agg.free_region_pfns(), &[2048]);
        assert_eq!(agg.blocks_by_migratetype()[1], 2);
    }

    #[test]
    fn test_multi_block_unmovable_compound() {
        let mut agg = CoarseAggregator::new(G);
        let b = block(0, 1024, vec![run(0, 1024, CoarseClass::Compound { movable: false })]);
        agg.add_block(&b).unwrap();
        assert_eq!(agg.unmovable_blocks(), 2);
        assert_eq!(agg.total_unmovable_pages(), 1024);
        assert!(agg.samples().iter().all(|s| s.movable == 0 && s.free == 0));
        assert!(agg.free_region_pfns().is_empty());
    }

    #[test]
    fn test_tally_of_clamped_runs_fits_block() {
        use crate::classify::CoarseTaxonomy;
        use crate::layout::PageFlagBits;
        use crate::page::PageFrame;
        use crate::snapshot::SnapshotProvider;
        use crate::walker::PfnWalker;

        let bits = PageFlagBits::LINUX_6_1;
        let page = |flags: u64| PageFrame {
            flags,
            refcount: 1,
            ..Default::default()
        };
        let mut snap = SnapshotProvider::new(G, bits, 512);
        snap.online_range(0, 512);
        snap.fill(0, 100, page(PageFlagBits::mask(bits.reserved)));
        snap.fill(100, 200, page(PageFlagBits::mask(bits.lru)));
        snap.fill(300, 196, page(0));
        snap.add_compound(496, 2, page(0));
        snap.fill(500, 4, page(0));
        // order 4 free block overruns the block end by 8 frames
        snap.add_buddy(504, 4);

        let mut walker = PfnWalker::new(&snap, CoarseTaxonomy::new(G, bits), G).unwrap();
        let block = walker.next_block().unwrap().unwrap();
        assert_eq!(block.nr_pages(), 512);
        let tally = CoarseTally::from_runs(block.runs());
        assert_eq!(
            tally,
            CoarseTally {
                movable: 200,
                unmovable: 204,
                reserved: 100,
                free: 8,
            }
        );
        assert!(tally.movable + tally.unmovable + tally.reserved <= block.nr_pages());

        let mut agg = CoarseAggregator::new(G);
        match agg.add_block(&block).unwrap() {
            BlockOutcome::UnmovableBearing(sample) => {
                assert_eq!(sample.free, 512 - 200 - 204);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_assumed_movable_block() {
        let mut agg = CoarseAggregator::new(G);
        let b = BlockScan {
            start_pfn: 4096,
            end_pfn: 4608,
            migratetype: 1,
            content: BlockContent::AssumedMovable,
        };
        assert_eq!(agg.add_block(&b), Ok(BlockOutcome::Regular));
        assert_eq!(agg.movable_block_pfns(), &[4096]);
    }
}
