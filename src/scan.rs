//! Scan passes
//!
//! Drives a [`PfnWalker`] over the provider, feeds every finished block to
//! the matching aggregator, and turns the aggregate into a report. Both
//! passes can be stepped one pageblock at a time and abandoned between
//! steps.

use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::{debug, info};

use crate::aggregate::{
    BlockOutcome, CategoryCounts, CoarseAggregator, FineAggregator, MismatchCounters,
    NonLruInMovable, NonSlabInReclaimable, SlabLruInUnmovable,
};
use crate::classify::{CoarseTaxonomy, FineTaxonomy, Taxonomy};
use crate::coalesce::{gigantic_order, CoalescedRegions, RegionSet};
use crate::layout::{Geometry, MigratetypeTable, PageFlagBits, MAX_MIGRATETYPE_TAGS};
use crate::page::Migratetype;
use crate::provider::PageMetadataProvider;
use crate::stats::{unmovable_fraction, SampleStats, StatsReporter};
use crate::walker::{BlockContent, BlockScan, PfnWalker};
use crate::ScanResult;

/// Which pageblocks get a per-run dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DumpPolicy {
    #[default]
    Never,
    /// Blocks with findings: mismatching runs (fine pass) or unmovable pages
    /// in a block declared movable (coarse pass).
    Mismatches,
    All,
}

/// Knobs shared by both passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    pub geometry: Geometry,
    pub flag_bits: PageFlagBits,
    pub migratetypes: MigratetypeTable,
    /// First PFN scanned, aligned down to its pageblock.
    pub min_pfn: u64,
    /// Scan end; the provider's `max_pfn` when unset.
    pub max_pfn: Option<u64>,
    /// Blocks starting above this PFN are assumed movable without reading.
    pub boundary_pfn: Option<u64>,
    /// Address of `zsmalloc_mops` in the scanned kernel.
    pub zsmalloc_mops: Option<u64>,
    /// Highest coalescing order; 1 GiB when unset.
    pub max_region_order: Option<u32>,
    pub dump: DumpPolicy,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            geometry: Geometry::REFERENCE,
            flag_bits: PageFlagBits::LINUX_6_1,
            migratetypes: MigratetypeTable::default(),
            min_pfn: 0,
            max_pfn: None,
            boundary_pfn: None,
            zsmalloc_mops: None,
            max_region_order: None,
            dump: DumpPolicy::Never,
        }
    }
}

impl ScanOptions {
    fn max_region_order(&self) -> u32 {
        self.max_region_order
            .unwrap_or_else(|| gigantic_order(&self.geometry))
    }

    fn walker<'a, P: PageMetadataProvider, T: Taxonomy>(
        &self,
        provider: &'a P,
        taxonomy: T,
    ) -> ScanResult<PfnWalker<'a, P, T>> {
        let walker = PfnWalker::new(provider, taxonomy, self.geometry)?
            .start_at(self.min_pfn)
            .with_boundary(self.boundary_pfn);
        Ok(match self.max_pfn {
            Some(max_pfn) => walker.end_at(max_pfn),
            None => walker,
        })
    }
}

/// Log every run of `block`.
#[allow(unused_variables)]
pub fn dump_block<T: Taxonomy>(block: &BlockScan<T::Class>, table: &MigratetypeTable) {
    info!(
        "dumping {} pageblock at {}",
        table.decode(block.migratetype),
        block.start_pfn
    );
    match &block.content {
        BlockContent::AssumedMovable => {
            info!("0 assumed-movable {}", block.nr_pages());
        }
        BlockContent::Classified(runs) => {
            for run in runs {
                info!("{} {} {}", run.offset, T::label(run.class), run.nr_pages);
            }
        }
    }
}

/// Result of a coarse pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CoarseReport {
    pub regular_blocks: u64,
    pub unmovable_blocks: u64,
    pub dropped_blocks: u64,
    pub unmovable_fraction: Option<f64>,
    /// Unmovable pages summed over unmovable-bearing blocks.
    pub unmovable_pages: u64,
    pub stats: SampleStats,
    /// `(order, count)` of fully movable-capable regions.
    pub movable_regions: Vec<(u32, usize)>,
    /// `(order, count)` of fully free regions.
    pub free_regions: Vec<(u32, usize)>,
    pub blocks_by_migratetype: [u64; MAX_MIGRATETYPE_TAGS],
}

impl CoarseReport {
    /// Region count at `order` from the movable pass.
    pub fn movable_regions_at(&self, order: u32) -> Option<usize> {
        lookup(&self.movable_regions, order)
    }

    /// Region count at `order` from the free pass.
    pub fn free_regions_at(&self, order: u32) -> Option<usize> {
        lookup(&self.free_regions, order)
    }
}

fn lookup(counts: &[(u32, usize)], order: u32) -> Option<usize> {
    counts.iter().find(|(o, _)| *o == order).map(|&(_, n)| n)
}

/// Result of a fine pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FineReport {
    pub total_blocks: u64,
    pub blocks_with_nonmovable: u64,
    pub blocks_by_migratetype: [u64; MAX_MIGRATETYPE_TAGS],
    pub categories_by_migratetype: [CategoryCounts; MAX_MIGRATETYPE_TAGS],
    pub slablru_in_unmovable: SlabLruInUnmovable,
    pub nonslab_in_reclaimable: NonSlabInReclaimable,
    pub nonlru_in_movable: NonLruInMovable,
    pub mismatches: MismatchCounters,
}

/// A coarse pass in progress.
pub struct CoarseScan<'a, P: PageMetadataProvider> {
    walker: PfnWalker<'a, P, CoarseTaxonomy>,
    aggregator: CoarseAggregator,
    options: ScanOptions,
}

impl<'a, P: PageMetadataProvider> CoarseScan<'a, P> {
    pub fn new(provider: &'a P, options: ScanOptions) -> ScanResult<Self> {
        let taxonomy = CoarseTaxonomy::new(options.geometry, options.flag_bits);
        Ok(Self {
            walker: options.walker(provider, taxonomy)?,
            aggregator: CoarseAggregator::new(options.geometry),
            options,
        })
    }

    /// Scan and aggregate one pageblock. Returns `false` once done.
    pub fn step(&mut self) -> ScanResult<bool> {
        let Some(block) = self.walker.next_block()? else {
            return Ok(false);
        };
        let outcome = self.aggregator.add_block(&block)?;
        let dump = match self.options.dump {
            DumpPolicy::Never => false,
            DumpPolicy::All => true,
            DumpPolicy::Mismatches => {
                matches!(outcome, BlockOutcome::UnmovableBearing(_))
                    && self.options.migratetypes.decode(block.migratetype) == Migratetype::Movable
            }
        };
        if dump {
            dump_block::<CoarseTaxonomy>(&block, &self.options.migratetypes);
        }
        Ok(true)
    }

    /// Next PFN to be scanned.
    pub fn position(&self) -> u64 {
        self.walker.position()
    }

    pub fn aggregator(&self) -> &CoarseAggregator {
        &self.aggregator
    }

    /// Coalesce and summarize what has been scanned so far.
    pub fn finish(self) -> CoarseReport {
        debug!("coarse scan finished at pfn {}", self.walker.position());
        let agg = &self.aggregator;
        let geometry = &self.options.geometry;
        let max_order = self.options.max_region_order();

        let movable = CoalescedRegions::build(
            RegionSet::from_pfns(
                geometry.pageblock_order,
                agg.movable_block_pfns().iter().copied(),
            ),
            max_order,
        );
        let free = CoalescedRegions::build(
            RegionSet::from_pfns(
                geometry.pageblock_order + 1,
                agg.free_region_pfns().iter().copied(),
            ),
            max_order,
        );

        CoarseReport {
            regular_blocks: agg.regular_blocks(),
            unmovable_blocks: agg.unmovable_blocks(),
            dropped_blocks: agg.dropped_blocks(),
            unmovable_fraction: unmovable_fraction(agg.regular_blocks(), agg.unmovable_blocks()),
            unmovable_pages: agg.total_unmovable_pages(),
            stats: SampleStats::from_samples(agg.samples()),
            movable_regions: movable.counts(),
            free_regions: free.counts(),
            blocks_by_migratetype: *agg.blocks_by_migratetype(),
        }
    }
}

/// A fine pass in progress.
pub struct FineScan<'a, P: PageMetadataProvider> {
    walker: PfnWalker<'a, P, FineTaxonomy>,
    aggregator: FineAggregator,
    options: ScanOptions,
}

impl<'a, P: PageMetadataProvider> FineScan<'a, P> {
    pub fn new(provider: &'a P, options: ScanOptions) -> ScanResult<Self> {
        let taxonomy =
            FineTaxonomy::new(options.geometry, options.flag_bits, options.zsmalloc_mops);
        Ok(Self {
            walker: options.walker(provider, taxonomy)?,
            aggregator: FineAggregator::new(options.migratetypes),
            options,
        })
    }

    /// Scan and aggregate one pageblock. Returns `false` once done.
    pub fn step(&mut self) -> ScanResult<bool> {
        let Some(block) = self.walker.next_block()? else {
            return Ok(false);
        };
        let outcome = self.aggregator.add_block(&block);
        let dump = match self.options.dump {
            DumpPolicy::Never => false,
            DumpPolicy::All => true,
            DumpPolicy::Mismatches => outcome.mismatches > 0,
        };
        if dump {
            dump_block::<FineTaxonomy>(&block, &self.options.migratetypes);
        }
        Ok(true)
    }

    pub fn position(&self) -> u64 {
        self.walker.position()
    }

    pub fn aggregator(&self) -> &FineAggregator {
        &self.aggregator
    }

    pub fn finish(self) -> FineReport {
        debug!("fine scan finished at pfn {}", self.walker.position());
        let agg = &self.aggregator;
        FineReport {
            total_blocks: agg.total_blocks(),
            blocks_with_nonmovable: agg.blocks_with_nonmovable(),
            blocks_by_migratetype: *agg.blocks_by_migratetype(),
            categories_by_migratetype: *agg.categories_by_migratetype(),
            slablru_in_unmovable: agg.slablru_in_unmovable(),
            nonslab_in_reclaimable: agg.nonslab_in_reclaimable(),
            nonlru_in_movable: agg.nonlru_in_movable(),
            mismatches: agg.mismatches(),
        }
    }
}

/// Run a full coarse pass and log its report.
pub fn scan_coarse<P: PageMetadataProvider>(
    provider: &P,
    options: ScanOptions,
) -> ScanResult<CoarseReport> {
    let mut scan = CoarseScan::new(provider, options)?;
    while scan.step()? {}
    let report = scan.finish();
    StatsReporter::log_coarse(&report, &options.migratetypes);
    Ok(report)
}

/// Run a full fine pass and log its report.
pub fn scan_fine<P: PageMetadataProvider>(
    provider: &P,
    options: ScanOptions,
) -> ScanResult<FineReport> {
    let mut scan = FineScan::new(provider, options)?;
    while scan.step()? {}
    let report = scan.finish();
    StatsReporter::log_fine(&report, &options.migratetypes);
    Ok(report)
}
