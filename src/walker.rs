//! PFN walker
//!
//! Cursor over the PFN space that yields one classified pageblock per step.
//! Offline sections are skipped at max-order granularity, multi-frame pages
//! are visited once through their head, and every run length is clamped to
//! the pageblock being scanned.

use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::{debug, error};

use crate::classify::Taxonomy;
use crate::layout::Geometry;
use crate::provider::PageMetadataProvider;
use crate::{align_down, is_aligned, next_boundary, ScanError, ScanResult};

/// A classified run inside a pageblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRun<C> {
    /// Offset of the first frame from the block start.
    pub offset: u64,
    pub nr_pages: u64,
    pub class: C,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockContent<C> {
    /// Runs in ascending offset order, together covering the block.
    Classified(Vec<PageRun<C>>),
    /// Past the host boundary: not inspected, known movable.
    AssumedMovable,
}

/// One scanned pageblock.
///
/// Normally `[start_pfn, end_pfn)` is one aligned pageblock, truncated at
/// `max_pfn` for the last one. When a single free or compound run starting
/// on the block boundary is larger than a pageblock the scan covers every
/// block of that run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockScan<C> {
    pub start_pfn: u64,
    pub end_pfn: u64,
    /// Raw migratetype tag of the first block.
    pub migratetype: u8,
    pub content: BlockContent<C>,
}

impl<C> BlockScan<C> {
    #[inline]
    pub fn nr_pages(&self) -> u64 {
        self.end_pfn - self.start_pfn
    }

    /// Whether this scan covers more than one pageblock.
    #[inline]
    pub fn is_multi_block(&self, geometry: &Geometry) -> bool {
        self.nr_pages() > geometry.pageblock_nr_pages()
    }

    pub fn runs(&self) -> &[PageRun<C>] {
        match &self.content {
            BlockContent::Classified(runs) => runs,
            BlockContent::AssumedMovable => &[],
        }
    }
}

/// Pageblock cursor over `[min_pfn, max_pfn)`.
pub struct PfnWalker<'a, P: PageMetadataProvider, T: Taxonomy> {
    provider: &'a P,
    taxonomy: T,
    geometry: Geometry,
    pfn: u64,
    max_pfn: u64,
    boundary_pfn: Option<u64>,
}

impl<'a, P: PageMetadataProvider, T: Taxonomy> PfnWalker<'a, P, T> {
    /// Walk the provider's whole PFN space.
    pub fn new(provider: &'a P, taxonomy: T, geometry: Geometry) -> ScanResult<Self> {
        geometry.validate()?;
        Ok(Self {
            provider,
            taxonomy,
            geometry,
            pfn: 0,
            max_pfn: provider.max_pfn(),
            boundary_pfn: None,
        })
    }

    /// Start at the pageblock holding `min_pfn`.
    pub fn start_at(mut self, min_pfn: u64) -> Self {
        self.pfn = align_down(min_pfn, self.geometry.pageblock_nr_pages());
        self
    }

    /// Stop at `max_pfn` instead of the provider's `max_pfn`.
    pub fn end_at(mut self, max_pfn: u64) -> Self {
        self.max_pfn = max_pfn;
        self
    }

    /// Treat every block starting above `boundary_pfn` as movable without
    /// reading it.
    pub fn with_boundary(mut self, boundary_pfn: Option<u64>) -> Self {
        self.boundary_pfn = boundary_pfn;
        self
    }

    /// Next PFN the walker will look at.
    pub fn position(&self) -> u64 {
        self.pfn
    }

    pub fn max_pfn(&self) -> u64 {
        self.max_pfn
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Scan the next online pageblock, `None` once `max_pfn` is reached.
    ///
    /// On error the cursor stays on the failing block.
    pub fn next_block(&mut self) -> ScanResult<Option<BlockScan<T::Class>>> {
        let block_size = self.geometry.pageblock_nr_pages();
        loop {
            let pfn = self.pfn;
            if pfn >= self.max_pfn {
                return Ok(None);
            }

            if !self.provider.is_valid_online_section(pfn) {
                let next = next_boundary(pfn, self.geometry.max_order_nr_pages());
                debug!("skipping offline pfns [{}, {})", pfn, next);
                self.pfn = next;
                continue;
            }

            let start_pfn = pfn;
            let end_pfn = next_boundary(pfn, block_size).min(self.max_pfn);
            let migratetype = self.provider.section_migratetype(pfn);

            if self.boundary_pfn.is_some_and(|boundary| pfn > boundary) {
                self.pfn = end_pfn;
                return Ok(Some(BlockScan {
                    start_pfn,
                    end_pfn,
                    migratetype,
                    content: BlockContent::AssumedMovable,
                }));
            }

            let (end_pfn, runs) = self.classify_block(start_pfn, end_pfn)?;
            self.pfn = end_pfn;
            return Ok(Some(BlockScan {
                start_pfn,
                end_pfn,
                migratetype,
                content: BlockContent::Classified(runs),
            }));
        }
    }

    fn classify_block(
        &self,
        start_pfn: u64,
        mut end_pfn: u64,
    ) -> ScanResult<(u64, Vec<PageRun<T::Class>>)> {
        let block_size = self.geometry.pageblock_nr_pages();
        let mut runs = Vec::new();
        let mut pfn = start_pfn;
        while pfn < end_pfn {
            let classified = self.taxonomy.classify(self.provider, pfn)?;
            let remaining = end_pfn - pfn;
            let mut nr_pages = classified.nr_pages.max(1);
            if nr_pages > remaining {
                if pfn == start_pfn && self.can_span(start_pfn, nr_pages) {
                    end_pfn = start_pfn + nr_pages;
                } else if nr_pages > block_size && T::is_oversize_fatal(classified.class) {
                    let page = self.provider.page(pfn)?;
                    error!("{}: bogus compound size {}", pfn, nr_pages);
                    error!("{:?}", page);
                    return Err(ScanError::BogusCompoundSize {
                        pfn,
                        nr_pages,
                        page,
                    });
                } else {
                    nr_pages = remaining;
                }
            }
            runs.push(PageRun {
                offset: pfn - start_pfn,
                nr_pages,
                class: classified.class,
            });
            pfn += nr_pages;
        }
        Ok((end_pfn, runs))
    }

    /// A run at a block start may cover whole following blocks if it is
    /// naturally aligned, fits below `max_pfn` and every covered block is
    /// online.
    fn can_span(&self, start_pfn: u64, nr_pages: u64) -> bool {
        let block_size = self.geometry.pageblock_nr_pages();
        T::SPANS_BLOCKS
            && nr_pages > block_size
            && nr_pages <= self.geometry.max_order_nr_pages()
            && is_aligned(start_pfn, nr_pages)
            && start_pfn + nr_pages <= self.max_pfn
            && (start_pfn..start_pfn + nr_pages)
                .step_by(block_size as usize)
                .all(|pfn| self.provider.is_valid_online_section(pfn))
    }
}

impl<P: PageMetadataProvider, T: Taxonomy> Iterator for PfnWalker<'_, P, T> {
    type Item = ScanResult<BlockScan<T::Class>>;

    /// Stops after the first error.
    fn next(&mut self) -> Option<Self::Item> {
        match self.next_block() {
            Ok(block) => block.map(Ok),
            Err(e) => {
                self.pfn = self.max_pfn;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{CoarseClass, CoarseTaxonomy, FineTaxonomy, PageCategory};
    use crate::layout::PageFlagBits;
    use crate::page::PageFrame;
    use crate::snapshot::SnapshotProvider;
    use crate::ScanError;

    const G: Geometry = Geometry::REFERENCE;
    const BITS: PageFlagBits = PageFlagBits::LINUX_6_1;

    fn unmovable() -> PageFrame {
        PageFrame {
            refcount: 1,
            ..Default::default()
        }
    }

    fn coarse_walker(snap: &SnapshotProvider) -> PfnWalker<'_, SnapshotProvider, CoarseTaxonomy> {
        PfnWalker::new(snap, CoarseTaxonomy::new(G, BITS), G).unwrap()
    }

    #[test]
    fn test_walks_aligned_blocks() {
        let mut snap = SnapshotProvider::new(G, BITS, 2048);
        snap.online_range(0, 2048);
        snap.fill(0, 2048, unmovable());
        let blocks: Vec<_> = coarse_walker(&snap).map(|b| b.unwrap()).collect();
        assert_eq!(blocks.len(), 4);
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.start_pfn, i as u64 * 512);
            assert_eq!(block.nr_pages(), 512);
            assert_eq!(block.runs().len(), 512);
        }
    }

    #[test]
    fn test_truncated_last_block() {
        let mut snap = SnapshotProvider::new(G, BITS, 700);
        snap.online_range(0, 700);
        let blocks: Vec<_> = coarse_walker(&snap).map(|b| b.unwrap()).collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].start_pfn, 512);
        assert_eq!(blocks[1].end_pfn, 700);
    }

    #[test]
    fn test_skips_offline_sections() {
        let mut snap = SnapshotProvider::new(G, BITS, 3 * 32768);
        snap.online_range(2 * 32768, 2 * 32768 + 1);
        let mut walker = coarse_walker(&snap);
        let first = walker.next_block().unwrap().unwrap();
        assert_eq!(first.start_pfn, 2 * 32768);
        assert_eq!(walker.by_ref().count(), 63);
        assert_eq!(walker.position(), 3 * 32768);
    }

    #[test]
    fn test_buddy_run_visited_once() {
        let mut snap = SnapshotProvider::new(G, BITS, 512);
        snap.online_range(0, 512);
        snap.add_buddy(0, 8);
        snap.fill(256, 256, unmovable());
        let block = coarse_walker(&snap).next_block().unwrap().unwrap();
        let runs = block.runs();
        assert_eq!(runs.len(), 257);
        assert_eq!(runs[0].class, CoarseClass::Free);
        assert_eq!(runs[0].nr_pages, 256);
        assert_eq!(runs[1].offset, 256);
    }

    #[test]
    fn test_overrunning_run_is_clamped() {
        let mut snap = SnapshotProvider::new(G, BITS, 1024);
        snap.online_range(0, 1024);
        // order-4 buddy claimed 8 frames before the block end
        snap.fill(0, 504, unmovable());
        snap.add_buddy(504, 4);
        let mut walker = coarse_walker(&snap);
        let block = walker.next_block().unwrap().unwrap();
        assert_eq!(block.end_pfn, 512);
        let last = block.runs().last().copied().unwrap();
        assert_eq!(last.offset, 504);
        assert_eq!(last.nr_pages, 8);
        assert_eq!(walker.position(), 512);
    }

    #[test]
    fn test_aligned_max_order_buddy_spans_two_blocks() {
        let mut snap = SnapshotProvider::new(G, BITS, 2048);
        snap.online_range(0, 2048);
        snap.add_buddy(1024, 10);
        let blocks: Vec<_> = coarse_walker(&snap).map(|b| b.unwrap()).collect();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2].start_pfn, 1024);
        assert_eq!(blocks[2].end_pfn, 2048);
        assert!(blocks[2].is_multi_block(&G));
        assert_eq!(blocks[2].runs().len(), 1);
    }

    #[test]
    fn test_unaligned_oversized_compound_aborts() {
        let mut snap = SnapshotProvider::new(G, BITS, 2048);
        snap.online_range(0, 2048);
        let head = PageFrame {
            flags: PageFlagBits::mask(BITS.lru),
            refcount: 1,
            ..Default::default()
        };
        // order 10 starting on an odd pageblock cannot span
        snap.add_compound(512, 10, head);
        let mut walker = coarse_walker(&snap);
        assert!(walker.next_block().unwrap().is_some());
        match walker.next_block() {
            Err(ScanError::BogusCompoundSize { pfn, nr_pages, page }) => {
                assert_eq!(pfn, 512);
                assert_eq!(nr_pages, 1024);
                assert!(page.is_head(&BITS));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(walker.position(), 512);
    }

    #[test]
    fn test_compound_past_max_pfn_aborts() {
        let mut snap = SnapshotProvider::new(G, BITS, 512);
        snap.online_range(0, 512);
        snap.add_compound(0, 10, PageFrame::default());
        assert!(matches!(
            coarse_walker(&snap).next_block(),
            Err(ScanError::BogusCompoundSize { pfn: 0, .. })
        ));
    }

    #[test]
    fn test_fine_mode_never_spans() {
        let mut snap = SnapshotProvider::new(G, BITS, 1024);
        snap.online_range(0, 1024);
        snap.add_buddy(0, 10);
        let walker = PfnWalker::new(&snap, FineTaxonomy::new(G, BITS, None), G).unwrap();
        let blocks: Vec<_> = walker.map(|b| b.unwrap()).collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].runs()[0].nr_pages, 512);
        // tails of the free block are zeroed pages
        assert_eq!(blocks[1].runs()[0].class, PageCategory::Unreferenced);
    }

    #[test]
    fn test_boundary_fast_path() {
        let mut snap = SnapshotProvider::new(G, BITS, 2048);
        snap.online_range(0, 2048);
        let blocks: Vec<_> = coarse_walker(&snap)
            .with_boundary(Some(600))
            .map(|b| b.unwrap())
            .collect();
        assert!(matches!(blocks[0].content, BlockContent::Classified(_)));
        assert!(matches!(blocks[1].content, BlockContent::Classified(_)));
        assert_eq!(blocks[2].content, BlockContent::AssumedMovable);
        assert_eq!(blocks[3].content, BlockContent::AssumedMovable);
    }

    #[test]
    fn test_start_is_block_aligned() {
        let mut snap = SnapshotProvider::new(G, BITS, 2048);
        snap.online_range(0, 2048);
        let mut walker = coarse_walker(&snap).start_at(700);
        assert_eq!(walker.position(), 512);
        assert_eq!(walker.next_block().unwrap().unwrap().start_pfn, 512);
    }

    #[test]
    fn test_bogus_compound_aborts_iteration() {
        let mut snap = SnapshotProvider::new(G, BITS, 2048);
        snap.online_range(0, 2048);
        snap.set_page(
            512,
            PageFrame {
                flags: PageFlagBits::mask(BITS.head),
                compound_order: 10,
                refcount: 1,
                ..Default::default()
            },
        );
        let mut walker = PfnWalker::new(&snap, FineTaxonomy::new(G, BITS, None), G).unwrap();
        assert!(walker.next().unwrap().is_ok());
        match walker.next() {
            Some(Err(ScanError::BogusCompoundSize { pfn, nr_pages, .. })) => {
                assert_eq!(pfn, 512);
                assert_eq!(nr_pages, 1024);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(walker.next().is_none());
    }
}
