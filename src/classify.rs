//! Page classification
//!
//! Two taxonomies map one page's metadata to a tag plus the number of
//! frames the tag covers. Both are evaluated in a fixed precedence order
//! and never fail on a racy read; the only error they raise is a compound
//! size that cannot physically exist.

use core::fmt;

#[cfg(feature = "log")]
use log::error;

use crate::layout::{Geometry, PageFlagBits};
use crate::page::{MappingFlags, PageFrame};
use crate::provider::PageMetadataProvider;
use crate::{ScanError, ScanResult};

/// A classified run of frames starting at the classified PFN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified<C> {
    pub class: C,
    /// Frames covered, before the walker clamps it to the block.
    pub nr_pages: u64,
}

/// A page classification scheme pluggable into the walker.
pub trait Taxonomy {
    type Class: Copy + fmt::Debug + PartialEq;

    /// Whether a run beginning on a pageblock boundary may cover several
    /// whole pageblocks instead of being clamped to the first one.
    const SPANS_BLOCKS: bool;

    /// Classify the page at `pfn`.
    fn classify<P: PageMetadataProvider>(
        &self,
        provider: &P,
        pfn: u64,
    ) -> ScanResult<Classified<Self::Class>>;

    /// Short label used in block dumps.
    fn label(class: Self::Class) -> &'static str;

    /// Whether a run of `class` longer than a pageblock that cannot span
    /// blocks is an impossible size rather than an overrun to clamp.
    fn is_oversize_fatal(_class: Self::Class) -> bool {
        false
    }
}

/// Run length of a power-of-two block read from unlocked metadata.
///
/// Orders at or above `max_order` are garbage from a torn read and count
/// as a single frame.
#[inline]
fn order_run(order: u64, geometry: &Geometry) -> u64 {
    if order < geometry.max_order as u64 {
        1 << order
    } else {
        1
    }
}

/// Coarse page state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoarseClass {
    /// On a buddy free list.
    Free,
    /// Head of a compound allocation; movable when it is on an LRU list.
    Compound { movable: bool },
    Reserved,
    Movable,
    Unmovable,
}

impl CoarseClass {
    pub const fn is_movable(&self) -> bool {
        matches!(self, Self::Movable | Self::Compound { movable: true })
    }

    pub const fn is_unmovable(&self) -> bool {
        matches!(self, Self::Unmovable | Self::Compound { movable: false })
    }
}

/// Three-way movable / unmovable / free classification.
#[derive(Debug, Clone, Copy)]
pub struct CoarseTaxonomy {
    geometry: Geometry,
    bits: PageFlagBits,
}

impl CoarseTaxonomy {
    pub const fn new(geometry: Geometry, bits: PageFlagBits) -> Self {
        Self { geometry, bits }
    }

    /// Classify an already read page.
    pub fn classify_page(&self, page: &PageFrame) -> Classified<CoarseClass> {
        let bits = &self.bits;
        if page.is_buddy() {
            return Classified {
                class: CoarseClass::Free,
                nr_pages: order_run(page.buddy_order_unsafe(), &self.geometry),
            };
        }
        if page.is_compound(bits) {
            return Classified {
                class: CoarseClass::Compound {
                    movable: page.is_lru(bits),
                },
                nr_pages: order_run(page.compound_order(bits) as u64, &self.geometry),
            };
        }
        let class = if page.is_reserved(bits) {
            CoarseClass::Reserved
        } else if page.is_lru(bits) || page.is_movable_mapping() {
            CoarseClass::Movable
        } else {
            CoarseClass::Unmovable
        };
        Classified { class, nr_pages: 1 }
    }
}

impl Taxonomy for CoarseTaxonomy {
    type Class = CoarseClass;
    const SPANS_BLOCKS: bool = true;

    fn classify<P: PageMetadataProvider>(
        &self,
        provider: &P,
        pfn: u64,
    ) -> ScanResult<Classified<CoarseClass>> {
        let page = provider.page(pfn)?;
        Ok(self.classify_page(&page))
    }

    fn label(class: CoarseClass) -> &'static str {
        match class {
            CoarseClass::Free => "free",
            CoarseClass::Compound { movable: true } => "thp",
            CoarseClass::Compound { movable: false } => "compound",
            CoarseClass::Reserved => "reserved",
            CoarseClass::Movable => "movable",
            CoarseClass::Unmovable => "unmovable",
        }
    }

    fn is_oversize_fatal(class: CoarseClass) -> bool {
        matches!(class, CoarseClass::Compound { .. })
    }
}

/// Number of [`PageCategory`] variants.
pub const NR_CATEGORIES: usize = 9;

/// Fine page category, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageCategory {
    Reserved = 0,
    Buddy = 1,
    UnreclaimableSlab = 2,
    ReclaimableSlab = 3,
    /// zsmalloc pages: not on an LRU, but migratable.
    Zsmalloc = 4,
    Lru = 5,
    Kmem = 6,
    /// Zero refcount, not free: in transit to or from the allocator.
    Unreferenced = 7,
    Other = 8,
}

impl PageCategory {
    pub const ALL: [Self; NR_CATEGORIES] = [
        Self::Reserved,
        Self::Buddy,
        Self::UnreclaimableSlab,
        Self::ReclaimableSlab,
        Self::Zsmalloc,
        Self::Lru,
        Self::Kmem,
        Self::Unreferenced,
        Self::Other,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Buddy => "buddy",
            Self::UnreclaimableSlab => "sunreclaim",
            Self::ReclaimableSlab => "sreclaim",
            Self::Zsmalloc => "zsmalloc",
            Self::Lru => "lru",
            Self::Kmem => "kmem",
            Self::Unreferenced => "unref",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for PageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Nine-way classification for migratetype cross-tabulation.
#[derive(Debug, Clone, Copy)]
pub struct FineTaxonomy {
    geometry: Geometry,
    bits: PageFlagBits,
    /// Address of `zsmalloc_mops`, when the kernel has zsmalloc.
    zsmalloc_mops: Option<u64>,
}

impl FineTaxonomy {
    pub const fn new(geometry: Geometry, bits: PageFlagBits, zsmalloc_mops: Option<u64>) -> Self {
        Self {
            geometry,
            bits,
            zsmalloc_mops,
        }
    }

    /// Category of an already read page.
    pub fn category(&self, page: &PageFrame) -> PageCategory {
        let bits = &self.bits;
        if page.is_reserved(bits) {
            return PageCategory::Reserved;
        }
        if page.is_buddy() {
            return PageCategory::Buddy;
        }
        if page.is_slab(bits) {
            return if page.is_reclaimable_slab() {
                PageCategory::ReclaimableSlab
            } else {
                PageCategory::UnreclaimableSlab
            };
        }
        if let Some(mops) = self.zsmalloc_mops {
            if page.mapping == mops.wrapping_add(MappingFlags::MOVABLE.bits()) {
                return PageCategory::Zsmalloc;
            }
        }
        if page.is_lru(bits) || page.is_active(bits) || page.is_uptodate(bits) {
            return PageCategory::Lru;
        }
        if page.is_kmem() {
            return PageCategory::Kmem;
        }
        if page.refcount == 0 {
            return PageCategory::Unreferenced;
        }
        PageCategory::Other
    }
}

impl Taxonomy for FineTaxonomy {
    type Class = PageCategory;
    const SPANS_BLOCKS: bool = false;

    fn classify<P: PageMetadataProvider>(
        &self,
        provider: &P,
        pfn: u64,
    ) -> ScanResult<Classified<PageCategory>> {
        let page = provider.page(pfn)?;
        let class = self.category(&page);
        let nr_pages = match class {
            PageCategory::Buddy => order_run(page.buddy_order_unsafe(), &self.geometry),
            PageCategory::Reserved => 1,
            _ => {
                let nr = provider.compound_frame_count(pfn)?;
                if nr > self.geometry.pageblock_nr_pages() {
                    error!("{}: bogus compound size {}", pfn, nr);
                    error!("{:?}", page);
                    return Err(ScanError::BogusCompoundSize {
                        pfn,
                        nr_pages: nr,
                        page,
                    });
                }
                nr.max(1)
            }
        };
        Ok(Classified { class, nr_pages })
    }

    fn label(class: PageCategory) -> &'static str {
        class.name()
    }
}
