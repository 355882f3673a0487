//! Page frame metadata
//!
//! A read-only copy of the `struct page` fields the classifiers look at,
//! and the predicates the kernel itself uses to interpret them.

use core::fmt;

use bitflags::bitflags;

use crate::layout::PageFlagBits;

/// `page_type` values are stored inverted below this base.
pub const PAGE_TYPE_BASE: u32 = 0xF000_0000;
/// `page_type` bit cleared while the page sits on a buddy free list.
pub const PG_BUDDY: u32 = 0x0000_0080;

bitflags! {
    /// Tag bits in the low end of `page->mapping`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u64 {
        const ANON = 1 << 0;
        const MOVABLE = 1 << 1;
    }
}

bitflags! {
    /// Tag bits in the low end of `page->memcg_data`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemcgFlags: u64 {
        const OBJCGS = 1 << 0;
        const KMEM = 1 << 1;
    }
}

bitflags! {
    /// GFP bits recorded in a slab cache's `allocflags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GfpFlags: u32 {
        const RECLAIMABLE = 0x10;
    }
}

/// Snapshot of one `struct page`.
///
/// `compound_order` is the order stored in the first tail page and is only
/// meaningful on a head page. `slab_allocflags` is present only for slab
/// pages whose cache descriptor could be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFrame {
    pub flags: u64,
    pub page_type: u32,
    pub mapping: u64,
    pub private: u64,
    pub compound_head: u64,
    pub compound_order: u8,
    pub refcount: i32,
    pub memcg_data: u64,
    pub slab_allocflags: Option<u32>,
}

impl PageFrame {
    #[inline]
    fn test_bit(&self, bit: u32) -> bool {
        let mask = PageFlagBits::mask(bit);
        self.flags & mask == mask
    }

    /// Free page owned by the buddy allocator.
    #[inline]
    pub fn is_buddy(&self) -> bool {
        self.page_type & (PAGE_TYPE_BASE | PG_BUDDY) == PAGE_TYPE_BASE
    }

    /// Order of a free buddy page, read without any locking.
    #[inline]
    pub fn buddy_order_unsafe(&self) -> u64 {
        self.private
    }

    #[inline]
    pub fn is_reserved(&self, bits: &PageFlagBits) -> bool {
        self.test_bit(bits.reserved)
    }

    #[inline]
    pub fn is_head(&self, bits: &PageFlagBits) -> bool {
        self.test_bit(bits.head)
    }

    /// Head or tail of a compound page.
    #[inline]
    pub fn is_compound(&self, bits: &PageFlagBits) -> bool {
        self.is_head(bits) || self.compound_head & 1 != 0
    }

    /// Compound order; zero for tail pages and ordinary pages.
    #[inline]
    pub fn compound_order(&self, bits: &PageFlagBits) -> u32 {
        if self.is_head(bits) {
            self.compound_order as u32
        } else {
            0
        }
    }

    #[inline]
    pub fn is_lru(&self, bits: &PageFlagBits) -> bool {
        self.test_bit(bits.lru)
    }

    #[inline]
    pub fn is_active(&self, bits: &PageFlagBits) -> bool {
        self.test_bit(bits.active)
    }

    #[inline]
    pub fn is_uptodate(&self, bits: &PageFlagBits) -> bool {
        self.test_bit(bits.uptodate)
    }

    #[inline]
    pub fn is_slab(&self, bits: &PageFlagBits) -> bool {
        self.test_bit(bits.slab)
    }

    /// Non-LRU movable page (`__PageMovable`).
    #[inline]
    pub fn is_movable_mapping(&self) -> bool {
        MappingFlags::from_bits_truncate(self.mapping) & MappingFlags::all()
            == MappingFlags::MOVABLE
    }

    /// Kernel memory charged to a memory cgroup.
    #[inline]
    pub fn is_kmem(&self) -> bool {
        MemcgFlags::from_bits_truncate(self.memcg_data).contains(MemcgFlags::KMEM)
    }

    /// Slab page whose cache was created with `__GFP_RECLAIMABLE`.
    #[inline]
    pub fn is_reclaimable_slab(&self) -> bool {
        self.slab_allocflags
            .map(GfpFlags::from_bits_truncate)
            .is_some_and(|f| f.contains(GfpFlags::RECLAIMABLE))
    }
}

/// Declared intent of a pageblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Migratetype {
    Unmovable,
    Movable,
    Reclaimable,
    HighAtomic,
    Free,
    Cma,
    Isolate,
    Unknown(u8),
}

impl Migratetype {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Unmovable => "unmovable",
            Self::Movable => "movable",
            Self::Reclaimable => "reclaimable",
            Self::HighAtomic => "highatomic",
            Self::Free => "free",
            Self::Cma => "cma",
            Self::Isolate => "isolate",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for Migratetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(tag) => write!(f, "unknown({})", tag),
            other => f.write_str(other.name()),
        }
    }
}
