//! Memory layout constants
//!
//! Geometry of the scanned kernel (page, pageblock, section and buddy
//! sizes), the version-dependent page flag bit numbers, and the bitmap
//! field reader shared by every bit-packed kernel structure.

use crate::coalesce::GIGANTIC_SHIFT;
use crate::page::Migratetype;
use crate::{ScanError, ScanResult};

/// Width of one bitmap word in the scanned kernel.
pub const BITS_PER_LONG: u32 = 64;

/// Number of distinct migratetype tags representable in a pageblock.
pub const MAX_MIGRATETYPE_TAGS: usize = 8;

/// Reads a `width`-bit field starting at `bit_index` from a word bitmap.
///
/// Fields never straddle a word boundary: the scanned kernel sizes its
/// per-block tags so that they divide [`BITS_PER_LONG`]. Returns `None`
/// when the word lies outside the bitmap.
#[inline]
pub fn extract_field(bitmap: &[u64], bit_index: u64, width: u32) -> Option<u64> {
    let word_idx = (bit_index / BITS_PER_LONG as u64) as usize;
    let shift = bit_index & (BITS_PER_LONG as u64 - 1);
    let mask = if width >= BITS_PER_LONG {
        u64::MAX
    } else {
        (1u64 << width) - 1
    };
    bitmap.get(word_idx).map(|word| (word >> shift) & mask)
}

/// Fixed geometry of the scanned kernel's physical memory model.
///
/// All values are shifts or orders; sizes are derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// log2 of the page size in bytes.
    pub page_shift: u32,
    /// log2 of the number of pages in one pageblock.
    pub pageblock_order: u32,
    /// log2 of the byte size of one sparse memory section.
    pub section_size_bits: u32,
    /// Buddy allocator `MAX_ORDER`; the largest free block has order
    /// `max_order - 1`.
    pub max_order: u32,
    /// Bits reserved per pageblock in the section's pageblock flags bitmap
    /// (`NR_PAGEBLOCK_BITS`).
    pub nr_pageblock_bits: u32,
    /// Bits of the per-block tag holding the migratetype.
    pub migratetype_bits: u32,
    /// log2 of the byte size of one subsection.
    pub subsection_shift: u32,
}

impl Geometry {
    /// x86-64 with 4K pages, 2M pageblocks and 128M sections.
    pub const REFERENCE: Self = Self {
        page_shift: 12,
        pageblock_order: 9,
        section_size_bits: 27,
        max_order: 11,
        nr_pageblock_bits: 4,
        migratetype_bits: 3,
        subsection_shift: 21,
    };

    /// Check the constants against each other.
    pub fn validate(&self) -> ScanResult {
        // Region orders are counted up to 1 GiB, so a page must be smaller.
        if self.page_shift >= GIGANTIC_SHIFT {
            return Err(ScanError::InvalidGeometry);
        }
        let pfn_section_shift = self
            .section_size_bits
            .checked_sub(self.page_shift)
            .ok_or(ScanError::InvalidGeometry)?;
        if self.max_order == 0 || pfn_section_shift >= BITS_PER_LONG {
            return Err(ScanError::InvalidGeometry);
        }
        // A max-order free block must still fit in a section and cover a pageblock.
        if self.pageblock_order > self.max_order - 1 || self.max_order - 1 > pfn_section_shift {
            return Err(ScanError::InvalidGeometry);
        }
        if self.subsection_shift < self.page_shift
            || self.subsection_shift > self.section_size_bits
        {
            return Err(ScanError::InvalidGeometry);
        }
        // At most 64 subsections: presence is read from a single word.
        if pfn_section_shift - (self.subsection_shift - self.page_shift) > 6 {
            return Err(ScanError::InvalidGeometry);
        }
        if self.nr_pageblock_bits == 0
            || BITS_PER_LONG % self.nr_pageblock_bits != 0
            || self.migratetype_bits == 0
            || self.migratetype_bits > self.nr_pageblock_bits
            || (1usize << self.migratetype_bits) > MAX_MIGRATETYPE_TAGS
        {
            return Err(ScanError::InvalidGeometry);
        }
        Ok(())
    }

    #[inline]
    pub const fn page_size(&self) -> u64 {
        1 << self.page_shift
    }

    #[inline]
    pub const fn pageblock_nr_pages(&self) -> u64 {
        1 << self.pageblock_order
    }

    #[inline]
    pub const fn pfn_section_shift(&self) -> u32 {
        self.section_size_bits - self.page_shift
    }

    #[inline]
    pub const fn pages_per_section(&self) -> u64 {
        1 << self.pfn_section_shift()
    }

    /// Frames in the largest buddy block (`MAX_ORDER_NR_PAGES`).
    #[inline]
    pub const fn max_order_nr_pages(&self) -> u64 {
        1 << (self.max_order - 1)
    }

    #[inline]
    pub const fn pages_per_subsection(&self) -> u64 {
        1 << (self.subsection_shift - self.page_shift)
    }

    #[inline]
    pub const fn section_nr(&self, pfn: u64) -> u64 {
        pfn >> self.pfn_section_shift()
    }

    /// First PFN of the section containing `pfn`.
    #[inline]
    pub const fn section_start(&self, pfn: u64) -> u64 {
        pfn & !(self.pages_per_section() - 1)
    }

    /// Index of the subsection holding `pfn` within its section.
    #[inline]
    pub const fn subsection_index(&self, pfn: u64) -> u32 {
        ((pfn & (self.pages_per_section() - 1)) / self.pages_per_subsection()) as u32
    }

    /// Bit index of the pageblock tag for `pfn` inside its section's bitmap.
    #[inline]
    pub const fn pageblock_bit_index(&self, pfn: u64) -> u64 {
        ((pfn & (self.pages_per_section() - 1)) >> self.pageblock_order)
            * self.nr_pageblock_bits as u64
    }

    /// Pageblocks per section.
    #[inline]
    pub const fn pageblocks_per_section(&self) -> u64 {
        self.pages_per_section() >> self.pageblock_order
    }

    /// Words of pageblock flags bitmap needed for one section.
    #[inline]
    pub const fn pageblock_bitmap_words(&self) -> usize {
        let bits = self.pageblocks_per_section() * self.nr_pageblock_bits as u64;
        bits.div_ceil(BITS_PER_LONG as u64) as usize
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::REFERENCE
    }
}

/// Bit numbers of the `page->flags` bits the classifiers test.
///
/// These move between kernel versions and configurations; the defaults
/// are those of a 6.1 x86-64 kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlagBits {
    pub uptodate: u32,
    pub lru: u32,
    pub active: u32,
    pub slab: u32,
    pub reserved: u32,
    pub head: u32,
}

impl PageFlagBits {
    pub const LINUX_6_1: Self = Self {
        uptodate: 2,
        lru: 4,
        active: 5,
        slab: 9,
        reserved: 12,
        head: 16,
    };

    #[inline]
    pub const fn mask(bit: u32) -> u64 {
        1 << bit
    }
}

impl Default for PageFlagBits {
    fn default() -> Self {
        Self::LINUX_6_1
    }
}

/// Which optional migratetypes the scanned kernel defines.
///
/// The raw tag numbering shifts depending on these, so decoding a tag to a
/// [`Migratetype`] needs to know them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigratetypeTable {
    pub highatomic: bool,
    pub free: bool,
}

impl MigratetypeTable {
    pub const fn new(highatomic: bool, free: bool) -> Self {
        Self { highatomic, free }
    }

    /// Decode a raw pageblock tag.
    pub fn decode(&self, tag: u8) -> Migratetype {
        let mut order: [Option<Migratetype>; MAX_MIGRATETYPE_TAGS] = [None; MAX_MIGRATETYPE_TAGS];
        let mut n = 0;
        let mut push = |mt: Migratetype| {
            order[n] = Some(mt);
            n += 1;
        };
        push(Migratetype::Unmovable);
        push(Migratetype::Movable);
        push(Migratetype::Reclaimable);
        if self.highatomic {
            push(Migratetype::HighAtomic);
        }
        if self.free {
            push(Migratetype::Free);
        }
        push(Migratetype::Cma);
        push(Migratetype::Isolate);

        order
            .get(tag as usize)
            .copied()
            .flatten()
            .unwrap_or(Migratetype::Unknown(tag))
    }

    /// Raw tag the scanned kernel uses for `mt`, if it defines it.
    pub fn encode(&self, mt: Migratetype) -> Option<u8> {
        (0..MAX_MIGRATETYPE_TAGS as u8).find(|&tag| self.decode(tag) == mt)
    }
}

impl Default for MigratetypeTable {
    fn default() -> Self {
        Self::new(true, false)
    }
}
