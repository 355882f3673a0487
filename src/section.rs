//! Sparse memory section descriptor
//!
//! Decodes one `struct mem_section` (with its `mem_section_usage`) as
//! copied out of the scanned kernel.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::layout::{extract_field, Geometry, BITS_PER_LONG};

bitflags! {
    /// Flag bits encoded in the low end of `section_mem_map`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u64 {
        const MARKED_PRESENT = 1 << 0;
        const HAS_MEM_MAP = 1 << 1;
        const IS_ONLINE = 1 << 2;
        const IS_EARLY = 1 << 3;
    }
}

/// A section's map flags, subsection presence word and pageblock bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDescriptor {
    pub section_mem_map: u64,
    pub subsection_map: u64,
    pub pageblock_flags: Vec<u64>,
}

impl SectionDescriptor {
    /// An online section with every subsection present and every
    /// pageblock tagged 0.
    pub fn online(geometry: &Geometry) -> Self {
        let subsections = geometry.pages_per_section() / geometry.pages_per_subsection();
        let subsection_map = if subsections >= BITS_PER_LONG as u64 {
            u64::MAX
        } else {
            (1u64 << subsections) - 1
        };
        Self {
            section_mem_map: (SectionFlags::MARKED_PRESENT
                | SectionFlags::HAS_MEM_MAP
                | SectionFlags::IS_ONLINE)
                .bits(),
            subsection_map,
            pageblock_flags: vec![0; geometry.pageblock_bitmap_words()],
        }
    }

    #[inline]
    fn flags(&self) -> SectionFlags {
        SectionFlags::from_bits_truncate(self.section_mem_map)
    }

    /// `valid_section()`: the section has a memory map.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.flags().contains(SectionFlags::HAS_MEM_MAP)
    }

    /// `online_section()`
    #[inline]
    pub fn is_online(&self) -> bool {
        self.flags().contains(SectionFlags::IS_ONLINE)
    }

    /// Whether the subsection holding `pfn` is populated.
    #[inline]
    pub fn subsection_present(&self, geometry: &Geometry, pfn: u64) -> bool {
        let idx = geometry.subsection_index(pfn);
        idx < BITS_PER_LONG && self.subsection_map & (1 << idx) != 0
    }

    /// Valid, online and backed by a present subsection.
    pub fn pfn_online(&self, geometry: &Geometry, pfn: u64) -> bool {
        self.is_valid() && self.is_online() && self.subsection_present(geometry, pfn)
    }

    /// Raw migratetype tag of the pageblock holding `pfn`.
    ///
    /// A truncated bitmap reads as tag 0.
    pub fn migratetype(&self, geometry: &Geometry, pfn: u64) -> u8 {
        extract_field(
            &self.pageblock_flags,
            geometry.pageblock_bit_index(pfn),
            geometry.migratetype_bits,
        )
        .unwrap_or(0) as u8
    }

    /// Overwrite the migratetype bits of the pageblock holding `pfn`.
    pub fn set_migratetype(&mut self, geometry: &Geometry, pfn: u64, tag: u8) {
        let bit_index = geometry.pageblock_bit_index(pfn);
        let word_idx = (bit_index / BITS_PER_LONG as u64) as usize;
        let shift = bit_index & (BITS_PER_LONG as u64 - 1);
        let mask = ((1u64 << geometry.migratetype_bits) - 1) << shift;
        if let Some(word) = self.pageblock_flags.get_mut(word_idx) {
            *word = (*word & !mask) | (((tag as u64) << shift) & mask);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_section() {
        let g = Geometry::REFERENCE;
        let section = SectionDescriptor::online(&g);
        assert!(section.is_valid());
        assert!(section.is_online());
        assert!(section.pfn_online(&g, 0));
        assert!(section.pfn_online(&g, 32767));
        assert_eq!(section.pageblock_flags.len(), 4);
    }

    #[test]
    fn test_missing_subsection() {
        let g = Geometry::REFERENCE;
        let mut section = SectionDescriptor::online(&g);
        section.subsection_map &= !(1 << 3);
        assert!(section.pfn_online(&g, 2 * 512));
        assert!(!section.pfn_online(&g, 3 * 512));
        assert!(!section.pfn_online(&g, 3 * 512 + 511));
    }

    #[test]
    fn test_offline_flags() {
        let g = Geometry::REFERENCE;
        let mut section = SectionDescriptor::online(&g);
        section.section_mem_map &= !SectionFlags::IS_ONLINE.bits();
        assert!(section.is_valid());
        assert!(!section.pfn_online(&g, 0));

        section.section_mem_map = SectionFlags::IS_ONLINE.bits();
        assert!(!section.is_valid());
        assert!(!section.pfn_online(&g, 0));
    }

    #[test]
    fn test_migratetype_roundtrip_keeps_neighbours() {
        let g = Geometry::REFERENCE;
        let mut section = SectionDescriptor::online(&g);
        // skip bit (bit 3 of each 4-bit tag) must survive
        section.pageblock_flags[0] = 0x8 << 4;
        section.set_migratetype(&g, 512, 2);
        section.set_migratetype(&g, 1024, 1);
        assert_eq!(section.migratetype(&g, 0), 0);
        assert_eq!(section.migratetype(&g, 700), 2);
        assert_eq!(section.migratetype(&g, 1024), 1);
        assert_eq!(section.pageblock_flags[0] & (0x8 << 4), 0x8 << 4);
        // pageblock 63 is the last tag of word 3
        section.set_migratetype(&g, 63 * 512, 5);
        assert_eq!(section.pageblock_flags[3] >> 60, 5);
    }
}
