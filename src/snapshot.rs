//! In-memory snapshot provider
//!
//! A sparse copy of the section table and of the `struct page`s that
//! differ from a zeroed page. A dump reader fills one through
//! [`SnapshotProvider::insert_section`] and [`SnapshotProvider::set_page`];
//! the remaining builders make it the fixture for scenario tests.

use alloc::collections::BTreeMap;

#[cfg(feature = "log")]
use log::warn;

use crate::layout::{Geometry, PageFlagBits};
use crate::page::{PageFrame, PAGE_TYPE_BASE, PG_BUDDY};
use crate::provider::PageMetadataProvider;
use crate::section::SectionDescriptor;
use crate::{ScanError, ScanResult};

/// Fake `vmemmap` base used to fill `compound_head` back-references.
const VMEMMAP_BASE: u64 = 0xffff_ea00_0000_0000;
/// `sizeof(struct page)`
const STRUCT_PAGE_SIZE: u64 = 64;

pub struct SnapshotProvider {
    geometry: Geometry,
    flag_bits: PageFlagBits,
    max_pfn: u64,
    sections: BTreeMap<u64, SectionDescriptor>,
    pages: BTreeMap<u64, PageFrame>,
}

impl SnapshotProvider {
    /// Create an empty snapshot: no sections, every page zeroed.
    pub fn new(geometry: Geometry, flag_bits: PageFlagBits, max_pfn: u64) -> Self {
        Self {
            geometry,
            flag_bits,
            max_pfn,
            sections: BTreeMap::new(),
            pages: BTreeMap::new(),
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn flag_bits(&self) -> &PageFlagBits {
        &self.flag_bits
    }

    /// Install a section descriptor, replacing any previous one.
    pub fn insert_section(&mut self, section_nr: u64, section: SectionDescriptor) {
        self.sections.insert(section_nr, section);
    }

    pub fn section(&self, section_nr: u64) -> Option<&SectionDescriptor> {
        self.sections.get(&section_nr)
    }

    pub fn section_mut(&mut self, section_nr: u64) -> Option<&mut SectionDescriptor> {
        self.sections.get_mut(&section_nr)
    }

    /// Mark every section overlapping `[start_pfn, end_pfn)` online.
    pub fn online_range(&mut self, start_pfn: u64, end_pfn: u64) {
        if start_pfn >= end_pfn {
            return;
        }
        let first = self.geometry.section_nr(start_pfn);
        let last = self.geometry.section_nr(end_pfn - 1);
        for nr in first..=last {
            let geometry = self.geometry;
            self.sections
                .entry(nr)
                .or_insert_with(|| SectionDescriptor::online(&geometry));
        }
    }

    /// Tag the pageblock holding `pfn`. Ignored for a missing section.
    pub fn set_migratetype(&mut self, pfn: u64, tag: u8) {
        let geometry = self.geometry;
        match self.sections.get_mut(&geometry.section_nr(pfn)) {
            Some(section) => section.set_migratetype(&geometry, pfn, tag),
            None => {
                warn!("snapshot: no section for pfn {}, migratetype dropped", pfn);
            }
        }
    }

    pub fn set_page(&mut self, pfn: u64, page: PageFrame) {
        if page == PageFrame::default() {
            self.pages.remove(&pfn);
        } else {
            self.pages.insert(pfn, page);
        }
    }

    /// Store `page` at every PFN in `[start_pfn, start_pfn + count)`.
    pub fn fill(&mut self, start_pfn: u64, count: u64, page: PageFrame) {
        for pfn in start_pfn..start_pfn + count {
            self.set_page(pfn, page);
        }
    }

    /// Put a free buddy block of `order` at `pfn`.
    pub fn add_buddy(&mut self, pfn: u64, order: u32) {
        let head = PageFrame {
            page_type: !PG_BUDDY & (PAGE_TYPE_BASE | 0x0FFF_FFFF),
            private: order as u64,
            ..Default::default()
        };
        self.set_page(pfn, head);
        for tail in pfn + 1..pfn + (1 << order) {
            self.set_page(tail, PageFrame::default());
        }
    }

    /// Put a compound page of `order` at `pfn`, head described by `head`.
    ///
    /// The head flag and the compound order are set on the head; tails get
    /// a tagged back-reference to it.
    pub fn add_compound(&mut self, pfn: u64, order: u32, head: PageFrame) {
        let head_page = PageFrame {
            flags: head.flags | PageFlagBits::mask(self.flag_bits.head),
            compound_order: order as u8,
            ..head
        };
        self.set_page(pfn, head_page);
        let back_ref = (VMEMMAP_BASE + pfn * STRUCT_PAGE_SIZE) | 1;
        for tail in pfn + 1..pfn + (1 << order) {
            self.set_page(
                tail,
                PageFrame {
                    compound_head: back_ref,
                    ..Default::default()
                },
            );
        }
    }
}

impl PageMetadataProvider for SnapshotProvider {
    fn max_pfn(&self) -> u64 {
        self.max_pfn
    }

    fn is_valid_online_section(&self, pfn: u64) -> bool {
        self.sections
            .get(&self.geometry.section_nr(pfn))
            .is_some_and(|s| s.pfn_online(&self.geometry, pfn))
    }

    fn section_migratetype(&self, pfn: u64) -> u8 {
        self.sections
            .get(&self.geometry.section_nr(pfn))
            .map_or(0, |s| s.migratetype(&self.geometry, pfn))
    }

    fn page(&self, pfn: u64) -> ScanResult<PageFrame> {
        if pfn >= self.max_pfn || !self.sections.contains_key(&self.geometry.section_nr(pfn)) {
            return Err(ScanError::Unreadable { pfn });
        }
        Ok(self.pages.get(&pfn).copied().unwrap_or_default())
    }

    fn compound_frame_count(&self, pfn: u64) -> ScanResult<u64> {
        let page = self.page(pfn)?;
        if page.is_head(&self.flag_bits) {
            // a torn order saturates so the caller sees an oversized run
            Ok(1u64
                .checked_shl(page.compound_order as u32)
                .unwrap_or(u64::MAX))
        } else {
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> SnapshotProvider {
        let mut snap = SnapshotProvider::new(Geometry::REFERENCE, PageFlagBits::LINUX_6_1, 65536);
        snap.online_range(0, 32768);
        snap
    }

    #[test]
    fn test_online_and_offline_sections() {
        let snap = snapshot();
        assert!(snap.is_valid_online_section(0));
        assert!(snap.is_valid_online_section(32767));
        assert!(!snap.is_valid_online_section(32768));
        assert_eq!(snap.page(40000), Err(ScanError::Unreadable { pfn: 40000 }));
        assert_eq!(snap.page(70000), Err(ScanError::Unreadable { pfn: 70000 }));
    }

    #[test]
    fn test_buddy_builder() {
        let mut snap = snapshot();
        snap.add_buddy(1024, 10);
        let head = snap.page(1024).unwrap();
        assert!(head.is_buddy());
        assert_eq!(head.buddy_order_unsafe(), 10);
        assert!(!snap.page(1025).unwrap().is_buddy());
    }

    #[test]
    fn test_compound_builder() {
        let mut snap = snapshot();
        let bits = PageFlagBits::LINUX_6_1;
        let lru = PageFrame {
            flags: PageFlagBits::mask(bits.lru),
            refcount: 1,
            ..Default::default()
        };
        snap.add_compound(512, 9, lru);
        assert_eq!(snap.compound_frame_count(512), Ok(512));
        assert_eq!(snap.compound_frame_count(513), Ok(1));
        let head = snap.page(512).unwrap();
        assert!(head.is_lru(&bits));
        assert!(snap.page(600).unwrap().is_compound(&bits));
    }

    #[test]
    fn test_torn_compound_order_saturates() {
        let mut snap = snapshot();
        let bits = PageFlagBits::LINUX_6_1;
        snap.set_page(
            3,
            PageFrame {
                flags: PageFlagBits::mask(bits.head),
                compound_order: 200,
                ..Default::default()
            },
        );
        assert_eq!(snap.compound_frame_count(3), Ok(u64::MAX));
    }

    #[test]
    fn test_set_migratetype() {
        let mut snap = snapshot();
        snap.set_migratetype(512, 1);
        assert_eq!(snap.section_migratetype(0), 0);
        assert_eq!(snap.section_migratetype(1000), 1);
        // missing section: dropped, reads as 0
        snap.set_migratetype(40000, 2);
        assert_eq!(snap.section_migratetype(40000), 0);
    }
}
