//! Page metadata provider
//!
//! The scanner's only window into the kernel image. Implementations resolve
//! `mem_section`, `struct page` and slab cache descriptors however the
//! surrounding tool models kernel objects; the scanner only asks questions
//! keyed by PFN.

use crate::page::PageFrame;
use crate::ScanResult;

/// Read-only access to a kernel's page frame metadata.
///
/// Reads of a live kernel race with the kernel itself. Implementations
/// should return whatever they observe; the scanner clamps every derived
/// run length to structural bounds.
pub trait PageMetadataProvider {
    /// One past the highest PFN backed by memory (`max_pfn`).
    fn max_pfn(&self) -> u64;

    /// Whether `pfn` lies in a valid, online, populated (sub)section.
    fn is_valid_online_section(&self, pfn: u64) -> bool;

    /// Raw migratetype tag of the pageblock containing `pfn`.
    fn section_migratetype(&self, pfn: u64) -> u8;

    /// Snapshot of the `struct page` for `pfn`.
    fn page(&self, pfn: u64) -> ScanResult<PageFrame>;

    /// `compound_nr()`: frames covered by the compound page at `pfn`,
    /// 1 for anything that is not a compound head.
    fn compound_frame_count(&self, pfn: u64) -> ScanResult<u64>;
}

impl<P: PageMetadataProvider + ?Sized> PageMetadataProvider for &P {
    fn max_pfn(&self) -> u64 {
        (**self).max_pfn()
    }

    fn is_valid_online_section(&self, pfn: u64) -> bool {
        (**self).is_valid_online_section(pfn)
    }

    fn section_migratetype(&self, pfn: u64) -> u8 {
        (**self).section_migratetype(pfn)
    }

    fn page(&self, pfn: u64) -> ScanResult<PageFrame> {
        (**self).page(pfn)
    }

    fn compound_frame_count(&self, pfn: u64) -> ScanResult<u64> {
        (**self).compound_frame_count(pfn)
    }
}
