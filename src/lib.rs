//! Pageblock fragmentation scanner
//!
//! This crate walks the page frame space of a kernel memory snapshot and
//! measures how well the movable/unmovable partitioning holds up,
//! featuring:
//! - Coarse (movable/unmovable/free/reserved) and fine (nine category)
//!   page classification
//! - Per-pageblock aggregation with migratetype cross-tabulation
//! - Buddy-pair coalescing of movable and free regions from 2MB to 1GB
//! - Percentile statistics over unmovable-bearing pageblocks
//!
//! Kernel data structures are reached only through a
//! [`PageMetadataProvider`]; the scanner never writes to the snapshot.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

use core::fmt;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// The error type used by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanError {
    /// A compound page claims more frames than one pageblock can hold.
    BogusCompoundSize {
        pfn: u64,
        nr_pages: u64,
        page: PageFrame,
    },
    /// Movable plus unmovable pages exceed the pageblock size.
    NegativeFreePages {
        block_pfn: u64,
        movable: u64,
        unmovable: u64,
    },
    /// Layout constants are inconsistent with each other.
    InvalidGeometry,
    /// The provider has no metadata for a frame inside an online section.
    Unreadable { pfn: u64 },
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BogusCompoundSize { pfn, nr_pages, page } => write!(
                f,
                "{}: bogus compound size {} (flags={:#x} head={:#x} refcount={})",
                pfn, nr_pages, page.flags, page.compound_head, page.refcount
            ),
            Self::NegativeFreePages {
                block_pfn,
                movable,
                unmovable,
            } => write!(
                f,
                "pageblock {}: movable {} + unmovable {} exceed the block size",
                block_pfn, movable, unmovable
            ),
            Self::InvalidGeometry => write!(f, "inconsistent memory layout constants"),
            Self::Unreadable { pfn } => write!(f, "{}: page metadata unreadable", pfn),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ScanError {}

/// A [`Result`] type with [`ScanError`] as the error type.
pub type ScanResult<T = ()> = Result<T, ScanError>;

#[inline]
const fn align_down(pos: u64, align: u64) -> u64 {
    pos & !(align - 1)
}

/// Rounds `pos + 1` up to the next multiple of `align`.
///
/// This is the "next boundary strictly after `pos`" used by the walker.
#[inline]
const fn next_boundary(pos: u64, align: u64) -> u64 {
    align_down(pos + align, align)
}

/// Checks whether the PFN has the demanded alignment.
///
/// Equivalent to `pfn % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(pfn: u64, align: u64) -> bool {
    pfn & (align - 1) == 0
}

pub mod layout;
pub use layout::{extract_field, Geometry, MigratetypeTable, PageFlagBits};

pub mod page;
pub use page::{Migratetype, PageFrame};

pub mod section;
pub use section::SectionDescriptor;

pub mod provider;
pub use provider::PageMetadataProvider;

pub mod snapshot;
pub use snapshot::SnapshotProvider;

pub mod classify;
pub use classify::{CoarseClass, CoarseTaxonomy, FineTaxonomy, PageCategory, Taxonomy};

pub mod walker;
pub use walker::{BlockContent, BlockScan, PageRun, PfnWalker};

pub mod aggregate;
pub use aggregate::{BlockSample, CategoryCounts, CoarseAggregator, FineAggregator};

pub mod coalesce;
pub use coalesce::{CoalescedRegions, RegionSet};

pub mod stats;
pub use stats::{percentile, PercentileSummary, StatsReporter};

pub mod boundary;
pub use boundary::HostBoundary;

pub mod scan;
pub use scan::{scan_coarse, scan_fine, CoarseReport, DumpPolicy, FineReport, ScanOptions};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_boundary() {
        assert_eq!(next_boundary(0, 512), 512);
        assert_eq!(next_boundary(511, 512), 512);
        assert_eq!(next_boundary(512, 512), 1024);
        assert_eq!(next_boundary(1000, 1024), 1024);
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_down(1023, 512), 512);
        assert!(is_aligned(2048, 1024));
        assert!(!is_aligned(1536, 1024));
    }
}
