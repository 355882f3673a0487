//! Buddy-pair region coalescing
//!
//! Rebuilds, one order at a time, the set of naturally aligned regions that
//! are entirely movable (or entirely free). A region of order `k + 1` exists
//! exactly when both order-`k` halves exist, mirroring how the buddy
//! allocator merges a block with its buddy.

use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::warn;

use crate::is_aligned;
use crate::layout::Geometry;

/// log2 of the largest region reported (1 GiB).
pub const GIGANTIC_SHIFT: u32 = 30;

/// Order of a 1 GiB region in `geometry`.
#[inline]
pub const fn gigantic_order(geometry: &Geometry) -> u32 {
    GIGANTIC_SHIFT - geometry.page_shift
}

/// Sorted, duplicate-free starts of aligned regions of one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSet {
    order: u32,
    pfns: Vec<u64>,
}

impl RegionSet {
    /// Collect region starts of `order`. Starts not aligned to the order
    /// are discarded.
    pub fn from_pfns(order: u32, pfns: impl IntoIterator<Item = u64>) -> Self {
        let size = 1u64 << order;
        let mut pfns: Vec<u64> = pfns
            .into_iter()
            .filter(|&pfn| {
                let aligned = is_aligned(pfn, size);
                if !aligned {
                    warn!("order {} region start {} is not aligned, ignored", order, pfn);
                }
                aligned
            })
            .collect();
        pfns.sort_unstable();
        pfns.dedup();
        Self { order, pfns }
    }

    #[inline]
    pub fn order(&self) -> u32 {
        self.order
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pfns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pfns.is_empty()
    }

    pub fn pfns(&self) -> &[u64] {
        &self.pfns
    }

    #[inline]
    pub fn contains(&self, pfn: u64) -> bool {
        self.pfns.binary_search(&pfn).is_ok()
    }

    /// Regions of the next order: every pair whose lower half and buddy
    /// are both present.
    pub fn coalesce(&self) -> Self {
        let size = 1u64 << self.order;
        let mut next = Vec::with_capacity(self.pfns.len() / 2);
        for &pfn in &self.pfns {
            let buddy = pfn ^ size;
            if buddy > pfn && self.contains(buddy) {
                next.push(pfn & buddy);
            }
        }
        // lower halves are visited in ascending order, so `next` stays sorted
        Self {
            order: self.order + 1,
            pfns: next,
        }
    }
}

/// Region sets from a starting order up to a final order, inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescedRegions {
    levels: Vec<RegionSet>,
}

impl CoalescedRegions {
    /// Coalesce `base` repeatedly until `max_order` is reached.
    pub fn build(base: RegionSet, max_order: u32) -> Self {
        let mut levels = Vec::new();
        let mut current = base;
        while current.order() < max_order {
            let next = current.coalesce();
            levels.push(current);
            current = next;
        }
        levels.push(current);
        Self { levels }
    }

    pub fn levels(&self) -> &[RegionSet] {
        &self.levels
    }

    pub fn level(&self, order: u32) -> Option<&RegionSet> {
        self.levels.iter().find(|set| set.order() == order)
    }

    /// `(order, region count)` for every level, ascending.
    pub fn counts(&self) -> Vec<(u32, usize)> {
        self.levels.iter().map(|set| (set.order(), set.len())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_from_pfns_sorts_and_dedups() {
        let set = RegionSet::from_pfns(9, [1024, 0, 512, 512, 700]);
        assert_eq!(set.pfns(), &[0, 512, 1024]);
        assert!(set.contains(512));
        assert!(!set.contains(700));
    }

    #[test]
    fn test_coalesce_pairs_only_buddies() {
        // 512 and 1024 are adjacent but not buddies
        let set = RegionSet::from_pfns(9, [512, 1024]);
        assert!(set.coalesce().is_empty());

        let set = RegionSet::from_pfns(9, [0, 512, 1024, 2048, 2560]);
        let next = set.coalesce();
        assert_eq!(next.order(), 10);
        assert_eq!(next.pfns(), &[0, 2048]);
        let next = next.coalesce();
        assert_eq!(next.order(), 11);
        assert!(next.is_empty());
    }

    #[test]
    fn test_build_full_gigabyte() {
        let pfns = (0..512u64).map(|i| i * 512);
        let regions = CoalescedRegions::build(RegionSet::from_pfns(9, pfns), 18);
        let counts = regions.counts();
        assert_eq!(counts.len(), 10);
        assert_eq!(counts[0], (9, 512));
        assert_eq!(counts[9], (18, 1));
        for pair in counts.windows(2) {
            assert!(pair[1].1 <= pair[0].1 / 2);
        }
    }

    #[test]
    fn test_higher_order_regions_have_both_halves() {
        let pfns = vec![0, 512, 1536, 2048, 2560, 3072, 3584, 8192];
        let regions = CoalescedRegions::build(RegionSet::from_pfns(9, pfns), 12);
        for pair in regions.levels().windows(2) {
            let (lower, upper) = (&pair[0], &pair[1]);
            let half = 1u64 << lower.order();
            for &pfn in upper.pfns() {
                assert!(lower.contains(pfn));
                assert!(lower.contains(pfn + half));
            }
        }
        assert_eq!(regions.level(11).unwrap().pfns(), &[2048]);
    }

    #[test]
    fn test_gigantic_order() {
        assert_eq!(gigantic_order(&Geometry::REFERENCE), 18);
    }
}
