//! Statistics and reporting for pageblock scans
//!
//! Percentile summaries over unmovable-bearing blocks and the end-of-run
//! report lines.

use alloc::vec::Vec;
use core::fmt;

#[cfg(feature = "log")]
use log::info;

use crate::aggregate::BlockSample;
use crate::classify::PageCategory;
use crate::layout::{MigratetypeTable, MAX_MIGRATETYPE_TAGS};
use crate::scan::{CoarseReport, FineReport};

/// Percentile of an ascending slice by linear interpolation between the
/// floor and ceiling rank, truncated to an integer.
///
/// `p` is clamped to `[0, 1]`. Returns `None` for an empty slice.
pub fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let p = p.clamp(0.0, 1.0);
    let k = (sorted.len() - 1) as f64 * p;
    let f = k as usize;
    let c = if (f as f64) < k { f + 1 } else { f };
    if f == c {
        return Some(sorted[f]);
    }
    let d0 = sorted[f] as f64 * (c as f64 - k);
    let d1 = sorted[c] as f64 * (k - f as f64);
    Some((d0 + d1) as u64)
}

/// Median and 99th percentile of one sample array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PercentileSummary {
    pub p50: Option<u64>,
    pub p99: Option<u64>,
}

impl PercentileSummary {
    /// Sort `samples` and summarize them.
    pub fn from_samples(mut samples: Vec<u64>) -> Self {
        samples.sort_unstable();
        Self {
            p50: percentile(&samples, 0.50),
            p99: percentile(&samples, 0.99),
        }
    }
}

struct Maybe(Option<u64>);

impl fmt::Display for Maybe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{}", v),
            None => f.write_str("None"),
        }
    }
}

impl fmt::Display for PercentileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p50={} p99={}", Maybe(self.p50), Maybe(self.p99))
    }
}

/// Percentiles of the free, movable and unmovable page counts of
/// unmovable-bearing blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleStats {
    pub free: PercentileSummary,
    pub movable: PercentileSummary,
    pub unmovable: PercentileSummary,
}

impl SampleStats {
    pub fn from_samples(samples: &[BlockSample]) -> Self {
        Self {
            free: PercentileSummary::from_samples(samples.iter().map(|s| s.free).collect()),
            movable: PercentileSummary::from_samples(samples.iter().map(|s| s.movable).collect()),
            unmovable: PercentileSummary::from_samples(
                samples.iter().map(|s| s.unmovable).collect(),
            ),
        }
    }
}

/// Share of recorded blocks that hold unmovable pages.
pub fn unmovable_fraction(regular_blocks: u64, unmovable_blocks: u64) -> Option<f64> {
    let total = regular_blocks + unmovable_blocks;
    if total == 0 {
        None
    } else {
        Some(unmovable_blocks as f64 / total as f64)
    }
}

/// End-of-run report printer
pub struct StatsReporter;

impl StatsReporter {
    #[allow(unused_variables)]
    pub fn log_coarse(report: &CoarseReport, table: &MigratetypeTable) {
        for (order, count) in &report.movable_regions {
            info!("movable_order {} {}", order, count);
        }
        for (order, count) in &report.free_regions {
            info!("free_order {} {}", order, count);
        }
        info!("========================================");
        info!("  Regular blocks: {}", report.regular_blocks);
        info!("  Unmovable blocks: {}", report.unmovable_blocks);
        info!("  Dropped (reserved) blocks: {}", report.dropped_blocks);
        match report.unmovable_fraction {
            Some(fraction) => {
                info!("  Unmovable fraction: {:.6}", fraction);
            }
            None => {
                info!("  Unmovable fraction: None");
            }
        }
        info!("  Unmovable pages: {}", report.unmovable_pages);
        info!("  Free pages per unmovable block: {}", report.stats.free);
        info!("  Movable pages per unmovable block: {}", report.stats.movable);
        info!("  Unmovable pages per unmovable block: {}", report.stats.unmovable);
        Self::log_blocks_by_migratetype(&report.blocks_by_migratetype, table);
        info!("========================================");
    }

    #[allow(unused_variables)]
    pub fn log_fine(report: &FineReport, table: &MigratetypeTable) {
        Self::log_blocks_by_migratetype(&report.blocks_by_migratetype, table);

        let x = &report.slablru_in_unmovable;
        info!(
            "unmovable blocks with slab/lru pages: {} (slab={} lru={} pages)",
            x.blocks, x.slab, x.lru
        );
        let x = &report.nonlru_in_movable;
        info!(
            "movable blocks with non-LRU pages: {} (slab={} kmem={} other={} pages)",
            x.blocks, x.slab, x.kmem, x.other
        );
        let x = &report.nonslab_in_reclaimable;
        info!(
            "reclaimable blocks with non-slab pages: {} (lru={} kmem={} other={} pages)",
            x.blocks, x.lru, x.kmem, x.other
        );
        info!(
            "total blocks: {} blocks with nonmovable: {}",
            report.total_blocks, report.blocks_with_nonmovable
        );

        for tag in 0..MAX_MIGRATETYPE_TAGS {
            let counts = &report.categories_by_migratetype[tag];
            if counts.total() == 0 {
                continue;
            }
            info!("{} pages by type:", table.decode(tag as u8));
            for category in PageCategory::ALL {
                let n = counts.get(category);
                if n > 0 {
                    info!("  {} {}", category, n);
                }
            }
        }

        let m = &report.mismatches;
        info!("mismatches: {}", m.total());
        info!("  lru in unmovable: {}", m.lru_in_unmovable);
        info!("  lru in reclaimable: {}", m.lru_in_reclaimable);
        info!("  unreclaimable slab in movable: {}", m.unreclaimable_slab_in_movable);
        info!("  reclaimable slab in movable: {}", m.reclaimable_slab_in_movable);
        info!("  reclaimable slab in unmovable: {}", m.reclaimable_slab_in_unmovable);
        info!("  other in reclaimable: {}", m.other_in_reclaimable);
    }

    #[allow(unused_variables)]
    fn log_blocks_by_migratetype(blocks: &[u64; MAX_MIGRATETYPE_TAGS], table: &MigratetypeTable) {
        for (tag, &count) in blocks.iter().enumerate() {
            if count > 0 {
                info!("{} {}", table.decode(tag as u8), count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_percentile_interpolates_and_truncates() {
        assert_eq!(percentile(&[1, 2, 3, 4], 0.5), Some(2));
        assert_eq!(percentile(&[0, 10], 0.5), Some(5));
        assert_eq!(percentile(&[0, 10, 20, 30, 40], 0.5), Some(20));
    }

    #[test]
    fn test_percentile_edges() {
        assert_eq!(percentile(&[], 0.5), None);
        assert_eq!(percentile(&[], 0.99), None);
        assert_eq!(percentile(&[5], 0.99), Some(5));
        assert_eq!(percentile(&[5], 0.0), Some(5));
        assert_eq!(percentile(&[3, 9], 1.0), Some(9));
    }

    #[test]
    fn test_percentile_p99() {
        let samples: Vec<u64> = (1..=100).collect();
        // rank 98.01 between 99 and 100
        assert_eq!(percentile(&samples, 0.99), Some(99));
    }

    #[test]
    fn test_summary_sorts_input() {
        let summary = PercentileSummary::from_samples(vec![4, 1, 3, 2]);
        assert_eq!(summary.p50, Some(2));
        assert_eq!(summary.p99, Some(3));
    }

    #[test]
    fn test_unmovable_fraction() {
        assert_eq!(unmovable_fraction(0, 0), None);
        assert_eq!(unmovable_fraction(3, 1), Some(0.25));
    }

    #[test]
    fn test_sample_stats() {
        let samples = [
            BlockSample {
                block_pfn: 0,
                movable: 511,
                unmovable: 1,
                free: 0,
            },
            BlockSample {
                block_pfn: 512,
                movable: 100,
                unmovable: 12,
                free: 400,
            },
        ];
        let stats = SampleStats::from_samples(&samples);
        assert_eq!(stats.free.p50, Some(200));
        assert_eq!(stats.movable.p50, Some(305));
        assert_eq!(stats.unmovable.p50, Some(6));
    }
}
