//! Host region boundary signal
//!
//! Some hosts resize the unmovable region of a guest at runtime and publish
//! the current split as `key value` lines:
//!
//! ```text
//! movable_base 1048576
//! actual_unmovable_size 8589934592
//! min_unmovable_size 4294967296
//! ```
//!
//! Everything above the resulting boundary PFN is movable by construction,
//! so a scan may skip it. The signal only ever saves time.

#[cfg(feature = "log")]
use log::warn;

/// Default location of the signal on hosts that publish it.
pub const DEFAULT_PATH: &str = "/proc/region_boundary";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostBoundary {
    /// First PFN of the movable region before any expansion.
    pub movable_base: u64,
    /// Current unmovable region size in bytes.
    pub actual_unmovable_size: u64,
    /// Unmovable region size in bytes the host started from.
    pub min_unmovable_size: u64,
}

impl HostBoundary {
    /// Parse the signal; unknown keys and malformed values are ignored.
    pub fn parse(text: &str) -> Self {
        let mut boundary = Self::default();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
                continue;
            };
            let slot = match key {
                "movable_base" => &mut boundary.movable_base,
                "actual_unmovable_size" => &mut boundary.actual_unmovable_size,
                "min_unmovable_size" => &mut boundary.min_unmovable_size,
                _ => continue,
            };
            match value.parse::<u64>() {
                Ok(v) => *slot = v,
                Err(_) => {
                    warn!("region boundary: bad value {:?} for {}", value, key);
                }
            }
        }
        boundary
    }

    /// Boundary PFN: the movable base shifted up by the number of pages the
    /// unmovable region grew by.
    ///
    /// `None` unless all three values were published and non-zero.
    pub fn boundary_pfn(&self, page_size: u64) -> Option<u64> {
        if self.movable_base == 0 || self.actual_unmovable_size == 0 || self.min_unmovable_size == 0
        {
            return None;
        }
        let pages_expanded = self
            .actual_unmovable_size
            .saturating_sub(self.min_unmovable_size)
            / page_size;
        Some(self.movable_base.saturating_add(pages_expanded))
    }

    /// Read the signal from `path`; `None` if it cannot be read.
    #[cfg(feature = "std")]
    pub fn read<P: AsRef<std::path::Path>>(path: P) -> Option<Self> {
        std::fs::read_to_string(path).ok().map(|text| Self::parse(&text))
    }
}
