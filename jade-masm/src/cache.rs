//! Code cache bounds and branch-reachability policy.
//!
//! Installed code can be anywhere inside the cache, so a direct pc-relative
//! branch to a target is only safe when the displacement fits from *every*
//! byte of the cache. The force-unreachable mode exercises the far-call paths
//! in tests by treating all non-cache addresses as out of range.

/// Bounds of the executable code region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodeCacheBounds {
    pub low: u64,
    pub high: u64,
    pub force_unreachable: bool,
}

impl CodeCacheBounds {
    pub fn new(low: u64, high: u64) -> Self {
        assert!(low <= high, "inverted code cache bounds");
        CodeCacheBounds {
            low,
            high,
            force_unreachable: false,
        }
    }

    pub fn force_unreachable(mut self, on: bool) -> Self {
        self.force_unreachable = on;
        self
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.low && addr < self.high
    }

    /// True iff `target` is reachable by a pc-relative branch with maximum
    /// displacement `max_disp` from every byte of the cache.
    pub fn reachable_from_cache(&self, target: u64, max_disp: i64) -> bool {
        if self.force_unreachable && !self.contains(target) {
            return false;
        }
        let lo = (target as i128) - (self.high as i128);
        let hi = (target as i128) - (self.low as i128);
        let max = max_disp as i128;
        lo >= -max && hi <= max
    }

    /// True iff both extremes of the cache can reach each other, i.e. any
    /// intra-cache call may use the cheap direct-branch form.
    pub fn cache_fully_reachable(&self, max_disp: i64) -> bool {
        let span = (self.high as i128) - (self.low as i128);
        span <= max_disp as i128
    }
}
