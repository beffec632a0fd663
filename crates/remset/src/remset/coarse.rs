//! Coarse representation: one "may point here" bit per source region.

use crate::gc::mark::AtomicBitmap;
use crate::heap::RegionIdx;

/// Set of source regions any of whose cards may reference the owner.
#[derive(Debug)]
pub struct CoarseMap {
    bits: AtomicBitmap,
}

impl CoarseMap {
    /// Create an empty map over `n_regions` sources.
    #[must_use]
    pub fn new(n_regions: usize) -> Self {
        Self {
            bits: AtomicBitmap::new(n_regions),
        }
    }

    /// Mark `source` coarse. Returns `true` if newly marked.
    pub fn insert(&self, source: RegionIdx) -> bool {
        self.bits.set(source.0)
    }

    /// Returns `true` if `source` is coarse.
    #[inline]
    #[must_use]
    pub fn contains(&self, source: RegionIdx) -> bool {
        self.bits.get(source.0)
    }

    /// Unmark `source`. Returns `true` if it was marked.
    pub fn remove(&self, source: RegionIdx) -> bool {
        self.bits.clear(source.0)
    }

    /// Number of coarse sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.count_ones()
    }

    /// Returns `true` if no source is coarse.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.find_next_set(0..self.bits.len()).is_none()
    }

    /// Call `f` for each coarse source.
    pub fn for_each(&self, mut f: impl FnMut(RegionIdx)) {
        self.bits.for_each_set(0..self.bits.len(), |i| f(RegionIdx(i)));
    }

    /// Keep only the sources for which `keep` holds. Returns how many were
    /// dropped.
    pub fn retain(&self, mut keep: impl FnMut(RegionIdx) -> bool) -> usize {
        let mut dropped = 0;
        self.for_each(|source| {
            if !keep(source) && self.remove(source) {
                dropped += 1;
            }
        });
        dropped
    }

    /// Unmark every source.
    pub fn clear(&self) {
        self.bits.clear_all();
    }

    /// Bytes used.
    #[must_use]
    pub fn mem_size(&self) -> usize {
        self.bits.mem_size()
    }
}
