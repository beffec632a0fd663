//! Per-thread memo of the last card inserted into each region's remembered
//! set.
//!
//! Refinement tends to process the same card repeatedly for the same owner
//! (many references in one card into one region). The cache lets a thread skip
//! the remembered set entirely when it just inserted that exact card.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::card_table::CardIdx;
use crate::heap::RegionIdx;

const INVALID: usize = usize::MAX;

/// `slots x regions` table of last-inserted cards.
#[derive(Debug)]
pub struct FromCardCache {
    cache: Box<[AtomicUsize]>,
    regions: usize,
}

impl FromCardCache {
    /// Create an empty cache for `slots` threads and `regions` owners.
    #[must_use]
    pub fn new(slots: usize, regions: usize) -> Self {
        Self {
            cache: (0..slots * regions)
                .map(|_| AtomicUsize::new(INVALID))
                .collect(),
            regions,
        }
    }

    /// Number of thread slots.
    #[must_use]
    pub fn slots(&self) -> usize {
        self.cache.len().checked_div(self.regions).unwrap_or(0)
    }

    /// Record `card` as the last insert by `slot` into `owner`.
    ///
    /// Returns `true` if it already was, meaning the insert can be skipped.
    #[inline]
    pub fn contains_or_replace(&self, slot: usize, owner: RegionIdx, card: CardIdx) -> bool {
        let cell = &self.cache[slot * self.regions + owner.0];
        if cell.load(Ordering::Relaxed) == card.0 {
            return true;
        }
        cell.store(card.0, Ordering::Relaxed);
        false
    }

    /// Forget every entry for `owner`.
    pub fn invalidate_region(&self, owner: RegionIdx) {
        for slot in 0..self.slots() {
            self.cache[slot * self.regions + owner.0].store(INVALID, Ordering::Relaxed);
        }
    }

    /// Forget everything.
    pub fn clear(&self) {
        for cell in &*self.cache {
            cell.store(INVALID, Ordering::Relaxed);
        }
    }
}
