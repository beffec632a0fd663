//! Fine representation: one bit per card of a single source region.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::card_table::CardIdx;
use crate::gc::mark::AtomicBitmap;
use crate::heap::RegionIdx;

/// Bitmap over all cards of one source region.
///
/// Bits are set with `fetch_or`, so concurrent inserts need no lock. The
/// table is published into the owner's bucket chain only after it has been
/// filled with the migrated sparse cards.
#[derive(Debug)]
pub struct PerRegionTable {
    source: RegionIdx,
    first_card: usize,
    bits: AtomicBitmap,
    occupied: AtomicUsize,
}

impl PerRegionTable {
    /// Create an empty table for `source`, whose cards start at `first_card`.
    #[must_use]
    pub fn new(source: RegionIdx, first_card: usize, cards_per_region: usize) -> Self {
        Self {
            source,
            first_card,
            bits: AtomicBitmap::new(cards_per_region),
            occupied: AtomicUsize::new(0),
        }
    }

    /// Source region this table describes.
    #[must_use]
    pub const fn source(&self) -> RegionIdx {
        self.source
    }

    #[inline]
    fn offset(&self, card: CardIdx) -> usize {
        debug_assert!(
            card.0 >= self.first_card && card.0 - self.first_card < self.bits.len(),
            "card {} not in source region {}",
            card.0,
            self.source.0
        );
        card.0 - self.first_card
    }

    /// Record `card`. Returns `true` if it was not yet recorded.
    pub fn add_card(&self, card: CardIdx) -> bool {
        let added = self.bits.set(self.offset(card));
        if added {
            self.occupied.fetch_add(1, Ordering::Relaxed);
        }
        added
    }

    /// Returns `true` if `card` is recorded.
    #[must_use]
    pub fn contains(&self, card: CardIdx) -> bool {
        self.bits.get(self.offset(card))
    }

    /// Number of recorded cards.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }

    /// Call `f` for every recorded card.
    pub fn for_each_card(&self, mut f: impl FnMut(CardIdx)) {
        self.bits
            .for_each_set(0..self.bits.len(), |offset| f(CardIdx(self.first_card + offset)));
    }

    /// AND every bitmap word with `live(word_index)` and recount occupancy.
    /// Returns the new occupancy.
    pub fn retain_words(&self, mut live: impl FnMut(usize) -> u64) -> usize {
        let mut occupied = 0;
        for w in 0..self.bits.word_count() {
            occupied += self.bits.and_word(w, live(w)).count_ones() as usize;
        }
        self.occupied.store(occupied, Ordering::Relaxed);
        occupied
    }

    /// Bytes used.
    #[must_use]
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Self>() - std::mem::size_of::<AtomicBitmap>() + self.bits.mem_size()
    }
}
