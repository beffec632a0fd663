//! Sparse representation: a short card list per source region.
//!
//! Always accessed under the owning remembered set's lock.

use std::collections::HashMap;

use crate::card_table::CardIdx;
use crate::heap::RegionIdx;

/// Result of adding a card to a [`SparseTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseAdd {
    /// The card was recorded.
    Added,
    /// The card was already recorded.
    Present,
    /// The source's slots are full; the card was not recorded.
    Overflow,
}

/// Per-source bounded card lists.
#[derive(Debug)]
pub struct SparseTable {
    entries: HashMap<RegionIdx, Vec<CardIdx>>,
    capacity_per_source: usize,
    occupied: usize,
}

impl SparseTable {
    /// Create an empty table holding up to `capacity_per_source` cards per
    /// source.
    #[must_use]
    pub fn new(capacity_per_source: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity_per_source,
            occupied: 0,
        }
    }

    /// Record `card` of `source`.
    pub fn add_card(&mut self, source: RegionIdx, card: CardIdx) -> SparseAdd {
        let cap = self.capacity_per_source;
        let cards = self
            .entries
            .entry(source)
            .or_insert_with(|| Vec::with_capacity(cap));
        if cards.contains(&card) {
            return SparseAdd::Present;
        }
        if cards.len() >= cap {
            return SparseAdd::Overflow;
        }
        cards.push(card);
        self.occupied += 1;
        SparseAdd::Added
    }

    /// Returns `true` if `card` of `source` is recorded.
    #[must_use]
    pub fn contains(&self, source: RegionIdx, card: CardIdx) -> bool {
        self.entries
            .get(&source)
            .is_some_and(|cards| cards.contains(&card))
    }

    /// Returns `true` if `source` has an entry.
    #[must_use]
    pub fn contains_source(&self, source: RegionIdx) -> bool {
        self.entries.contains_key(&source)
    }

    /// Cards recorded for `source`.
    #[must_use]
    pub fn cards(&self, source: RegionIdx) -> &[CardIdx] {
        self.entries.get(&source).map_or(&[], Vec::as_slice)
    }

    /// Remove the entry for `source`. Returns `true` if one existed.
    pub fn remove(&mut self, source: RegionIdx) -> bool {
        match self.entries.remove(&source) {
            Some(cards) => {
                self.occupied -= cards.len();
                true
            }
            None => false,
        }
    }

    /// Keep only the sources and cards for which the predicates hold.
    /// Returns the number of cards removed.
    pub fn retain(
        &mut self,
        mut keep_source: impl FnMut(RegionIdx) -> bool,
        mut keep_card: impl FnMut(CardIdx) -> bool,
    ) -> usize {
        let before = self.occupied;
        self.entries.retain(|&source, cards| {
            if !keep_source(source) {
                return false;
            }
            cards.retain(|&c| keep_card(c));
            !cards.is_empty()
        });
        self.occupied = self.entries.values().map(Vec::len).sum();
        before - self.occupied
    }

    /// Every recorded `(source, card)` pair.
    pub fn iter(&self) -> impl Iterator<Item = (RegionIdx, CardIdx)> + '_ {
        self.entries
            .iter()
            .flat_map(|(&source, cards)| cards.iter().map(move |&c| (source, c)))
    }

    /// Number of recorded cards.
    #[must_use]
    pub const fn occupied(&self) -> usize {
        self.occupied
    }

    /// Number of sources with an entry.
    #[must_use]
    pub fn sources(&self) -> usize {
        self.entries.len()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.occupied = 0;
    }

    /// Approximate bytes used.
    #[must_use]
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.entries.capacity()
                * (std::mem::size_of::<RegionIdx>() + std::mem::size_of::<Vec<CardIdx>>())
            + self.entries.len() * self.capacity_per_source * std::mem::size_of::<CardIdx>()
    }
}
