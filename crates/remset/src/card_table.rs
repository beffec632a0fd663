//! Card table: one state byte per card of the heap.
//!
//! Card state transitions:
//!
//! ```text
//!            barrier                 refinement claim            refinement done
//!   Clean ───────────► Dirty ───────────────────────► Refining ─────────────────► Clean
//!     ▲                  ▲                                 │
//!     │                  └──────── barrier re-dirty ───────┘
//!     │
//!     │   pause scan claim               cleanup
//!     └──────────────────── Claimed ◄──────────── Clean / Dirty
//!
//!   Dirty ── in-pause refinement finds collection-set refs ──► Deferred ── cleanup ──► Dirty
//! ```
//!
//! Cards of young regions are kept in the `Young` state so the write barrier
//! can filter them with the same load it already does.

use std::ops::Range;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::heap::{Address, RegionIdx};

/// Index of a card in the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CardIdx(pub usize);

impl CardIdx {
    /// Raw index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// State of one card.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CardState {
    /// No unprocessed writes.
    Clean = 0,
    /// Written since last refined; queued for refinement.
    Dirty = 1,
    /// Owned by a refinement thread between claim and clean.
    Refining = 2,
    /// Claimed by a pause scan worker.
    Claimed = 3,
    /// Held back during a pause; becomes `Dirty` again at cleanup.
    Deferred = 4,
    /// Card of a young region; never refined.
    Young = 5,
}

impl CardState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Dirty,
            2 => Self::Refining,
            3 => Self::Claimed,
            4 => Self::Deferred,
            5 => Self::Young,
            _ => Self::Clean,
        }
    }
}

/// Byte-per-card state table covering the whole heap.
#[derive(Debug)]
pub struct CardTable {
    cards: Box<[AtomicU8]>,
    base: Address,
    card_shift: u32,
    region_card_shift: u32,
}

impl CardTable {
    /// Create an all-clean table for a heap at `base` of `size` bytes.
    #[must_use]
    pub fn new(base: Address, size: usize, card_shift: u32, region_shift: u32) -> Self {
        Self {
            cards: (0..size >> card_shift)
                .map(|_| AtomicU8::new(CardState::Clean as u8))
                .collect(),
            base,
            card_shift,
            region_card_shift: region_shift - card_shift,
        }
    }

    /// Number of cards.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Returns `true` if the table covers no cards.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Card size in bytes.
    #[must_use]
    pub const fn card_size(&self) -> usize {
        1 << self.card_shift
    }

    /// Cards per region.
    #[must_use]
    pub const fn cards_per_region(&self) -> usize {
        1 << self.region_card_shift
    }

    /// Card containing `addr`.
    #[inline]
    #[must_use]
    pub const fn card_for(&self, addr: Address) -> CardIdx {
        CardIdx((addr - self.base) >> self.card_shift)
    }

    /// First address of `card`.
    #[inline]
    #[must_use]
    pub const fn card_start(&self, card: CardIdx) -> Address {
        self.base + (card.0 << self.card_shift)
    }

    /// One past the last address of `card`.
    #[inline]
    #[must_use]
    pub const fn card_end(&self, card: CardIdx) -> Address {
        self.card_start(card) + self.card_size()
    }

    /// Region containing `card`.
    #[inline]
    #[must_use]
    pub const fn region_of(&self, card: CardIdx) -> RegionIdx {
        RegionIdx(card.0 >> self.region_card_shift)
    }

    /// Card indices of `region`.
    #[must_use]
    pub const fn cards_in_region(&self, region: RegionIdx) -> Range<usize> {
        let first = region.0 << self.region_card_shift;
        first..first + self.cards_per_region()
    }

    #[inline]
    fn cell(&self, card: CardIdx) -> &AtomicU8 {
        &self.cards[card.0]
    }

    /// Current state of `card`.
    #[inline]
    #[must_use]
    pub fn state(&self, card: CardIdx) -> CardState {
        CardState::from_u8(self.cell(card).load(Ordering::Acquire))
    }

    /// Dirty the card containing `addr`.
    ///
    /// Returns the card if this call changed it to `Dirty`, in which case the
    /// caller must enqueue it. Cards already dirty or belonging to young
    /// regions are left alone.
    #[inline]
    pub fn dirty(&self, addr: Address) -> Option<CardIdx> {
        let card = self.card_for(addr);
        let cell = self.cell(card);
        match CardState::from_u8(cell.load(Ordering::Relaxed)) {
            CardState::Dirty | CardState::Young => None,
            _ => (cell.swap(CardState::Dirty as u8, Ordering::AcqRel) != CardState::Dirty as u8)
                .then_some(card),
        }
    }

    /// Returns `true` if the card containing `addr` is dirty.
    #[must_use]
    pub fn is_dirty(&self, addr: Address) -> bool {
        self.state(self.card_for(addr)) == CardState::Dirty
    }

    /// Mark `card` clean.
    pub fn clean(&self, card: CardIdx) {
        self.cell(card)
            .store(CardState::Clean as u8, Ordering::Release);
    }

    fn transition(&self, card: CardIdx, from: CardState, to: CardState) -> bool {
        self.cell(card)
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim a dirty card for refinement (`Dirty -> Refining`).
    #[must_use]
    pub fn try_claim_for_refinement(&self, card: CardIdx) -> bool {
        self.transition(card, CardState::Dirty, CardState::Refining)
    }

    /// Finish refining a card (`Refining -> Clean`).
    ///
    /// Returns `false` if a barrier re-dirtied the card meanwhile; it stays
    /// dirty and has already been re-enqueued by that barrier.
    #[must_use]
    pub fn finish_refinement(&self, card: CardIdx) -> bool {
        self.transition(card, CardState::Refining, CardState::Clean)
    }

    /// Finish refining a card during a pause by holding it back as
    /// `Deferred` (`Refining -> Deferred`).
    #[must_use]
    pub fn defer_refined(&self, card: CardIdx) -> bool {
        self.transition(card, CardState::Refining, CardState::Deferred)
    }

    /// Claim a card for a pause scan.
    ///
    /// Succeeds from `Clean` or `Dirty`; fails if the card is already
    /// claimed, deferred or young.
    #[must_use]
    pub fn claim_for_scan(&self, card: CardIdx) -> bool {
        let cell = self.cell(card);
        let mut current = cell.load(Ordering::Acquire);
        loop {
            match CardState::from_u8(current) {
                CardState::Clean | CardState::Dirty => {}
                _ => return false,
            }
            match cell.compare_exchange_weak(
                current,
                CardState::Claimed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Mark `card` deferred.
    pub fn mark_deferred(&self, card: CardIdx) {
        self.cell(card)
            .store(CardState::Deferred as u8, Ordering::Release);
    }

    /// Reset every card of `region` to `Clean`.
    pub fn clear_region(&self, region: RegionIdx) {
        self.fill_region(region, CardState::Clean);
    }

    /// Dirty the cards of `region` below `top` and clean the rest. Returns
    /// the dirtied cards.
    pub fn dirty_region_below(&self, region: RegionIdx, top: Address) -> Vec<CardIdx> {
        let cards = self.cards_in_region(region);
        let used = if top > self.card_start(CardIdx(cards.start)) {
            (self.card_for(top - 1).0 + 1).min(cards.end)
        } else {
            cards.start
        };
        for card in cards.clone() {
            let state = if card < used {
                CardState::Dirty
            } else {
                CardState::Clean
            };
            self.cards[card].store(state as u8, Ordering::Release);
        }
        (cards.start..used).map(CardIdx).collect()
    }

    /// Set every card of `region` to `Young`.
    pub fn mark_region_young(&self, region: RegionIdx) {
        self.fill_region(region, CardState::Young);
    }

    fn fill_region(&self, region: RegionIdx, state: CardState) {
        for cell in &self.cards[self.cards_in_region(region)] {
            cell.store(state as u8, Ordering::Release);
        }
    }

    /// Turn the `Claimed` cards of `region` back into `Clean`. Returns how
    /// many were reset.
    pub fn reset_claimed(&self, region: RegionIdx) -> usize {
        let mut reset = 0;
        for card in self.cards_in_region(region) {
            if self.transition(CardIdx(card), CardState::Claimed, CardState::Clean) {
                reset += 1;
            }
        }
        reset
    }

    /// Turn the `Deferred` cards of `region` back into `Dirty`, calling
    /// `f` for each so it can be re-enqueued.
    pub fn redirty_deferred(&self, region: RegionIdx, mut f: impl FnMut(CardIdx)) {
        for card in self.cards_in_region(region).map(CardIdx) {
            if self.transition(card, CardState::Deferred, CardState::Dirty) {
                f(card);
            }
        }
    }

    /// Call `visitor` for every dirty card of `region`.
    pub fn iterate_dirty(&self, region: RegionIdx, mut visitor: impl FnMut(CardIdx)) {
        for card in self.cards_in_region(region).map(CardIdx) {
            if self.state(card) == CardState::Dirty {
                visitor(card);
            }
        }
    }

    /// Number of cards of `region` in `state`.
    #[must_use]
    pub fn count_in_state(&self, region: RegionIdx, state: CardState) -> usize {
        self.cards_in_region(region)
            .filter(|&c| self.state(CardIdx(c)) == state)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Address = 0x4000_0000;

    fn table() -> CardTable {
        // 4 regions of 64 KiB, 512-byte cards.
        CardTable::new(BASE, 4 << 16, 9, 16)
    }

    #[test]
    fn test_geometry() {
        let ct = table();
        assert_eq!(ct.len(), 512);
        assert_eq!(ct.cards_per_region(), 128);
        let card = ct.card_for(BASE + 3 * 65536 + 700);
        assert_eq!(card, CardIdx(3 * 128 + 1));
        assert_eq!(ct.card_start(card), BASE + 3 * 65536 + 512);
        assert_eq!(ct.region_of(card), RegionIdx(3));
        assert_eq!(ct.cards_in_region(RegionIdx(1)), 128..256);
    }

    #[test]
    fn test_dirty_once() {
        let ct = table();
        let addr = BASE + 1024;
        assert_eq!(ct.dirty(addr), Some(CardIdx(2)));
        assert_eq!(ct.dirty(addr + 8), None);
        assert!(ct.is_dirty(addr));
        ct.clean(CardIdx(2));
        assert!(!ct.is_dirty(addr));
    }

    #[test]
    fn test_young_cards_filtered() {
        let ct = table();
        ct.mark_region_young(RegionIdx(0));
        assert_eq!(ct.dirty(BASE), None);
        assert_eq!(ct.state(CardIdx(0)), CardState::Young);
        ct.clear_region(RegionIdx(0));
        assert_eq!(ct.dirty(BASE), Some(CardIdx(0)));
    }

    #[test]
    fn test_dirty_region_below_top() {
        let ct = table();
        let bottom = BASE + 65536;
        ct.mark_region_young(RegionIdx(1));
        assert!(ct.dirty_region_below(RegionIdx(1), bottom).is_empty());
        assert_eq!(ct.count_in_state(RegionIdx(1), CardState::Clean), 128);

        ct.mark_region_young(RegionIdx(1));
        let cards = ct.dirty_region_below(RegionIdx(1), bottom + 1025);
        assert_eq!(cards, vec![CardIdx(128), CardIdx(129), CardIdx(130)]);
        assert_eq!(ct.count_in_state(RegionIdx(1), CardState::Dirty), 3);
        assert_eq!(ct.count_in_state(RegionIdx(1), CardState::Young), 0);

        let full = ct.dirty_region_below(RegionIdx(1), bottom + 65536);
        assert_eq!(full.len(), 128);
    }

    #[test]
    fn test_refinement_protocol() {
        let ct = table();
        let card = CardIdx(5);
        assert!(!ct.try_claim_for_refinement(card));
        ct.dirty(ct.card_start(card));
        assert!(ct.try_claim_for_refinement(card));
        assert!(!ct.try_claim_for_refinement(card));
        assert!(ct.finish_refinement(card));
        assert_eq!(ct.state(card), CardState::Clean);
    }

    #[test]
    fn test_redirty_while_refining_keeps_card_dirty() {
        let ct = table();
        let card = CardIdx(7);
        ct.dirty(ct.card_start(card));
        assert!(ct.try_claim_for_refinement(card));
        assert_eq!(ct.dirty(ct.card_start(card)), Some(card));
        assert!(!ct.finish_refinement(card));
        assert_eq!(ct.state(card), CardState::Dirty);
    }

    #[test]
    fn test_scan_claim_once() {
        let ct = table();
        let card = CardIdx(9);
        assert!(ct.claim_for_scan(card));
        assert!(!ct.claim_for_scan(card));
        ct.mark_deferred(CardIdx(10));
        assert!(!ct.claim_for_scan(CardIdx(10)));
        assert_eq!(ct.reset_claimed(RegionIdx(0)), 1);
        assert_eq!(ct.state(card), CardState::Clean);
    }

    #[test]
    fn test_redirty_deferred() {
        let ct = table();
        ct.mark_deferred(CardIdx(130));
        let mut redirtied = Vec::new();
        ct.redirty_deferred(RegionIdx(1), |c| redirtied.push(c));
        assert_eq!(redirtied, vec![CardIdx(130)]);
        let mut dirty = Vec::new();
        ct.iterate_dirty(RegionIdx(1), |c| dirty.push(c));
        assert_eq!(dirty, vec![CardIdx(130)]);
    }
}
