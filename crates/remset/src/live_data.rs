//! Card live data: which cards and regions held live objects at the end of
//! the last marking cycle.
//!
//! Built concurrently after marking from the mark bitmap, finalized at a
//! safepoint, and used to scrub remembered-set entries that can no longer
//! hold live references.
//!
//! A region contributes:
//!
//! * every marked object in `[bottom, tams)`;
//! * everything in `[tams, top)`, which was allocated during marking and is
//!   implicitly live.
//!
//! Regions allocated or released after creation started carry a newer
//! timestamp and are recomputed by [`CardLiveData::finalize`], as are regions
//! the creation pass never reached because it was aborted.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::card_table::CardIdx;
use crate::gc::claim::RegionClaimer;
use crate::gc::mark::{AtomicBitmap, MarkBitmap};
use crate::gc::work_gang::WorkGang;
use crate::heap::{Address, Heap, Region, RegionIdx, WORD_SIZE};
use crate::remset::{CoarseMap, PerRegionTable};
use crate::tracing::internal::log_live_data_recompute;

const BITS: usize = u64::BITS as usize;

/// Regions whose recomputed live data differs from the recorded data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDataMismatch {
    /// Mismatching regions, ascending.
    pub regions: Vec<RegionIdx>,
    /// Total number of differing card bits.
    pub cards: usize,
}

impl fmt::Display for LiveDataMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "card live data differs in {} region(s) ({} card bits)",
            self.regions.len(),
            self.cards
        )
    }
}

impl std::error::Error for LiveDataMismatch {}

/// Per-card and per-region liveness for one marking cycle.
#[derive(Debug)]
pub struct CardLiveData {
    cards: AtomicBitmap,
    regions: AtomicBitmap,
    done: AtomicBitmap,
    created_at: AtomicU64,
    base: Address,
    card_shift: u32,
    cards_per_region: usize,
}

impl CardLiveData {
    /// Create empty live data for a heap.
    #[must_use]
    pub fn new(heap: &Heap, card_shift: u32) -> Self {
        let n_cards = heap.size() >> card_shift;
        let cards_per_region = heap.region_size() >> card_shift;
        debug_assert!(cards_per_region % BITS == 0, "regions must span whole words");
        Self {
            cards: AtomicBitmap::new(n_cards),
            regions: AtomicBitmap::new(heap.num_regions()),
            done: AtomicBitmap::new(heap.num_regions()),
            created_at: AtomicU64::new(0),
            base: heap.base(),
            card_shift,
            cards_per_region,
        }
    }

    /// Returns `true` if `card` overlapped a live object.
    #[inline]
    #[must_use]
    pub fn is_card_live(&self, card: CardIdx) -> bool {
        self.cards.get(card.0)
    }

    /// Returns `true` if `region` held any live object.
    #[inline]
    #[must_use]
    pub fn is_region_live(&self, region: RegionIdx) -> bool {
        self.regions.get(region.0)
    }

    /// Number of live cards.
    #[must_use]
    pub fn live_cards(&self) -> usize {
        self.cards.count_ones()
    }

    /// Number of live regions.
    #[must_use]
    pub fn live_regions(&self) -> usize {
        self.regions.count_ones()
    }

    /// Heap clock value at which the last creation started.
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at.load(Ordering::Acquire)
    }

    /// Returns `true` if the creation pass finished `region`.
    #[must_use]
    pub fn is_region_done(&self, region: RegionIdx) -> bool {
        self.done.get(region.0)
    }

    /// Build live data from `marks` on the gang's threads.
    ///
    /// Returns `false` if `should_abort` cut the pass short; the regions
    /// already done are kept and [`finalize`](Self::finalize) computes the
    /// rest.
    pub fn create(
        &self,
        gang: &WorkGang,
        heap: &Heap,
        marks: &MarkBitmap,
        should_abort: &AtomicBool,
    ) -> bool {
        self.created_at.store(heap.now(), Ordering::Release);
        let workers = gang.total_workers();
        let claimer = RegionClaimer::new(heap.num_regions(), workers);
        let aborted = AtomicBool::new(false);
        gang.run_task(
            &|worker: usize| {
                claimer.for_each_claimed(worker, |r| {
                    if should_abort.load(Ordering::Acquire) {
                        aborted.store(true, Ordering::Relaxed);
                        return false;
                    }
                    let region = heap.region(RegionIdx(r));
                    self.compute_region(heap, marks, region, &self.cards, &self.regions);
                    self.done.set(r);
                    true
                });
            },
            workers,
        );
        !aborted.load(Ordering::Relaxed)
    }

    /// Complete the live data at a safepoint.
    ///
    /// Recomputes every region the creation pass did not finish or that was
    /// allocated or released since, and marks everything allocated since
    /// creation as live. Returns the number of regions recomputed.
    pub fn finalize(&self, gang: &WorkGang, heap: &Heap, marks: &MarkBitmap) -> usize {
        let created_at = self.created_at();
        let workers = gang.total_workers();
        let claimer = RegionClaimer::new(heap.num_regions(), workers);
        let recomputed = AtomicUsize::new(0);
        gang.run_task(
            &|worker: usize| {
                claimer.for_each_claimed(worker, |r| {
                    let region = heap.region(RegionIdx(r));
                    if !self.done.get(r) || region.timestamp() > created_at {
                        self.clear_region(RegionIdx(r));
                        self.compute_region(heap, marks, region, &self.cards, &self.regions);
                        self.done.set(r);
                        recomputed.fetch_add(1, Ordering::Relaxed);
                    } else if !region.is_free() {
                        self.mark_allocated_since_walk(region);
                    }
                    true
                });
            },
            workers,
        );
        let recomputed = recomputed.load(Ordering::Relaxed);
        if recomputed > 0 {
            log_live_data_recompute(recomputed, "finalize");
        }
        recomputed
    }

    /// Recompute live data from scratch and compare with the recorded data.
    ///
    /// # Errors
    ///
    /// Returns the mismatching regions.
    pub fn verify(
        &self,
        gang: &WorkGang,
        heap: &Heap,
        marks: &MarkBitmap,
    ) -> Result<(), LiveDataMismatch> {
        let cards = AtomicBitmap::new(self.cards.len());
        let regions = AtomicBitmap::new(self.regions.len());
        let workers = gang.total_workers();
        let claimer = RegionClaimer::new(heap.num_regions(), workers);
        let mismatches = Mutex::new(LiveDataMismatch {
            regions: Vec::new(),
            cards: 0,
        });
        gang.run_task(
            &|worker: usize| {
                claimer.for_each_claimed(worker, |r| {
                    let region = heap.region(RegionIdx(r));
                    self.compute_region(heap, marks, region, &cards, &regions);
                    let words = self.region_words(RegionIdx(r));
                    let differing: usize = words
                        .map(|w| (cards.word(w) ^ self.cards.word(w)).count_ones() as usize)
                        .sum();
                    if differing > 0 || regions.get(r) != self.regions.get(r) {
                        let mut m = mismatches.lock();
                        m.regions.push(RegionIdx(r));
                        m.cards += differing;
                    }
                    true
                });
            },
            workers,
        );
        let mut mismatches = mismatches.into_inner();
        if mismatches.regions.is_empty() {
            return Ok(());
        }
        mismatches.regions.sort_unstable();
        Err(mismatches)
    }

    /// Clear everything, partitioned by region across the gang.
    pub fn clear(&self, gang: &WorkGang) {
        let n_regions = self.regions.len();
        let workers = gang.total_workers();
        let claimer = RegionClaimer::new(n_regions, workers);
        gang.run_task(
            &|worker: usize| {
                claimer.for_each_claimed(worker, |r| {
                    self.clear_region(RegionIdx(r));
                    true
                });
            },
            workers,
        );
        self.done.clear_all();
        self.created_at.store(0, Ordering::Release);
    }

    /// Drop every card of `table` that holds no live object. Returns the
    /// number of cards left.
    pub fn remove_nonlive_cards(&self, table: &PerRegionTable) -> usize {
        let first_word = table.source().0 * self.cards_per_region / BITS;
        table.retain_words(|w| self.cards.word(first_word + w))
    }

    /// Drop every coarse source without live objects. Returns the number of
    /// sources dropped.
    pub fn remove_nonlive_regions(&self, coarse: &CoarseMap) -> usize {
        coarse.retain(|source| self.is_region_live(source))
    }

    fn region_words(&self, region: RegionIdx) -> std::ops::Range<usize> {
        let per_region = self.cards_per_region / BITS;
        region.0 * per_region..(region.0 + 1) * per_region
    }

    fn clear_region(&self, region: RegionIdx) {
        self.cards.clear_words(self.region_words(region));
        self.regions.clear(region.0);
        self.done.clear(region.0);
    }

    #[inline]
    fn card_index(&self, addr: Address) -> usize {
        (addr - self.base) >> self.card_shift
    }

    fn mark_cards(&self, cards: &AtomicBitmap, from: Address, to: Address) {
        if from < to {
            cards.set_range(self.card_index(from)..self.card_index(to - 1) + 1);
        }
    }

    fn mark_allocated_since_walk(&self, region: &Region) {
        let (tams, top) = (region.tams(), region.top());
        if top > tams {
            self.mark_cards(&self.cards, tams, top);
            self.regions.set(region.index().0);
        }
    }

    fn compute_region(
        &self,
        heap: &Heap,
        marks: &MarkBitmap,
        region: &Region,
        cards: &AtomicBitmap,
        regions: &AtomicBitmap,
    ) {
        if region.is_free() {
            return;
        }
        let (tams, top) = (region.tams(), region.top());
        let mut live = false;
        let mut next = marks.next_marked(region.bottom(), tams);
        while let Some(obj) = next {
            let size = heap.header(obj).map_or(WORD_SIZE, |h| h.size_bytes());
            self.mark_cards(cards, obj, obj + size);
            live = true;
            next = marks.next_marked(obj + size, tams);
        }
        if top > tams {
            self.mark_cards(cards, tams, top);
            live = true;
        }
        if live {
            regions.set(region.index().0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemSetConfig;
    use crate::heap::{RefWidth, RegionKind};

    fn setup() -> (Heap, MarkBitmap, CardLiveData, WorkGang) {
        // 64 KiB regions of 128 cards.
        let config = RemSetConfig::new(16, 8);
        let heap = Heap::new(&config).unwrap();
        let marks = MarkBitmap::new(heap.base(), heap.size());
        let live = CardLiveData::new(&heap, config.card_shift);
        let gang = WorkGang::new("live-test", 2).unwrap();
        (heap, marks, live, gang)
    }

    fn card_of(heap: &Heap, addr: Address) -> CardIdx {
        CardIdx((addr - heap.base()) >> 9)
    }

    #[test]
    fn test_marked_objects_below_tams() {
        let (heap, marks, live, gang) = setup();
        let r = heap.allocate_region(RegionKind::Old).unwrap();
        let a = heap.allocate(r, 4, RefWidth::Wide).unwrap();
        let dead = heap.allocate(r, 200, RefWidth::Wide).unwrap();
        let b = heap.allocate(r, 4, RefWidth::Wide).unwrap();
        heap.record_top_at_mark_start();
        marks.mark(a);
        marks.mark(b);

        assert!(live.create(&gang, &heap, &marks, &AtomicBool::new(false)));
        assert!(live.is_card_live(card_of(&heap, a)));
        assert!(live.is_card_live(card_of(&heap, b)));
        // The dead object spans cards that hold nothing else.
        assert!(!live.is_card_live(card_of(&heap, dead + 1024)));
        assert!(live.is_region_live(r));
        assert!(live.verify(&gang, &heap, &marks).is_ok());
    }

    #[test]
    fn test_above_tams_is_live() {
        let (heap, marks, live, gang) = setup();
        let r = heap.allocate_region(RegionKind::Old).unwrap();
        heap.record_top_at_mark_start();
        let obj = heap.allocate(r, 2, RefWidth::Narrow).unwrap();
        live.create(&gang, &heap, &marks, &AtomicBool::new(false));
        assert!(live.is_card_live(card_of(&heap, obj)));
        assert!(live.is_region_live(r));
    }

    #[test]
    fn test_abort_then_finalize() {
        let (heap, marks, live, gang) = setup();
        let r = heap.allocate_region(RegionKind::Old).unwrap();
        let obj = heap.allocate(r, 1, RefWidth::Wide).unwrap();
        heap.record_top_at_mark_start();
        marks.mark(obj);

        assert!(!live.create(&gang, &heap, &marks, &AtomicBool::new(true)));
        assert!(!live.is_region_done(r));
        assert!(!live.is_region_live(r));
        assert!(live.finalize(&gang, &heap, &marks) >= 1);
        assert!(live.is_region_live(r));
        assert!(live.verify(&gang, &heap, &marks).is_ok());
    }

    #[test]
    fn test_region_released_mid_cycle_is_recomputed() {
        let (heap, marks, live, gang) = setup();
        let r = heap.allocate_region(RegionKind::Old).unwrap();
        let obj = heap.allocate(r, 1, RefWidth::Wide).unwrap();
        heap.record_top_at_mark_start();
        marks.mark(obj);
        live.create(&gang, &heap, &marks, &AtomicBool::new(false));
        assert!(live.is_region_live(r));

        heap.release_region(r).unwrap();
        marks.clear();
        assert!(live.verify(&gang, &heap, &marks).is_err());
        live.finalize(&gang, &heap, &marks);
        assert!(!live.is_region_live(r));
        assert!(!live.is_card_live(card_of(&heap, obj)));
        assert!(live.verify(&gang, &heap, &marks).is_ok());
    }

    #[test]
    fn test_verify_reports_mismatch() {
        let (heap, marks, live, gang) = setup();
        let r = heap.allocate_region(RegionKind::Old).unwrap();
        let obj = heap.allocate(r, 1, RefWidth::Wide).unwrap();
        heap.record_top_at_mark_start();
        live.create(&gang, &heap, &marks, &AtomicBool::new(false));
        marks.mark(obj);
        let err = live.verify(&gang, &heap, &marks).unwrap_err();
        assert_eq!(err.regions, vec![r]);
        assert_eq!(err.cards, 1);
        assert!(err.to_string().contains("1 region"));
    }

    #[test]
    fn test_remove_nonlive() {
        let (heap, marks, live, gang) = setup();
        let r = heap.allocate_region(RegionKind::Old).unwrap();
        let obj = heap.allocate(r, 1, RefWidth::Wide).unwrap();
        heap.record_top_at_mark_start();
        marks.mark(obj);
        live.create(&gang, &heap, &marks, &AtomicBool::new(false));

        let first = r.0 * 128;
        let table = PerRegionTable::new(r, first, 128);
        table.add_card(card_of(&heap, obj));
        table.add_card(CardIdx(first + 100));
        assert_eq!(live.remove_nonlive_cards(&table), 1);

        let coarse = CoarseMap::new(8);
        coarse.insert(r);
        coarse.insert(RegionIdx(5));
        assert_eq!(live.remove_nonlive_regions(&coarse), 1);
        assert!(coarse.contains(r));

        live.clear(&gang);
        assert_eq!(live.live_cards(), 0);
        assert_eq!(live.live_regions(), 0);
    }
}
