//! The remembered-set subsystem of one heap.
//!
//! [`RemSetContext`] owns the heap model, the card table, one remembered set
//! per region, the dirty card queues and the live data. Everything a
//! collector driver needs goes through it; there is no global state.
//!
//! # Example
//!
//! ```
//! use remset::{RefWidth, RegionKind, RemSetConfig, RemSetContext};
//!
//! let ctx = RemSetContext::new(RemSetConfig::new(16, 8)).unwrap();
//! let old = ctx.allocate_region(RegionKind::Old).unwrap();
//! let other = ctx.allocate_region(RegionKind::Old).unwrap();
//! let src = ctx.heap().allocate(old, 2, RefWidth::Wide).unwrap();
//! let dst = ctx.heap().allocate(other, 0, RefWidth::Wide).unwrap();
//!
//! let queue = ctx.new_mutator_queue();
//! ctx.write_ref(&queue, src, 0, Some(dst));
//! queue.flush();
//! ctx.refine_pending_buffers();
//!
//! let card = ctx.card_table().card_for(src);
//! assert!(ctx.rem_set(other).contains(card));
//! ```

use std::io;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::card_table::{CardIdx, CardState, CardTable};
use crate::config::RemSetConfig;
use crate::dirty_card_queue::{CardBuffer, DirtyCardQueue, DirtyCardQueueSet};
use crate::gc::claim::RegionClaimer;
use crate::gc::mark::{AtomicBitmap, MarkBitmap};
use crate::gc::work_gang::WorkGang;
use crate::heap::{Address, Heap, OopVisitor, RefSlot, RegionIdx, RegionKind};
use crate::live_data::{CardLiveData, LiveDataMismatch};
use crate::metrics::{CleanupSummary, PhaseTimer, RefinementStats, RemSetSummary, ScanSummary};
use crate::remset::{FromCardCache, RemSetGeometry, RememberedSet};
use crate::scan::{PauseRefine, ScanClosure, ScanState};
use crate::tracing::internal::{
    log_scan_summary, next_pause_id, trace_pause, trace_phase, ScanPhase,
};

/// What concurrent refinement did with a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineOutcome {
    /// Not claimable: already clean, owned by another thread, young or free.
    Skipped,
    /// Scanned and cleaned.
    Cleaned,
    /// Scanned, but a mutator dirtied it again meanwhile; it is queued again.
    Redirtied,
}

/// A cross-region reference missing from its target's remembered set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnrememberedRef {
    /// Address of the slot.
    pub slot: Address,
    /// Object it references.
    pub referent: Address,
    /// Card holding the slot.
    pub card: CardIdx,
}

/// Records every cross-region reference of a card, as concurrent refinement
/// does.
struct RecordRefs<'a> {
    ctx: &'a RemSetContext,
    from: RegionIdx,
    card: CardIdx,
    cache_slot: usize,
}

impl OopVisitor for RecordRefs<'_> {
    fn do_oop<S: RefSlot>(&mut self, slot: &S) {
        if let Some(referent) = slot.load() {
            self.ctx
                .record_reference(self.from, self.card, referent, self.cache_slot);
        }
    }
}

/// Remembered-set state of one heap.
pub struct RemSetContext {
    config: RemSetConfig,
    heap: Heap,
    card_table: CardTable,
    rem_sets: Box<[RememberedSet]>,
    from_card_cache: FromCardCache,
    dcqs: Arc<DirtyCardQueueSet>,
    live_data: CardLiveData,
    marks: MarkBitmap,
    should_abort: AtomicBool,
    at_safepoint: AtomicBool,
    in_cset: AtomicBitmap,
    touched: AtomicBitmap,
    stats: RefinementStats,
    scan: Mutex<Option<Arc<ScanState>>>,
}

impl RemSetContext {
    /// Reserve the heap and build every table for `config`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an invalid configuration, or the OS error
    /// if the heap cannot be reserved.
    pub fn new(config: RemSetConfig) -> io::Result<Self> {
        let heap = Heap::new(&config)?;
        let geometry = RemSetGeometry::from(&config);
        let n_regions = heap.num_regions();
        Ok(Self {
            card_table: CardTable::new(
                heap.base(),
                heap.size(),
                config.card_shift,
                config.region_shift,
            ),
            rem_sets: (0..n_regions)
                .map(|i| RememberedSet::new(RegionIdx(i), geometry))
                .collect(),
            from_card_cache: FromCardCache::new(config.from_card_cache_slots(), n_regions),
            dcqs: Arc::new(DirtyCardQueueSet::new(&config)),
            live_data: CardLiveData::new(&heap, config.card_shift),
            marks: MarkBitmap::new(heap.base(), heap.size()),
            should_abort: AtomicBool::new(false),
            at_safepoint: AtomicBool::new(false),
            in_cset: AtomicBitmap::new(n_regions),
            touched: AtomicBitmap::new(n_regions),
            stats: RefinementStats::new(),
            scan: Mutex::new(None),
            heap,
            config,
        })
    }

    /// Configuration the context was built with.
    #[must_use]
    pub const fn config(&self) -> &RemSetConfig {
        &self.config
    }

    /// The heap.
    #[must_use]
    pub const fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The card table.
    #[must_use]
    pub const fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    /// Remembered set of `region`.
    #[must_use]
    pub fn rem_set(&self, region: RegionIdx) -> &RememberedSet {
        &self.rem_sets[region.0]
    }

    /// The dirty card queue set.
    #[must_use]
    pub fn dirty_card_queue_set(&self) -> &Arc<DirtyCardQueueSet> {
        &self.dcqs
    }

    /// The from-card cache.
    #[must_use]
    pub const fn from_card_cache(&self) -> &FromCardCache {
        &self.from_card_cache
    }

    /// Card live data of the current marking cycle.
    #[must_use]
    pub const fn live_data(&self) -> &CardLiveData {
        &self.live_data
    }

    /// Mark bitmap filled in by the external marker.
    #[must_use]
    pub const fn mark_bitmap(&self) -> &MarkBitmap {
        &self.marks
    }

    /// Refinement counters.
    #[must_use]
    pub const fn stats(&self) -> &RefinementStats {
        &self.stats
    }

    /// Ask concurrent work (refinement, live data creation) to stop early.
    pub fn set_should_abort(&self, abort: bool) {
        self.should_abort.store(abort, Ordering::Release);
    }

    /// Returns `true` if concurrent work should stop early.
    #[must_use]
    pub fn should_abort(&self) -> bool {
        self.should_abort.load(Ordering::Acquire)
    }

    /// Record that all mutators are stopped.
    pub fn enter_safepoint(&self) {
        self.at_safepoint.store(true, Ordering::Release);
    }

    /// Record that mutators run again.
    pub fn leave_safepoint(&self) {
        self.at_safepoint.store(false, Ordering::Release);
    }

    /// Returns `true` between [`enter_safepoint`](Self::enter_safepoint) and
    /// [`leave_safepoint`](Self::leave_safepoint).
    #[must_use]
    pub fn is_at_safepoint(&self) -> bool {
        self.at_safepoint.load(Ordering::Acquire)
    }

    /// Returns `true` if `region` is in the current collection set.
    #[inline]
    #[must_use]
    pub fn is_in_cset(&self, region: RegionIdx) -> bool {
        self.in_cset.get(region.0)
    }

    #[inline]
    pub(crate) fn is_in_cset_addr(&self, addr: Address) -> bool {
        self.heap
            .region_index_for(addr)
            .is_some_and(|r| self.is_in_cset(r))
    }

    /// Cards of `source` may hold references the pause must see.
    pub(crate) fn is_scannable_source(&self, source: RegionIdx) -> bool {
        let region = self.heap.region(source);
        !self.is_in_cset(source) && !region.is_free() && !region.is_young()
    }

    pub(crate) fn note_touched(&self, region: RegionIdx) {
        self.touched.set(region.0);
    }

    // Region lifecycle

    /// Allocate a region of `kind` with empty card and remembered-set state.
    ///
    /// Cards of young regions are marked young so the barrier ignores them.
    pub fn allocate_region(&self, kind: RegionKind) -> Option<RegionIdx> {
        let idx = self.heap.allocate_region(kind)?;
        debug_assert!(self.rem_set(idx).is_empty(), "reused region still remembered");
        if kind == RegionKind::Young {
            self.card_table.mark_region_young(idx);
        } else {
            self.card_table.clear_region(idx);
        }
        Some(idx)
    }

    /// Turn a young region into an old one, e.g. after it survived a pause.
    /// From now on stores into it go through refinement.
    ///
    /// Stores made while it was young were never logged, so every card
    /// below top is dirtied and queued for refinement.
    pub fn promote_region(&self, idx: RegionIdx) {
        self.heap.set_region_kind(idx, RegionKind::Old);
        let top = self.heap.region(idx).top();
        let cards = self.card_table.dirty_region_below(idx, top);
        self.dcqs.enqueue_cards(cards);
    }

    /// Free `idx` for reuse.
    ///
    /// Clears its remembered set, purges it as a source from every other
    /// remembered set, invalidates the from-card cache, cleans its cards and
    /// bumps its generation. Call at a safepoint.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the region's memory could not be discarded.
    /// The region is freed regardless.
    pub fn reclaim_region(&self, idx: RegionIdx) -> io::Result<()> {
        self.rem_set(idx).clear();
        for rs in &*self.rem_sets {
            rs.clear_incoming_entry(idx);
        }
        // Cached cards of the region may name any owner.
        self.from_card_cache.clear();
        self.card_table.clear_region(idx);
        self.in_cset.clear(idx.0);
        self.heap.release_region(idx)
    }

    // Mutator side

    /// Register a dirty card queue for a mutator thread.
    #[must_use]
    pub fn new_mutator_queue(&self) -> DirtyCardQueue {
        DirtyCardQueue::new(&self.dcqs)
    }

    /// Store `target` into slot `slot` of `obj` and run the post-write
    /// barrier.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not an object or `slot` is out of range.
    pub fn write_ref(&self, queue: &DirtyCardQueue, obj: Address, slot: usize, target: Option<Address>) {
        let addr = self.heap.store_ref(obj, slot, target);
        self.post_write_barrier(addr, queue);
    }

    /// Post-write barrier for a store into `slot`.
    ///
    /// Dirties the slot's card and enqueues it if it was not dirty. In the
    /// red zone a full buffer comes back and is refined right here.
    pub fn post_write_barrier(&self, slot: Address, queue: &DirtyCardQueue) {
        // Order the pointer store before the card load (StoreLoad).
        fence(Ordering::SeqCst);
        let Some(card) = self.card_table.dirty(slot) else {
            return;
        };
        if let Some(buffer) = queue.enqueue(card) {
            self.stats.record_mutator_buffer();
            self.refine_buffer(buffer, self.config.mutator_cache_slot(), || false);
        }
    }

    // Refinement

    /// Record that `card` of `from` holds a reference to `referent`.
    ///
    /// References within a region and into free regions are ignored.
    /// Returns `true` if the target's remembered set changed.
    pub(crate) fn record_reference(
        &self,
        from: RegionIdx,
        card: CardIdx,
        referent: Address,
        cache_slot: usize,
    ) -> bool {
        let Some(to) = self.heap.region_index_for(referent) else {
            return false;
        };
        if to == from || self.heap.region(to).is_free() {
            return false;
        }
        if self.from_card_cache.contains_or_replace(cache_slot, to, card) {
            self.stats.record_cache_hit();
            return false;
        }
        let added = self.rem_set(to).add_reference(from, card);
        if added {
            self.stats.record_ref();
        }
        added
    }

    /// Refine `card` concurrently with mutators, using from-card cache
    /// `cache_slot`.
    pub fn refine_card_concurrently(&self, card: CardIdx, cache_slot: usize) -> RefineOutcome {
        let from = self.card_table.region_of(card);
        let region = self.heap.region(from);
        if region.is_free() || region.is_young() {
            self.stats.record_card_skipped();
            return RefineOutcome::Skipped;
        }
        let generation = region.generation();
        if !self.card_table.try_claim_for_refinement(card) {
            self.stats.record_card_skipped();
            return RefineOutcome::Skipped;
        }
        // Read slots only after the claim is visible to barriers.
        fence(Ordering::SeqCst);
        let mut refs = RecordRefs {
            ctx: self,
            from,
            card,
            cache_slot,
        };
        self.heap.oops_in_range(
            self.card_table.card_start(card),
            self.card_table.card_end(card),
            &mut refs,
        );
        self.stats.record_card_refined();
        // A region reclaimed meanwhile only leaves harmless extra entries:
        // reclamation purges it everywhere before reuse.
        debug_assert!(region.generation() >= generation);
        if self.card_table.finish_refinement(card) {
            RefineOutcome::Cleaned
        } else {
            self.stats.record_card_redirtied();
            RefineOutcome::Redirtied
        }
    }

    /// Refine `card` inside a pause.
    ///
    /// References into the collection set are passed to `closure` and the
    /// card is held back as deferred, to be dirtied again after the pause;
    /// other cross-region references are recorded. Cards of collection-set
    /// regions are deferred unscanned. Returns `true` if the card was
    /// deferred.
    pub fn refine_card_during_gc(
        &self,
        card: CardIdx,
        worker: usize,
        closure: &dyn ScanClosure,
    ) -> bool {
        self.refine_card_in_pause(card, worker, closure).0
    }

    /// Like [`refine_card_during_gc`](Self::refine_card_during_gc), also
    /// returning how many references went to `closure`.
    pub(crate) fn refine_card_in_pause(
        &self,
        card: CardIdx,
        worker: usize,
        closure: &dyn ScanClosure,
    ) -> (bool, usize) {
        let from = self.card_table.region_of(card);
        let region = self.heap.region(from);
        if region.is_free() || region.is_young() {
            return (false, 0);
        }
        if !self.card_table.try_claim_for_refinement(card) {
            return (false, 0);
        }
        self.note_touched(from);
        if self.is_in_cset(from) {
            return (self.card_table.defer_refined(card), 0);
        }
        let mut refs = PauseRefine {
            ctx: self,
            closure,
            worker,
            from,
            card,
            found: 0,
        };
        self.heap.oops_in_range(
            self.card_table.card_start(card),
            self.card_table.card_end(card),
            &mut refs,
        );
        if refs.found > 0 {
            (self.card_table.defer_refined(card), refs.found)
        } else {
            let cleaned = self.card_table.finish_refinement(card);
            debug_assert!(cleaned, "card {} dirtied during a pause", card.0);
            (false, 0)
        }
    }

    /// Refine every card of `buffer`, polling `abort` before each.
    ///
    /// On abort the unprocessed rest of the buffer is queued again and
    /// `false` is returned.
    pub fn refine_buffer(
        &self,
        mut buffer: Box<CardBuffer>,
        cache_slot: usize,
        abort: impl Fn() -> bool,
    ) -> bool {
        let mut processed = 0;
        for &card in buffer.cards() {
            if abort() {
                break;
            }
            self.refine_card_concurrently(card, cache_slot);
            processed += 1;
        }
        if processed < buffer.len() {
            buffer.consume(processed);
            self.stats.record_requeued_buffer();
            self.dcqs.enqueue_completed_unconditionally(buffer);
            return false;
        }
        self.dcqs.recycle(buffer);
        true
    }

    /// Refine every completed buffer on the calling thread. Returns the
    /// number of buffers processed.
    pub fn refine_pending_buffers(&self) -> usize {
        let mut n = 0;
        while let Some(buffer) = self.dcqs.take_completed(0) {
            self.refine_buffer(buffer, self.config.mutator_cache_slot(), || false);
            n += 1;
        }
        n
    }

    // Pause

    /// Prepare the scan of `cset`. Call at a safepoint with refinement
    /// suspended.
    ///
    /// Moves every mutator's partial buffer to the completed queue, resets
    /// the from-card cache, marks the collection set and snapshots the
    /// remembered sets of its regions.
    pub fn prepare_for_scan(&self, cset: &[RegionIdx]) {
        debug_assert!(self.is_at_safepoint(), "scan prepared outside a safepoint");
        debug_assert!(
            self.heap
                .regions()
                .filter(|r| r.is_young())
                .all(|r| cset.contains(&r.index())),
            "young region left out of the collection set"
        );
        self.dcqs.concatenate_logs();
        self.from_card_cache.clear();
        self.in_cset.clear_all();
        for &r in cset {
            self.in_cset.set(r.0);
        }
        let state = ScanState::new(self, cset, self.config.parallel_workers);
        *self.scan.lock() = Some(Arc::new(state));
    }

    /// Hand every reference into the collection set that lives outside it to
    /// `closure`, using `gang` for the update and scan phases.
    ///
    /// Returns an empty summary if [`prepare_for_scan`](Self::prepare_for_scan)
    /// was not called.
    pub fn oops_into_collection_set_do(
        &self,
        gang: &WorkGang,
        closure: &dyn ScanClosure,
    ) -> ScanSummary {
        let Some(state) = self.scan.lock().clone() else {
            return ScanSummary::default();
        };
        let _pause = trace_pause(next_pause_id(), state.cset_regions());
        let workers = state.workers();
        let mut timer = PhaseTimer::new();

        timer.start();
        {
            let _phase = trace_phase(ScanPhase::UpdateRemSet);
            gang.run_task(&|w: usize| state.update_rem_set(self, w, closure), workers);
        }
        timer.end_update();

        timer.start();
        {
            let _phase = trace_phase(ScanPhase::ScanRemSet);
            gang.run_task(&|w: usize| state.scan_rem_set(self, w, closure), workers);
        }
        timer.end_scan();

        let mut summary = state.summary();
        summary.update_duration = timer.update;
        summary.scan_duration = timer.scan;
        log_scan_summary(&summary);
        summary
    }

    /// Undo the card claims of the scan and dirty the deferred cards again.
    pub fn cleanup_after_scan(&self) -> CleanupSummary {
        let _phase = trace_phase(ScanPhase::Cleanup);
        let start = Instant::now();
        let mut summary = CleanupSummary::default();
        let mut redirtied = Vec::new();
        self.touched.for_each_set(0..self.touched.len(), |r| {
            let region = RegionIdx(r);
            summary.cards_reset += self.card_table.reset_claimed(region);
            self.card_table
                .redirty_deferred(region, |card| redirtied.push(card));
        });
        summary.cards_redirtied = redirtied.len();
        if !redirtied.is_empty() {
            self.dcqs.enqueue_cards(redirtied);
        }
        self.touched.clear_all();
        self.in_cset.clear_all();
        self.scan.lock().take();
        summary.duration = start.elapsed();
        summary
    }

    // Live data

    /// Build card live data from the mark bitmap. Returns `false` if
    /// aborted.
    pub fn create_live_data(&self, gang: &WorkGang) -> bool {
        self.live_data
            .create(gang, &self.heap, &self.marks, &self.should_abort)
    }

    /// Complete the live data at a safepoint. Returns the number of regions
    /// recomputed.
    pub fn finalize_live_data(&self, gang: &WorkGang) -> usize {
        self.live_data.finalize(gang, &self.heap, &self.marks)
    }

    /// Check the live data against a fresh computation.
    ///
    /// A mismatch is a bug and panics in debug builds.
    ///
    /// # Errors
    ///
    /// Returns the mismatching regions.
    pub fn verify_live_data(&self, gang: &WorkGang) -> Result<(), LiveDataMismatch> {
        let result = self.live_data.verify(gang, &self.heap, &self.marks);
        debug_assert!(result.is_ok(), "{result:?}");
        result
    }

    /// Clear the live data for the next cycle.
    pub fn clear_live_data(&self, gang: &WorkGang) {
        self.live_data.clear(gang);
    }

    /// Scrub every remembered set with the live data. Returns the number of
    /// cards removed.
    ///
    /// Call at a safepoint with refinement suspended: scrubbing unlinks
    /// fine tables that a concurrent insert may still be writing to.
    pub fn scrub_rem_sets(&self, gang: &WorkGang) -> usize {
        debug_assert!(self.is_at_safepoint(), "scrub outside a safepoint");
        let workers = gang.total_workers();
        let claimer = RegionClaimer::new(self.rem_sets.len(), workers);
        let removed = AtomicUsize::new(0);
        gang.run_task(
            &|worker: usize| {
                claimer.for_each_claimed(worker, |r| {
                    if !self.heap.region(RegionIdx(r)).is_free() {
                        let n = self.rem_sets[r].scrub(&self.live_data);
                        removed.fetch_add(n, Ordering::Relaxed);
                    }
                    true
                });
            },
            workers,
        );
        self.from_card_cache.clear();
        removed.into_inner()
    }

    // Reporting

    /// Occupancy of every remembered set of an allocated region.
    #[must_use]
    pub fn summary(&self) -> RemSetSummary {
        let mut summary = RemSetSummary {
            completed_buffers: self.dcqs.completed_buffers(),
            refinement: self.stats.snapshot(),
            ..RemSetSummary::default()
        };
        for region in self.heap.regions().filter(|r| !r.is_free()) {
            let rs = self.rem_set(region.index());
            summary.regions += 1;
            summary.sparse_cards += rs.sparse_cards();
            summary.fine_tables += rs.fine_tables();
            summary.fine_cards += rs.fine_cards();
            summary.coarse_sources += rs.coarse_sources();
            summary.coarsenings += rs.coarsenings();
            summary.mem_size += rs.mem_size();
        }
        summary
    }

    /// Every cross-region reference out of an old or humongous region that
    /// is neither remembered nor waiting for refinement.
    ///
    /// Empty whenever the remembered sets are sound. Only meaningful while
    /// no refinement or mutation is in flight.
    #[must_use]
    pub fn find_unremembered_refs(&self) -> Vec<UnrememberedRef> {
        struct Check<'a> {
            ctx: &'a RemSetContext,
            from: RegionIdx,
            missing: Vec<UnrememberedRef>,
        }

        impl OopVisitor for Check<'_> {
            fn do_oop<S: RefSlot>(&mut self, slot: &S) {
                let Some(referent) = slot.load() else {
                    return;
                };
                let Some(to) = self.ctx.heap.region_index_for(referent) else {
                    return;
                };
                if to == self.from || self.ctx.heap.region(to).is_free() {
                    return;
                }
                let card = self.ctx.card_table.card_for(slot.address());
                let pending = matches!(
                    self.ctx.card_table.state(card),
                    CardState::Dirty | CardState::Refining | CardState::Deferred
                );
                if !pending && !self.ctx.rem_set(to).contains(card) {
                    self.missing.push(UnrememberedRef {
                        slot: slot.address(),
                        referent,
                        card,
                    });
                }
            }
        }

        let mut check = Check {
            ctx: self,
            from: RegionIdx(0),
            missing: Vec::new(),
        };
        for region in self.heap.regions() {
            if region.is_free() || region.is_young() {
                continue;
            }
            check.from = region.index();
            self.heap.walk_objects(region.bottom(), region.top(), |obj, _| {
                self.heap.oops_in(obj, &mut check);
            });
        }
        check.missing
    }
}

impl std::fmt::Debug for RemSetContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemSetContext")
            .field("heap", &self.heap)
            .field("dcqs", &self.dcqs)
            .field("at_safepoint", &self.is_at_safepoint())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::RefWidth;

    fn ctx() -> RemSetContext {
        let mut config = RemSetConfig::new(16, 16);
        config.set_refinement_threads(0);
        config.set_parallel_workers(2);
        RemSetContext::new(config).unwrap()
    }

    #[test]
    fn test_write_then_refine_records_reference() {
        let ctx = ctx();
        let a = ctx.allocate_region(RegionKind::Old).unwrap();
        let b = ctx.allocate_region(RegionKind::Old).unwrap();
        let src = ctx.heap().allocate(a, 3, RefWidth::Narrow).unwrap();
        let dst = ctx.heap().allocate(b, 0, RefWidth::Wide).unwrap();
        let queue = ctx.new_mutator_queue();

        ctx.write_ref(&queue, src, 1, Some(dst));
        let card = ctx.card_table().card_for(src);
        assert_eq!(ctx.card_table().state(card), CardState::Dirty);
        assert_eq!(ctx.find_unremembered_refs(), Vec::new());

        queue.flush();
        assert_eq!(ctx.refine_pending_buffers(), 1);
        assert_eq!(ctx.card_table().state(card), CardState::Clean);
        assert!(ctx.rem_set(b).contains(card));
        assert!(ctx.rem_set(a).is_empty());
        assert!(ctx.find_unremembered_refs().is_empty());
    }

    #[test]
    fn test_same_region_reference_not_recorded() {
        let ctx = ctx();
        let a = ctx.allocate_region(RegionKind::Old).unwrap();
        let x = ctx.heap().allocate(a, 1, RefWidth::Wide).unwrap();
        let y = ctx.heap().allocate(a, 1, RefWidth::Wide).unwrap();
        let queue = ctx.new_mutator_queue();
        ctx.write_ref(&queue, x, 0, Some(y));
        queue.flush();
        ctx.refine_pending_buffers();
        assert!(ctx.rem_set(a).is_empty());
    }

    #[test]
    fn test_young_cards_are_filtered() {
        let ctx = ctx();
        let young = ctx.allocate_region(RegionKind::Young).unwrap();
        let old = ctx.allocate_region(RegionKind::Old).unwrap();
        let src = ctx.heap().allocate(young, 1, RefWidth::Wide).unwrap();
        let dst = ctx.heap().allocate(old, 0, RefWidth::Wide).unwrap();
        let queue = ctx.new_mutator_queue();
        ctx.write_ref(&queue, src, 0, Some(dst));
        assert_eq!(queue.pending(), 0);

        ctx.promote_region(young);
        assert_eq!(ctx.dirty_card_queue_set().completed_buffers(), 1);
        ctx.refine_pending_buffers();
        assert!(ctx.rem_set(old).contains(ctx.card_table().card_for(src)));
        ctx.write_ref(&queue, src, 0, Some(dst));
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn test_redirtied_card_stays_dirty() {
        let ctx = ctx();
        let a = ctx.allocate_region(RegionKind::Old).unwrap();
        let b = ctx.allocate_region(RegionKind::Old).unwrap();
        let src = ctx.heap().allocate(a, 1, RefWidth::Wide).unwrap();
        let dst = ctx.heap().allocate(b, 0, RefWidth::Wide).unwrap();
        let card = ctx.card_table().card_for(src);

        ctx.heap().store_ref(src, 0, Some(dst));
        assert_eq!(ctx.card_table().dirty(src), Some(card));
        assert!(ctx.card_table().try_claim_for_refinement(card));
        // A mutator store lands while the card is being refined.
        assert_eq!(ctx.card_table().dirty(src), Some(card));
        assert!(!ctx.card_table().finish_refinement(card));
        assert_eq!(ctx.card_table().state(card), CardState::Dirty);
        assert_eq!(
            ctx.refine_card_concurrently(card, 0),
            RefineOutcome::Cleaned
        );
        assert!(ctx.rem_set(b).contains(card));
    }

    #[test]
    fn test_refine_buffer_abort_requeues_rest() {
        let ctx = ctx();
        let a = ctx.allocate_region(RegionKind::Old).unwrap();
        let mut buffer = ctx.dirty_card_queue_set().allocate_buffer();
        let first = ctx.card_table().cards_in_region(a).start;
        for c in first..first + 5 {
            buffer.push(CardIdx(c));
        }
        let polls = std::cell::Cell::new(0);
        let done = ctx.refine_buffer(buffer, 0, || {
            polls.set(polls.get() + 1);
            polls.get() > 2
        });
        assert!(!done);
        let rest = ctx.dirty_card_queue_set().take_completed(0).unwrap();
        assert_eq!(rest.cards(), &[CardIdx(first + 2), CardIdx(first + 3), CardIdx(first + 4)]);
        assert_eq!(ctx.stats().snapshot().buffers_requeued, 1);
    }

    #[test]
    fn test_reclaim_purges_region() {
        let ctx = ctx();
        let a = ctx.allocate_region(RegionKind::Old).unwrap();
        let b = ctx.allocate_region(RegionKind::Old).unwrap();
        let src = ctx.heap().allocate(a, 1, RefWidth::Wide).unwrap();
        let dst = ctx.heap().allocate(b, 1, RefWidth::Wide).unwrap();
        let queue = ctx.new_mutator_queue();
        ctx.write_ref(&queue, src, 0, Some(dst));
        ctx.write_ref(&queue, dst, 0, Some(src));
        queue.flush();
        ctx.refine_pending_buffers();
        assert!(!ctx.rem_set(a).is_empty());
        assert!(!ctx.rem_set(b).is_empty());

        let generation = ctx.heap().region(a).generation();
        ctx.reclaim_region(a).unwrap();
        assert!(ctx.rem_set(a).is_empty());
        assert!(ctx.rem_set(b).is_empty());
        assert_eq!(ctx.heap().region(a).generation(), generation + 1);
    }
}
