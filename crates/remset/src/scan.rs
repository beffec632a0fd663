//! Pause-time remembered-set scanning.
//!
//! A pause finds every reference into the collection set that lives outside
//! it in two gang runs:
//!
//! 1. **Update**: drain every completed dirty-card buffer. References into
//!    the collection set go straight to the closure and hold the card back
//!    as deferred; the rest are recorded in the remembered sets.
//! 2. **Scan**: walk the remembered sets of the collection-set regions.
//!    Each worker starts at a different region and claims that region's
//!    iteration; once its own regions are done it helps with the others by
//!    claiming blocks of entries. Every card is claimed in the card table
//!    before it is walked, so a card listed by several remembered sets is
//!    scanned once.
//!
//! The update run finishes before the scan starts, so a scan claim can never
//! take a dirty card whose references were not recorded yet.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::card_table::CardIdx;
use crate::context::RemSetContext;
use crate::gc::claim::SubTasksDone;
use crate::heap::{Address, OopVisitor, RefSlot, RegionIdx};
use crate::metrics::ScanSummary;
use crate::remset::RemSetEntry;

/// Receives every reference into the collection set found by a pause.
pub trait ScanClosure: Sync {
    /// `slot` outside the collection set holds `referent`, which is inside
    /// it. `worker` is the gang partition that found it.
    fn do_reference(&self, worker: usize, slot: Address, referent: Address);
}

impl<F> ScanClosure for F
where
    F: Fn(usize, Address, Address) + Sync,
{
    fn do_reference(&self, worker: usize, slot: Address, referent: Address) {
        self(worker, slot, referent);
    }
}

#[derive(Debug, Default)]
struct WorkerCounters {
    buffers_updated: AtomicUsize,
    cards_updated: AtomicUsize,
    cards_deferred: AtomicUsize,
    cards_scanned: AtomicUsize,
    cards_claimed: AtomicUsize,
    cards_skipped: AtomicUsize,
    coarse_regions: AtomicUsize,
    refs_found: AtomicUsize,
}

fn bump(counter: &AtomicUsize, n: usize) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[derive(Debug)]
struct RegionScan {
    entries: Vec<RemSetEntry>,
    next_block: AtomicUsize,
}

/// Scan state of one pause, built by `RemSetContext::prepare_for_scan`.
#[derive(Debug)]
pub(crate) struct ScanState {
    regions: Box<[RegionScan]>,
    iter_claims: SubTasksDone,
    counters: Box<[CachePadded<WorkerCounters>]>,
    block_size: usize,
}

/// Hands references into the collection set to the closure.
struct CsetRefs<'a> {
    ctx: &'a RemSetContext,
    closure: &'a dyn ScanClosure,
    worker: usize,
    found: usize,
}

impl OopVisitor for CsetRefs<'_> {
    fn do_oop<S: RefSlot>(&mut self, slot: &S) {
        let Some(referent) = slot.load() else {
            return;
        };
        if self.ctx.is_in_cset_addr(referent) {
            self.closure.do_reference(self.worker, slot.address(), referent);
            self.found += 1;
        }
    }
}

impl ScanState {
    pub(crate) fn new(ctx: &RemSetContext, cset: &[RegionIdx], workers: usize) -> Self {
        let regions = cset
            .iter()
            .map(|&owner| {
                let mut entries = Vec::new();
                ctx.rem_set(owner).iterate(|entry| entries.push(entry));
                RegionScan {
                    entries,
                    next_block: AtomicUsize::new(0),
                }
            })
            .collect();
        Self {
            regions,
            iter_claims: SubTasksDone::new(cset.len()),
            counters: (0..workers).map(|_| CachePadded::default()).collect(),
            block_size: ctx.config().scan_block_size.max(1),
        }
    }

    pub(crate) fn workers(&self) -> usize {
        self.counters.len()
    }

    pub(crate) fn cset_regions(&self) -> usize {
        self.regions.len()
    }

    /// Update phase for one worker: drain completed buffers until none is
    /// left.
    pub(crate) fn update_rem_set(
        &self,
        ctx: &RemSetContext,
        worker: usize,
        closure: &dyn ScanClosure,
    ) {
        let counters = &self.counters[worker];
        let dcqs = ctx.dirty_card_queue_set();
        while let Some(buffer) = dcqs.take_completed(0) {
            bump(&counters.buffers_updated, 1);
            for &card in buffer.cards() {
                bump(&counters.cards_updated, 1);
                let (deferred, found) = ctx.refine_card_in_pause(card, worker, closure);
                if deferred {
                    bump(&counters.cards_deferred, 1);
                }
                bump(&counters.refs_found, found);
            }
            dcqs.recycle(buffer);
        }
    }

    /// Scan phase for one worker.
    pub(crate) fn scan_rem_set(&self, ctx: &RemSetContext, worker: usize, closure: &dyn ScanClosure) {
        let n = self.regions.len();
        if n == 0 {
            return;
        }
        let start = worker * n / self.workers().max(1);
        // Own regions first, then help with everybody else's.
        for k in 0..n {
            let i = (start + k) % n;
            if !self.iter_claims.is_task_claimed(i) {
                self.scan_blocks(ctx, i, worker, closure);
            }
        }
        for k in 0..n {
            self.scan_blocks(ctx, (start + k) % n, worker, closure);
        }
    }

    fn scan_blocks(&self, ctx: &RemSetContext, i: usize, worker: usize, closure: &dyn ScanClosure) {
        let region = &self.regions[i];
        let len = region.entries.len();
        loop {
            let first = region.next_block.fetch_add(self.block_size, Ordering::Relaxed);
            if first >= len {
                return;
            }
            let last = (first + self.block_size).min(len);
            for &entry in &region.entries[first..last] {
                self.scan_entry(ctx, entry, worker, closure);
            }
        }
    }

    fn scan_entry(
        &self,
        ctx: &RemSetContext,
        entry: RemSetEntry,
        worker: usize,
        closure: &dyn ScanClosure,
    ) {
        let counters = &self.counters[worker];
        match entry {
            RemSetEntry::Card(card) => self.scan_card(ctx, card, worker, closure),
            RemSetEntry::CoarseRegion(source) => {
                if !ctx.is_scannable_source(source) {
                    bump(&counters.cards_skipped, 1);
                    return;
                }
                bump(&counters.coarse_regions, 1);
                let region = ctx.heap().region(source);
                let top = region.top();
                if top == region.bottom() {
                    return;
                }
                let table = ctx.card_table();
                let first = table.cards_in_region(source).start;
                let last = table.card_for(top - 1).0;
                for card in first..=last {
                    self.scan_card(ctx, CardIdx(card), worker, closure);
                }
            }
        }
    }

    fn scan_card(&self, ctx: &RemSetContext, card: CardIdx, worker: usize, closure: &dyn ScanClosure) {
        let counters = &self.counters[worker];
        bump(&counters.cards_scanned, 1);
        let table = ctx.card_table();
        let source = table.region_of(card);
        if !ctx.is_scannable_source(source) || !table.claim_for_scan(card) {
            bump(&counters.cards_skipped, 1);
            return;
        }
        ctx.note_touched(source);
        bump(&counters.cards_claimed, 1);
        let mut refs = CsetRefs {
            ctx,
            closure,
            worker,
            found: 0,
        };
        ctx.heap()
            .oops_in_range(table.card_start(card), table.card_end(card), &mut refs);
        bump(&counters.refs_found, refs.found);
    }

    /// Sum of every worker's counters.
    pub(crate) fn summary(&self) -> ScanSummary {
        let mut summary = ScanSummary {
            cset_regions: self.regions.len(),
            ..ScanSummary::default()
        };
        for c in &*self.counters {
            let get = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
            summary.buffers_updated += get(&c.buffers_updated);
            summary.cards_updated += get(&c.cards_updated);
            summary.cards_deferred += get(&c.cards_deferred);
            summary.cards_scanned += get(&c.cards_scanned);
            summary.cards_claimed += get(&c.cards_claimed);
            summary.cards_skipped += get(&c.cards_skipped);
            summary.coarse_regions += get(&c.coarse_regions);
            summary.refs_found += get(&c.refs_found);
        }
        summary
    }
}

/// Visitor for in-pause refinement: references into the collection set go
/// to the closure, every other cross-region reference is recorded.
pub(crate) struct PauseRefine<'a> {
    pub(crate) ctx: &'a RemSetContext,
    pub(crate) closure: &'a dyn ScanClosure,
    pub(crate) worker: usize,
    pub(crate) from: RegionIdx,
    pub(crate) card: CardIdx,
    pub(crate) found: usize,
}

impl OopVisitor for PauseRefine<'_> {
    fn do_oop<S: RefSlot>(&mut self, slot: &S) {
        let Some(referent) = slot.load() else {
            return;
        };
        if self.ctx.is_in_cset_addr(referent) {
            self.closure.do_reference(self.worker, slot.address(), referent);
            self.found += 1;
        } else {
            let cache_slot = self.ctx.config().pause_cache_slot(self.worker);
            self.ctx.record_reference(self.from, self.card, referent, cache_slot);
        }
    }
}
