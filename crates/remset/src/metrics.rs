//! Remembered-set metrics and statistics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Cumulative refinement counters, shared by refinement threads, mutators
/// and pause workers.
#[derive(Debug, Default)]
pub struct RefinementStats {
    cards_refined: AtomicUsize,
    cards_skipped: AtomicUsize,
    cards_redirtied: AtomicUsize,
    refs_recorded: AtomicUsize,
    cache_hits: AtomicUsize,
    buffers_by_workers: AtomicUsize,
    buffers_by_mutators: AtomicUsize,
    buffers_requeued: AtomicUsize,
}

macro_rules! counter {
    ($record:ident, $add:ident, $field:ident) => {
        #[inline]
        pub(crate) fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        #[allow(dead_code)]
        pub(crate) fn $add(&self, n: usize) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl RefinementStats {
    /// Create zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cards_refined: AtomicUsize::new(0),
            cards_skipped: AtomicUsize::new(0),
            cards_redirtied: AtomicUsize::new(0),
            refs_recorded: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
            buffers_by_workers: AtomicUsize::new(0),
            buffers_by_mutators: AtomicUsize::new(0),
            buffers_requeued: AtomicUsize::new(0),
        }
    }

    counter!(record_card_refined, add_cards_refined, cards_refined);
    counter!(record_card_skipped, add_cards_skipped, cards_skipped);
    counter!(record_card_redirtied, add_cards_redirtied, cards_redirtied);
    counter!(record_ref, add_refs, refs_recorded);
    counter!(record_cache_hit, add_cache_hits, cache_hits);
    counter!(record_worker_buffer, add_worker_buffers, buffers_by_workers);
    counter!(record_mutator_buffer, add_mutator_buffers, buffers_by_mutators);
    counter!(record_requeued_buffer, add_requeued_buffers, buffers_requeued);

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> RefinementSnapshot {
        RefinementSnapshot {
            cards_refined: self.cards_refined.load(Ordering::Relaxed),
            cards_skipped: self.cards_skipped.load(Ordering::Relaxed),
            cards_redirtied: self.cards_redirtied.load(Ordering::Relaxed),
            refs_recorded: self.refs_recorded.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            buffers_by_workers: self.buffers_by_workers.load(Ordering::Relaxed),
            buffers_by_mutators: self.buffers_by_mutators.load(Ordering::Relaxed),
            buffers_requeued: self.buffers_requeued.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`RefinementStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefinementSnapshot {
    /// Cards claimed and scanned by concurrent refinement.
    pub cards_refined: usize,
    /// Cards dropped without scanning: not dirty, young or free.
    pub cards_skipped: usize,
    /// Cards re-dirtied by a mutator while being refined.
    pub cards_redirtied: usize,
    /// New remembered-set entries created.
    pub refs_recorded: usize,
    /// Inserts skipped by the from-card cache.
    pub cache_hits: usize,
    /// Buffers processed by refinement threads.
    pub buffers_by_workers: usize,
    /// Buffers processed by mutators in the red zone.
    pub buffers_by_mutators: usize,
    /// Partially processed buffers put back after an abort.
    pub buffers_requeued: usize,
}

/// Totals of one remembered-set scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Collection-set regions scanned.
    pub cset_regions: usize,
    /// Completed buffers drained by the update phase.
    pub buffers_updated: usize,
    /// Cards refined by the update phase.
    pub cards_updated: usize,
    /// Cards kept back because they reference the collection set.
    pub cards_deferred: usize,
    /// Remembered cards visited.
    pub cards_scanned: usize,
    /// Cards claimed and walked.
    pub cards_claimed: usize,
    /// Cards dropped: already claimed, in the collection set, young or free.
    pub cards_skipped: usize,
    /// Coarse entries expanded to whole regions.
    pub coarse_regions: usize,
    /// References into the collection set handed to the closure.
    pub refs_found: usize,
    /// Wall time of the update phase.
    pub update_duration: Duration,
    /// Wall time of the scan phase.
    pub scan_duration: Duration,
}

/// Result of cleaning up after a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Claimed cards reset to clean.
    pub cards_reset: usize,
    /// Deferred cards made dirty again and re-enqueued.
    pub cards_redirtied: usize,
    /// Wall time of the cleanup.
    pub duration: Duration,
}

/// Occupancy of every remembered set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemSetSummary {
    /// Allocated regions.
    pub regions: usize,
    /// Cards held in sparse lists.
    pub sparse_cards: usize,
    /// Live fine tables.
    pub fine_tables: usize,
    /// Cards held in fine tables.
    pub fine_cards: usize,
    /// Coarse source bits set.
    pub coarse_sources: usize,
    /// Fine tables coarsened so far.
    pub coarsenings: usize,
    /// Approximate bytes used by the remembered sets.
    pub mem_size: usize,
    /// Completed buffers waiting for refinement.
    pub completed_buffers: usize,
    /// Refinement counters.
    pub refinement: RefinementSnapshot,
}

/// Times the three phases of a pause.
///
/// # Example
///
/// ```
/// use remset::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... drain dirty cards ...
/// timer.end_update();
/// timer.start();
/// // ... scan remembered sets ...
/// timer.end_scan();
/// assert!(timer.cleanup.is_zero());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    /// Update-remembered-set phase.
    pub update: Duration,
    /// Scan phase.
    pub scan: Duration,
    /// Cleanup phase.
    pub cleanup: Duration,
    current_start: Option<Instant>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTimer {
    /// Create a timer with every duration zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            update: Duration::ZERO,
            scan: Duration::ZERO,
            cleanup: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End the update phase.
    pub fn end_update(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.update = start.elapsed();
        }
    }

    /// End the scan phase.
    pub fn end_scan(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.scan = start.elapsed();
        }
    }

    /// End the cleanup phase.
    pub fn end_cleanup(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.cleanup = start.elapsed();
        }
    }
}
