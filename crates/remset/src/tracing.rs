//! Remembered-set tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans for collection pauses and their remembered-set phases, plus events
//! for refinement activity, coarsening and live-data recomputation.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use crate::heap::RegionIdx;
    use crate::metrics::ScanSummary;

    /// Remembered-set phases of a pause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ScanPhase {
        /// Drain dirty cards into the remembered sets.
        UpdateRemSet,
        /// Scan remembered cards for references into the collection set.
        ScanRemSet,
        /// Reset card claims and re-dirty deferred cards.
        Cleanup,
    }

    /// Identifier correlating every event of one pause.
    ///
    /// Monotonically increasing, starting at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PauseId(pub u64);

    static NEXT_PAUSE_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next pause ID.
    pub fn next_pause_id() -> PauseId {
        PauseId(NEXT_PAUSE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a whole pause.
    pub fn trace_pause(pause_id: PauseId, cset_regions: usize) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "remset_pause",
            pause_id = pause_id.0,
            cset_regions
        )
        .entered()
    }

    /// Span covering one phase of a pause.
    pub fn trace_phase(phase: ScanPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "remset_phase", phase = ?phase).entered()
    }

    /// A refinement thread started or stopped.
    pub fn log_refinement_activation(worker: usize, completed_buffers: usize, active: bool) {
        tracing::trace!(worker, completed_buffers, active, "refinement_activation");
    }

    /// A fine table was replaced by a coarse bit.
    pub fn log_coarsening(owner: RegionIdx, source: RegionIdx, occupied: usize) {
        tracing::debug!(owner = owner.0, source = source.0, occupied, "coarsen");
    }

    /// Per-pause scan totals.
    pub fn log_scan_summary(summary: &ScanSummary) {
        tracing::debug!(
            cards_scanned = summary.cards_scanned,
            cards_claimed = summary.cards_claimed,
            cards_skipped = summary.cards_skipped,
            coarse_regions = summary.coarse_regions,
            refs_found = summary.refs_found,
            buffers_updated = summary.buffers_updated,
            "scan_summary"
        );
    }

    /// Live data had to be recomputed for some regions.
    pub fn log_live_data_recompute(regions: usize, reason: &'static str) {
        tracing::debug!(regions, reason, "live_data_recompute");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    use crate::heap::RegionIdx;
    use crate::metrics::ScanSummary;

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ScanPhase {
        /// Drain dirty cards into the remembered sets.
        UpdateRemSet,
        /// Scan remembered cards.
        ScanRemSet,
        /// Reset card claims.
        Cleanup,
    }

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PauseId(pub u64);

    /// Stub span guard.
    #[derive(Debug)]
    pub struct NoSpan;

    /// Stub function when tracing is disabled.
    pub const fn next_pause_id() -> PauseId {
        PauseId(0)
    }

    /// Stub function when tracing is disabled.
    pub const fn trace_pause(_pause_id: PauseId, _cset_regions: usize) -> NoSpan {
        NoSpan
    }

    /// Stub function when tracing is disabled.
    pub const fn trace_phase(_phase: ScanPhase) -> NoSpan {
        NoSpan
    }

    /// Stub function when tracing is disabled.
    pub const fn log_refinement_activation(_worker: usize, _completed: usize, _active: bool) {}

    /// Stub function when tracing is disabled.
    pub const fn log_coarsening(_owner: RegionIdx, _source: RegionIdx, _occupied: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_scan_summary(_summary: &ScanSummary) {}

    /// Stub function when tracing is disabled.
    pub const fn log_live_data_recompute(_regions: usize, _reason: &'static str) {}
}

pub use internal::PauseId;
