//! Region-based remembered sets and concurrent card refinement.
//!
//! `remset` is the cross-region reference tracking engine of a generational,
//! regionalized garbage collector. It lets a collector find every reference
//! into the regions it is about to evacuate without scanning the whole heap.
//!
//! # Overview
//!
//! - **Card table and write barrier**: every reference store dirties the
//!   card holding the slot and logs it on the mutator's
//!   [`DirtyCardQueue`].
//! - **Concurrent refinement**: [`ConcurrentRefine`] threads drain completed
//!   card buffers, record each cross-region reference in the target region's
//!   [`RememberedSet`], and clean the card. Thresholds on the backlog decide
//!   how many threads run; past the red zone mutators help.
//! - **Remembered sets**: per owner region, a sparse card list per source,
//!   escalating to a per-source card bitmap and finally to a single coarse
//!   bit, so memory stays bounded while no reference is ever lost.
//! - **Pause scan**: [`RemSetContext::oops_into_collection_set_do`] drains
//!   the remaining dirty cards and walks the remembered sets of the
//!   collection set on a [`WorkGang`], handing every reference into the
//!   collection set to a [`ScanClosure`].
//! - **Card live data**: after marking, per-card liveness lets
//!   [`RemSetContext::scrub_rem_sets`] drop entries that cannot hold live
//!   references.
//!
//! The object model is a small region heap ([`heap`]) standing in for the
//! collector's own.
//!
//! # Quick Start
//!
//! ```
//! use remset::{RefWidth, RegionKind, RemSetConfig, RemSetContext, WorkGang};
//!
//! let mut config = RemSetConfig::new(16, 8);
//! config.set_parallel_workers(2);
//! let ctx = RemSetContext::new(config).unwrap();
//! let gang = WorkGang::new("pause", 2).unwrap();
//!
//! let old = ctx.allocate_region(RegionKind::Old).unwrap();
//! let young = ctx.allocate_region(RegionKind::Young).unwrap();
//! let holder = ctx.heap().allocate(old, 1, RefWidth::Wide).unwrap();
//! let target = ctx.heap().allocate(young, 0, RefWidth::Wide).unwrap();
//!
//! let queue = ctx.new_mutator_queue();
//! ctx.write_ref(&queue, holder, 0, Some(target));
//!
//! ctx.enter_safepoint();
//! ctx.prepare_for_scan(&[young]);
//! let found = std::sync::Mutex::new(Vec::new());
//! ctx.oops_into_collection_set_do(&gang, &|_worker: usize, slot: usize, referent: usize| {
//!     found.lock().unwrap().push((slot, referent));
//! });
//! ctx.cleanup_after_scan();
//! ctx.leave_safepoint();
//!
//! assert_eq!(found.into_inner().unwrap().len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod card_table;
pub mod config;
mod context;
pub mod dirty_card_queue;
pub mod gc;
pub mod live_data;
pub mod metrics;
pub mod refine;
pub mod remset;
mod scan;
mod tracing;

/// Region heap model: regions, objects and reference slots.
///
/// Stands in for the collector's object layer; the remembered-set engine
/// only uses the lookups it exposes.
pub mod heap;

pub use card_table::{CardIdx, CardState, CardTable};
pub use config::{ConfigError, RemSetConfig};
pub use context::{RefineOutcome, RemSetContext, UnrememberedRef};
pub use dirty_card_queue::{CardBuffer, DirtyCardQueue, DirtyCardQueueSet, Zones};
pub use gc::{GangTask, RegionClaimer, SequentialSubTasksDone, SubTasksDone, WorkGang};
pub use heap::{Address, Heap, OopVisitor, RefSlot, RefWidth, Region, RegionIdx, RegionKind};
pub use live_data::{CardLiveData, LiveDataMismatch};
pub use metrics::{CleanupSummary, RefinementSnapshot, RemSetSummary, ScanSummary};
pub use refine::{ConcurrentRefine, Thresholds};
pub use remset::{RemSetEntry, RememberedSet, Representation};
pub use scan::ScanClosure;
pub use crate::tracing::PauseId;
