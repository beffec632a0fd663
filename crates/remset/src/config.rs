//! Tunables for the remembered-set subsystem.
//!
//! Every numeric threshold here is a tuning knob, not a semantic requirement:
//! changing them trades memory and pause work against refinement overhead but
//! never affects soundness.

use std::fmt;

/// Default card size is `1 << 9` = 512 bytes.
pub const DEFAULT_CARD_SHIFT: u32 = 9;
/// Default region size is `1 << 20` = 1 MiB.
pub const DEFAULT_REGION_SHIFT: u32 = 20;
/// Default number of regions in the heap.
pub const DEFAULT_MAX_REGIONS: usize = 256;
/// Cards remembered per source region before it is promoted to a bitmap.
pub const DEFAULT_SPARSE_ENTRIES_PER_SOURCE: usize = 4;
/// Fine (bitmap) sources per owner before one of them is coarsened.
pub const DEFAULT_MAX_FINE_ENTRIES: usize = 64;
/// Buckets inspected when choosing a fine table to coarsen.
pub const DEFAULT_FINE_EVICTION_SAMPLE_SIZE: usize = 4;
/// Capacity of one dirty card buffer.
pub const DEFAULT_DIRTY_BUFFER_CAPACITY: usize = 256;
/// Number of concurrent refinement threads.
pub const DEFAULT_REFINEMENT_THREADS: usize = 2;
/// Completed buffers tolerated before refinement threads start.
pub const DEFAULT_GREEN_ZONE: usize = 4;
/// Number of pause-time parallel workers.
pub const DEFAULT_PARALLEL_WORKERS: usize = 4;
/// Remembered-set entries claimed at once by a scanning worker.
pub const DEFAULT_SCAN_BLOCK_SIZE: usize = 64;

/// Largest heap addressable with 32-bit word-scaled compressed references.
const MAX_COMPRESSED_HEAP: usize = (u32::MAX as usize) << 3;

/// Configuration for the remembered-set subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemSetConfig {
    /// log2 of the card size in bytes.
    pub card_shift: u32,
    /// log2 of the region size in bytes.
    pub region_shift: u32,
    /// Number of regions reserved for the heap.
    pub max_regions: usize,
    /// Per-source slots in the sparse representation.
    pub sparse_entries_per_source: usize,
    /// Maximum fine tables per owner region.
    pub max_fine_entries: usize,
    /// Non-empty buckets sampled when picking a coarsening victim.
    pub fine_eviction_sample_size: usize,
    /// Cards per dirty card buffer.
    pub dirty_buffer_capacity: usize,
    /// Concurrent refinement threads.
    pub refinement_threads: usize,
    /// Completed buffers below which refinement stays idle.
    pub green_zone: usize,
    /// Completed buffers at which every refinement thread is running.
    pub yellow_zone: usize,
    /// Completed buffers above which mutators refine their own buffers.
    pub red_zone: usize,
    /// Workers used by pause-time gang tasks.
    pub parallel_workers: usize,
    /// Entries claimed per step while scanning a remembered set.
    pub scan_block_size: usize,
}

impl Default for RemSetConfig {
    fn default() -> Self {
        Self {
            card_shift: DEFAULT_CARD_SHIFT,
            region_shift: DEFAULT_REGION_SHIFT,
            max_regions: DEFAULT_MAX_REGIONS,
            sparse_entries_per_source: DEFAULT_SPARSE_ENTRIES_PER_SOURCE,
            max_fine_entries: DEFAULT_MAX_FINE_ENTRIES,
            fine_eviction_sample_size: DEFAULT_FINE_EVICTION_SAMPLE_SIZE,
            dirty_buffer_capacity: DEFAULT_DIRTY_BUFFER_CAPACITY,
            refinement_threads: DEFAULT_REFINEMENT_THREADS,
            green_zone: DEFAULT_GREEN_ZONE,
            yellow_zone: DEFAULT_GREEN_ZONE * 3,
            red_zone: DEFAULT_GREEN_ZONE * 6,
            parallel_workers: DEFAULT_PARALLEL_WORKERS,
            scan_block_size: DEFAULT_SCAN_BLOCK_SIZE,
        }
    }
}

impl RemSetConfig {
    /// Create a configuration with the given heap geometry and default tunables.
    #[must_use]
    pub fn new(region_shift: u32, max_regions: usize) -> Self {
        Self {
            region_shift,
            max_regions,
            ..Default::default()
        }
    }

    /// Card size in bytes.
    #[must_use]
    pub const fn card_size(&self) -> usize {
        1 << self.card_shift
    }

    /// Region size in bytes.
    #[must_use]
    pub const fn region_size(&self) -> usize {
        1 << self.region_shift
    }

    /// Number of cards covering one region.
    #[must_use]
    pub const fn cards_per_region(&self) -> usize {
        1 << (self.region_shift - self.card_shift)
    }

    /// Total heap size in bytes.
    #[must_use]
    pub const fn heap_size(&self) -> usize {
        self.max_regions << self.region_shift
    }

    /// Number of from-card cache slots: one per refinement thread, one per
    /// pause worker, and one shared by mutators doing assisted refinement.
    #[must_use]
    pub const fn from_card_cache_slots(&self) -> usize {
        self.refinement_threads + self.parallel_workers + 1
    }

    /// Cache slot used by mutator-assisted refinement.
    #[must_use]
    pub const fn mutator_cache_slot(&self) -> usize {
        self.refinement_threads + self.parallel_workers
    }

    /// Cache slot used by pause worker `worker`.
    #[must_use]
    pub const fn pause_cache_slot(&self, worker: usize) -> usize {
        self.refinement_threads + worker
    }

    /// Set the refinement zones from a green zone, using the usual
    /// yellow = 3 x green and red = 6 x green ratios.
    #[must_use]
    pub const fn with_zones(mut self, green: usize) -> Self {
        self.green_zone = green;
        self.yellow_zone = green * 3;
        self.red_zone = green * 6;
        self
    }

    /// Set the per-source sparse capacity.
    pub const fn set_sparse_entries_per_source(&mut self, entries: usize) {
        self.sparse_entries_per_source = entries;
    }

    /// Set the maximum number of fine tables per owner.
    pub const fn set_max_fine_entries(&mut self, entries: usize) {
        self.max_fine_entries = entries;
    }

    /// Set the number of concurrent refinement threads.
    pub const fn set_refinement_threads(&mut self, threads: usize) {
        self.refinement_threads = threads;
    }

    /// Set the number of pause-time workers (at least one).
    pub const fn set_parallel_workers(&mut self, workers: usize) {
        self.parallel_workers = if workers < 1 { 1 } else { workers };
    }

    /// Set the dirty card buffer capacity.
    pub const fn set_dirty_buffer_capacity(&mut self, capacity: usize) {
        self.dirty_buffer_capacity = capacity;
    }

    /// Check the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let word_shift = usize::BITS.trailing_zeros() - 3;
        if self.card_shift < word_shift + 3 || self.card_shift > 16 {
            return Err(ConfigError::CardShift(self.card_shift));
        }
        // Fine bitmaps and live-data clearing work on whole 64-bit words.
        if self.region_shift < self.card_shift + 6 || self.region_shift > 30 {
            return Err(ConfigError::RegionShift(self.region_shift));
        }
        match self.max_regions.checked_mul(self.region_size()) {
            Some(size) if self.max_regions != 0 && size <= MAX_COMPRESSED_HEAP => {}
            _ => return Err(ConfigError::HeapSize(self.max_regions)),
        }
        if self.sparse_entries_per_source == 0 {
            return Err(ConfigError::Zero("sparse_entries_per_source"));
        }
        if self.max_fine_entries == 0 {
            return Err(ConfigError::Zero("max_fine_entries"));
        }
        if self.fine_eviction_sample_size == 0 {
            return Err(ConfigError::Zero("fine_eviction_sample_size"));
        }
        if self.dirty_buffer_capacity == 0 {
            return Err(ConfigError::Zero("dirty_buffer_capacity"));
        }
        if self.parallel_workers == 0 {
            return Err(ConfigError::Zero("parallel_workers"));
        }
        if self.scan_block_size == 0 {
            return Err(ConfigError::Zero("scan_block_size"));
        }
        if self.green_zone > self.yellow_zone || self.yellow_zone > self.red_zone {
            return Err(ConfigError::Zones {
                green: self.green_zone,
                yellow: self.yellow_zone,
                red: self.red_zone,
            });
        }
        Ok(())
    }
}

/// A violated [`RemSetConfig`] constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Card shift outside the supported range.
    CardShift(u32),
    /// Region shift too small for whole-word card bitmaps, or too large.
    RegionShift(u32),
    /// Heap empty, overflowing, or too large for compressed references.
    HeapSize(usize),
    /// A count that must be positive was zero.
    Zero(&'static str),
    /// Refinement zones not ordered green <= yellow <= red.
    Zones {
        /// Green zone.
        green: usize,
        /// Yellow zone.
        yellow: usize,
        /// Red zone.
        red: usize,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CardShift(s) => write!(f, "card shift {s} out of range"),
            Self::RegionShift(s) => {
                write!(f, "region shift {s} must cover at least 64 cards and at most 1 GiB")
            }
            Self::HeapSize(n) => write!(f, "heap of {n} regions is empty or too large"),
            Self::Zero(name) => write!(f, "{name} must be greater than zero"),
            Self::Zones { green, yellow, red } => write!(
                f,
                "refinement zones must satisfy green <= yellow <= red (got {green}/{yellow}/{red})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
