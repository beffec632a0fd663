//! Claim-once structures for dividing fixed work among gang workers.
//!
//! * [`SubTasksDone`] hands out `n` independent tasks in any order.
//! * [`SequentialSubTasksDone`] hands tasks out in index order from a counter.
//! * [`RegionClaimer`] claims every region once, with per-worker start offsets
//!   so workers begin in different parts of the heap.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Claim flags for `n` tasks plus an arrival counter for reuse.
#[derive(Debug)]
pub struct SubTasksDone {
    tasks: Box<[AtomicBool]>,
    threads_completed: AtomicUsize,
}

impl SubTasksDone {
    /// Create `n` unclaimed tasks.
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self {
            tasks: (0..n).map(|_| AtomicBool::new(false)).collect(),
            threads_completed: AtomicUsize::new(0),
        }
    }

    /// Number of tasks.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if there are no tasks.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Try to claim task `index`.
    ///
    /// Returns `false` to exactly one caller, which now owns the task; every
    /// other caller sees `true` ("already claimed").
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn is_task_claimed(&self, index: usize) -> bool {
        assert!(index < self.tasks.len(), "task {index} out of range");
        let flag = &self.tasks[index];
        if flag.load(Ordering::Relaxed) {
            return true;
        }
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
    }

    /// Record that the calling thread is done with this round.
    ///
    /// The last of `n_threads` arrivals resets every claim flag so the
    /// structure can be reused, and gets `true`.
    pub fn all_tasks_completed(&self, n_threads: usize) -> bool {
        let arrived = self.threads_completed.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(arrived <= n_threads, "more arrivals than threads");
        if arrived == n_threads {
            self.clear();
            return true;
        }
        false
    }

    fn clear(&self) {
        for task in &*self.tasks {
            task.store(false, Ordering::Relaxed);
        }
        self.threads_completed.store(0, Ordering::Release);
    }
}

/// Tasks claimed strictly in index order.
#[derive(Debug, Default)]
pub struct SequentialSubTasksDone {
    n_tasks: AtomicUsize,
    claimed: AtomicUsize,
    n_threads: AtomicUsize,
    threads_completed: AtomicUsize,
}

impl SequentialSubTasksDone {
    /// Create a claimer for `n_tasks` tasks shared by `n_threads` threads.
    #[must_use]
    pub const fn new(n_tasks: usize, n_threads: usize) -> Self {
        Self {
            n_tasks: AtomicUsize::new(n_tasks),
            claimed: AtomicUsize::new(0),
            n_threads: AtomicUsize::new(n_threads),
            threads_completed: AtomicUsize::new(0),
        }
    }

    /// Change the number of tasks for the next round.
    pub fn set_n_tasks(&self, n: usize) {
        self.n_tasks.store(n, Ordering::Release);
    }

    /// Change the number of participating threads for the next round.
    pub fn set_n_threads(&self, n: usize) {
        self.n_threads.store(n, Ordering::Release);
    }

    /// Claim the next unclaimed task, if any remain.
    pub fn try_claim_task(&self) -> Option<usize> {
        let n = self.n_tasks.load(Ordering::Acquire);
        let mut current = self.claimed.load(Ordering::Relaxed);
        while current < n {
            match self.claimed.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
        None
    }

    /// Record that the calling thread is done. The last thread resets the
    /// counters and gets `true`.
    pub fn all_tasks_completed(&self) -> bool {
        let arrived = self.threads_completed.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived == self.n_threads.load(Ordering::Acquire) {
            self.claimed.store(0, Ordering::Relaxed);
            self.threads_completed.store(0, Ordering::Release);
            return true;
        }
        false
    }
}

/// Claims each region index exactly once across a set of workers.
#[derive(Debug)]
pub struct RegionClaimer {
    claims: SubTasksDone,
    n_workers: usize,
}

impl RegionClaimer {
    /// Create a claimer over `n_regions` regions for `n_workers` workers.
    #[must_use]
    pub fn new(n_regions: usize, n_workers: usize) -> Self {
        Self {
            claims: SubTasksDone::new(n_regions),
            n_workers: n_workers.max(1),
        }
    }

    /// Region at which `worker` starts iterating.
    #[must_use]
    pub fn offset_for_worker(&self, worker: usize) -> usize {
        self.claims.len() * worker / self.n_workers
    }

    /// Claim region `index`. Returns `true` if the caller now owns it.
    #[must_use]
    pub fn claim_region(&self, index: usize) -> bool {
        !self.claims.is_task_claimed(index)
    }

    /// Visit every region claimed by `worker`, starting at its offset and
    /// wrapping around. Stops early when `f` returns `false`.
    pub fn for_each_claimed(&self, worker: usize, mut f: impl FnMut(usize) -> bool) {
        let n = self.claims.len();
        let start = self.offset_for_worker(worker);
        for k in 0..n {
            let index = (start + k) % n;
            if self.claim_region(index) && !f(index) {
                return;
            }
        }
    }
}
