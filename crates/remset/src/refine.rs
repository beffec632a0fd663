//! Concurrent refinement threads.
//!
//! Refinement threads turn dirty cards back into remembered-set entries while
//! mutators run. They are activated in steps as completed buffers pile up:
//!
//! * below the green zone every thread sleeps; the pause will handle the
//!   remaining buffers;
//! * thread `i` wakes once the backlog exceeds its activation threshold and
//!   goes back to sleep when it falls to its deactivation threshold;
//! * at the yellow zone every thread is running;
//! * above the red zone mutators refine their own buffers as well.
//!
//! [`ConcurrentRefine::suspend`] stops all threads before a pause; work in
//! progress is cut short at the next card and the rest of the buffer is
//! re-queued.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::context::RemSetContext;
use crate::dirty_card_queue::Zones;
use crate::gc::sync::{LockGuard, LockOrder};
use crate::tracing::internal::log_refinement_activation;

#[derive(Debug, Default)]
struct MonitorState {
    shutdown: bool,
    suspended: bool,
    active: usize,
}

/// Monitor refinement threads sleep on.
///
/// Owned by the dirty card queue set, which notifies it when completed
/// buffers are published.
#[derive(Debug, Default)]
pub struct RefinementMonitor {
    state: Mutex<MonitorState>,
    changed: Condvar,
    abort: AtomicBool,
}

impl RefinementMonitor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wake every sleeping refinement thread so it re-checks its threshold.
    pub(crate) fn notify(&self) {
        let _order = LockGuard::new(LockOrder::RefinementMonitor);
        let _state = self.state.lock();
        self.changed.notify_all();
    }

    /// Returns `true` while refinement is being suspended.
    pub(crate) fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

/// Per-thread activation thresholds, in completed buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Start refining above this.
    pub activation: usize,
    /// Stop refining at or below this.
    pub deactivation: usize,
}

impl Thresholds {
    /// Thresholds for thread `worker` of `n_threads`.
    #[must_use]
    pub fn for_worker(zones: Zones, n_threads: usize, worker: usize) -> Self {
        let step = (zones.yellow - zones.green) / (n_threads + 1);
        let activation = (zones.green + step * (worker + 1)).min(zones.yellow);
        Self {
            activation,
            deactivation: activation.saturating_sub(step).max(zones.green),
        }
    }
}

/// Handle on the running refinement threads.
///
/// Dropping it stops and joins them.
pub struct ConcurrentRefine {
    ctx: Arc<RemSetContext>,
    workers: Vec<JoinHandle<()>>,
}

impl ConcurrentRefine {
    /// Start `config.refinement_threads` refinement threads for `ctx`.
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned.
    pub fn start(ctx: &Arc<RemSetContext>) -> io::Result<Self> {
        let n = ctx.config().refinement_threads;
        let zones = ctx.dirty_card_queue_set().zones();
        let mut refine = Self {
            ctx: Arc::clone(ctx),
            workers: Vec::with_capacity(n),
        };
        for worker in 0..n {
            let ctx = Arc::clone(ctx);
            let thresholds = Thresholds::for_worker(zones, n, worker);
            let handle = thread::Builder::new()
                .name(format!("remset-refine#{worker}"))
                .spawn(move || refine_loop(&ctx, worker, thresholds))?;
            refine.workers.push(handle);
        }
        Ok(refine)
    }

    /// Number of refinement threads.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Number of threads currently refining.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        let monitor = self.ctx.dirty_card_queue_set().monitor();
        let _order = LockGuard::new(LockOrder::RefinementMonitor);
        let active = monitor.state.lock().active;
        active
    }

    /// Stop every thread and wait until none is refining.
    ///
    /// Buffers being processed are cut short and re-queued.
    pub fn suspend(&self) {
        let monitor = self.ctx.dirty_card_queue_set().monitor();
        monitor.abort.store(true, Ordering::Release);
        let _order = LockGuard::new(LockOrder::RefinementMonitor);
        let mut state = monitor.state.lock();
        state.suspended = true;
        while state.active > 0 {
            monitor.changed.wait(&mut state);
        }
    }

    /// Let threads run again after [`suspend`](Self::suspend).
    pub fn resume(&self) {
        let monitor = self.ctx.dirty_card_queue_set().monitor();
        monitor.abort.store(false, Ordering::Release);
        let _order = LockGuard::new(LockOrder::RefinementMonitor);
        monitor.state.lock().suspended = false;
        monitor.changed.notify_all();
    }
}

fn refine_loop(ctx: &RemSetContext, worker: usize, thresholds: Thresholds) {
    let dcqs = ctx.dirty_card_queue_set();
    let monitor = dcqs.monitor();
    loop {
        {
            let _order = LockGuard::new(LockOrder::RefinementMonitor);
            let mut state = monitor.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if !state.suspended
                    && !ctx.should_abort()
                    && dcqs.completed_buffers() > thresholds.activation
                {
                    break;
                }
                monitor.changed.wait(&mut state);
            }
            state.active += 1;
        }
        log_refinement_activation(worker, dcqs.completed_buffers(), true);

        let abort = || monitor.abort_requested() || ctx.should_abort();
        while !abort() {
            let Some(buffer) = dcqs.take_completed(thresholds.deactivation) else {
                break;
            };
            ctx.stats().record_worker_buffer();
            if !ctx.refine_buffer(buffer, worker, abort) {
                break;
            }
        }

        log_refinement_activation(worker, dcqs.completed_buffers(), false);
        let _order = LockGuard::new(LockOrder::RefinementMonitor);
        monitor.state.lock().active -= 1;
        monitor.changed.notify_all();
    }
}

impl Drop for ConcurrentRefine {
    fn drop(&mut self) {
        let monitor = self.ctx.dirty_card_queue_set().monitor();
        {
            let _order = LockGuard::new(LockOrder::RefinementMonitor);
            monitor.state.lock().shutdown = true;
        }
        monitor.abort.store(true, Ordering::Release);
        monitor.changed.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        monitor.abort.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for ConcurrentRefine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentRefine")
            .field("threads", &self.workers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_step_up_to_yellow() {
        let zones = Zones {
            green: 4,
            yellow: 16,
            red: 24,
        };
        let t: Vec<_> = (0..3).map(|i| Thresholds::for_worker(zones, 3, i)).collect();
        assert_eq!(t[0], Thresholds { activation: 7, deactivation: 4 });
        assert_eq!(t[1], Thresholds { activation: 10, deactivation: 7 });
        assert_eq!(t[2], Thresholds { activation: 13, deactivation: 10 });
    }

    #[test]
    fn test_thresholds_zero_zones_drain_everything() {
        let zones = Zones {
            green: 0,
            yellow: 0,
            red: 0,
        };
        let t = Thresholds::for_worker(zones, 2, 1);
        assert_eq!(t, Thresholds { activation: 0, deactivation: 0 });
    }
}
