//! Fixed pool of long-lived worker threads that execute partitioned tasks.
//!
//! [`WorkGang::run_task`] splits a [`GangTask`] into `n` partitions, queues
//! one `(task, partition)` item per partition, and blocks until every item has
//! run. Workers sleep on a condition variable between tasks.
//!
//! Because the initiator never returns before the last partition finished,
//! tasks may borrow from the initiator's stack.

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use super::sync::{LockGuard, LockOrder};

/// A unit of parallel work divisible into independent partitions.
pub trait GangTask: Sync {
    /// Task name, used in thread diagnostics.
    fn name(&self) -> &str {
        "gang task"
    }

    /// Execute partition `partition`. Called exactly once per partition.
    fn work(&self, partition: usize);
}

impl<F> GangTask for F
where
    F: Fn(usize) + Sync,
{
    fn work(&self, partition: usize) {
        self(partition);
    }
}

type Panic = Box<dyn Any + Send + 'static>;

/// Completion state of one `run_task` call.
struct RunState {
    remaining: Mutex<usize>,
    finished: Condvar,
    panic: Mutex<Option<Panic>>,
}

impl RunState {
    fn new(partitions: usize) -> Self {
        Self {
            remaining: Mutex::new(partitions),
            finished: Condvar::new(),
            panic: Mutex::new(None),
        }
    }

    fn finish(&self, panicked: Option<Panic>) {
        if let Some(payload) = panicked {
            self.panic.lock().get_or_insert(payload);
        }
        let mut remaining = self.remaining.lock();
        *remaining -= 1;
        if *remaining == 0 {
            self.finished.notify_all();
        }
    }

    fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.finished.wait(&mut remaining);
        }
    }
}

/// One queued partition. The task pointer has its lifetime erased; it stays
/// valid because `run_task` outlives every item it queued.
struct WorkItem {
    task: *const (dyn GangTask + 'static),
    partition: usize,
    run: Arc<RunState>,
}

// SAFETY: the task is `Sync`, and the pointer is only dereferenced while the
// initiating `run_task` call is blocked waiting for this item.
unsafe impl Send for WorkItem {}

struct GangQueue {
    items: VecDeque<WorkItem>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<GangQueue>,
    work_available: Condvar,
}

/// A named pool of worker threads.
pub struct WorkGang {
    name: String,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkGang {
    /// Spawn a gang of `workers` threads (at least one).
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned.
    pub fn new(name: &str, workers: usize) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(GangQueue {
                items: VecDeque::new(),
                shutdown: false,
            }),
            work_available: Condvar::new(),
        });
        let mut gang = Self {
            name: name.to_owned(),
            shared,
            workers: Vec::with_capacity(workers.max(1)),
        };
        for id in 0..workers.max(1) {
            let shared = Arc::clone(&gang.shared);
            let handle = thread::Builder::new()
                .name(format!("{name}#{id}"))
                .spawn(move || worker_loop(&shared))?;
            gang.workers.push(handle);
        }
        Ok(gang)
    }

    /// Gang name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of worker threads.
    #[must_use]
    pub fn total_workers(&self) -> usize {
        self.workers.len()
    }

    /// Run `task` split into `partitions` parts and wait for all of them.
    ///
    /// Each partition in `0..partitions` is executed exactly once by some
    /// worker. Must not be called from inside a gang task of the same gang.
    ///
    /// # Panics
    ///
    /// If any partition panics, the remaining partitions still run and the
    /// first panic payload is resumed on the calling thread.
    pub fn run_task(&self, task: &dyn GangTask, partitions: usize) {
        if partitions == 0 {
            return;
        }
        let run = Arc::new(RunState::new(partitions));
        let erased: *const (dyn GangTask + '_) = task;
        // SAFETY: only the lifetime changes; the pointer is dereferenced by
        // workers strictly before `run.wait()` below returns.
        let erased: *const (dyn GangTask + 'static) = unsafe { std::mem::transmute(erased) };
        {
            let _order = LockGuard::new(LockOrder::GangQueue);
            let mut queue = self.shared.queue.lock();
            queue.items.extend((0..partitions).map(|partition| WorkItem {
                task: erased,
                partition,
                run: Arc::clone(&run),
            }));
        }
        self.shared.work_available.notify_all();
        run.wait();
        let panicked = run.panic.lock().take();
        if let Some(payload) = panicked {
            panic::resume_unwind(payload);
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let item = {
            let _order = LockGuard::new(LockOrder::GangQueue);
            let mut queue = shared.queue.lock();
            loop {
                if let Some(item) = queue.items.pop_front() {
                    break item;
                }
                if queue.shutdown {
                    return;
                }
                shared.work_available.wait(&mut queue);
            }
        };
        // SAFETY: `run_task` is blocked until this item reports completion.
        let task = unsafe { &*item.task };
        let result = panic::catch_unwind(AssertUnwindSafe(|| task.work(item.partition)));
        item.run.finish(result.err());
    }
}

impl Drop for WorkGang {
    fn drop(&mut self) {
        {
            let _order = LockGuard::new(LockOrder::GangQueue);
            self.shared.queue.lock().shutdown = true;
        }
        self.shared.work_available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for WorkGang {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGang")
            .field("name", &self.name)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::WorkGang;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    #[cfg(debug_assertions)]
    fn test_drop_takes_queue_lock_in_order() {
        use crate::gc::sync::{held_level, LockGuard, LockOrder};

        let gang = WorkGang::new("drop", 2).unwrap();
        gang.run_task(&|_p: usize| {}, 4);
        {
            // Shutdown runs under the gang queue level, which is the highest.
            let _outer = LockGuard::new(LockOrder::RefinementMonitor);
            drop(gang);
            assert_eq!(held_level(), 2);
        }
        assert_eq!(held_level(), 0);
    }

    #[test]
    fn test_every_partition_runs_once() {
        let gang = WorkGang::new("test", 4).unwrap();
        let hits: Vec<AtomicUsize> = (0..32).map(|_| AtomicUsize::new(0)).collect();
        gang.run_task(
            &|p: usize| {
                hits[p].fetch_add(1, Ordering::Relaxed);
            },
            32,
        );
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn test_borrowed_state_visible_after_return() {
        let gang = WorkGang::new("test", 2).unwrap();
        let seen = Mutex::new(Vec::new());
        gang.run_task(&|p: usize| seen.lock().unwrap().push(p), 5);
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_partitions_is_noop() {
        let gang = WorkGang::new("test", 1).unwrap();
        gang.run_task(&|_: usize| unreachable!(), 0);
        assert_eq!(gang.total_workers(), 1);
    }

    #[test]
    fn test_panic_resumed_after_all_partitions() {
        let gang = WorkGang::new("test", 3).unwrap();
        let done = AtomicUsize::new(0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            gang.run_task(
                &|p: usize| {
                    if p == 1 {
                        panic!("partition failed");
                    }
                    done.fetch_add(1, Ordering::Relaxed);
                },
                6,
            );
        }));
        assert!(result.is_err());
        assert_eq!(done.load(Ordering::Relaxed), 5);

        // The gang stays usable after a panicking task.
        let after = AtomicUsize::new(0);
        gang.run_task(
            &|_: usize| {
                after.fetch_add(1, Ordering::Relaxed);
            },
            3,
        );
        assert_eq!(after.load(Ordering::Relaxed), 3);
    }
}
