//! # Lock Ordering Discipline
//!
//! The subsystem is almost entirely lock-free; the few locks it does take
//! must be acquired in increasing level to rule out circular waits.
//!
//! | Level | Lock                | Description                                 |
//! |-------|---------------------|---------------------------------------------|
//! | 1     | `RegionRemSet`      | Per-region remembered-set slow path         |
//! | 1     | `QueueRegistry`     | Registered mutator dirty card queues        |
//! | 2     | `RefinementMonitor` | Refinement worker activation and suspension |
//! | 3     | `GangQueue`         | Work gang task queue                        |
//!
//! Same-level locks may be taken in any order relative to each other. A lower
//! level must never be acquired while a higher level is held: no code path may
//! touch a remembered set while holding the refinement monitor, for instance.
//!
//! In debug builds every acquisition site creates a [`LockGuard`] which checks
//! the order against a thread-local stack and panics on a violation. Release
//! builds compile the checks away.
//!
//! ```ignore
//! let _order = LockGuard::new(LockOrder::RegionRemSet);
//! let state = self.locked.lock();
//! ```

#[cfg(debug_assertions)]
use std::cell::RefCell;

#[cfg(debug_assertions)]
const MAX_LOCK_DEPTH: usize = 8;

#[cfg(debug_assertions)]
thread_local!(static HELD_LEVELS: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)));

/// Lock order tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    /// Per-region remembered-set lock (level 1).
    RegionRemSet = 1,
    /// Dirty card queue registry (level 1).
    QueueRegistry = 2,
    /// Refinement monitor (level 2).
    RefinementMonitor = 3,
    /// Work gang queue (level 3).
    GangQueue = 4,
}

impl LockOrder {
    /// Unique value of this tag.
    #[must_use]
    pub const fn order_value(self) -> u8 {
        self as u8
    }

    /// Acquisition level of this tag.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::RegionRemSet | Self::QueueRegistry => 1,
            Self::RefinementMonitor => 2,
            Self::GangQueue => 3,
        }
    }
}

/// RAII marker recording that a lock of the given order is held.
///
/// Create it immediately before taking the lock and keep it alive for as
/// long as the lock guard lives.
#[must_use = "LockGuard must be held for the duration of the critical section"]
pub struct LockGuard {
    _tag: LockOrder,
}

impl LockGuard {
    /// Validate and record acquisition of `tag`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if a higher-level lock is already held.
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            let _ = HELD_LEVELS.try_with(|held| {
                let mut held = held.borrow_mut();
                if let Some(&highest) = held.iter().max() {
                    assert!(
                        tag.level() >= highest,
                        "Lock ordering violation: {tag:?} (level {}) acquired while holding level {highest}",
                        tag.level(),
                    );
                }
                held.push(tag.level());
            });
        }
        Self { _tag: tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = HELD_LEVELS.try_with(|held| {
            held.borrow_mut().pop();
        });
    }
}

/// Highest lock level held by the current thread (0 if none, or in release
/// builds).
#[must_use]
pub fn held_level() -> u8 {
    #[cfg(debug_assertions)]
    {
        HELD_LEVELS
            .try_with(|held| held.borrow().iter().copied().max().unwrap_or(0))
            .unwrap_or(0)
    }
    #[cfg(not(debug_assertions))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::{held_level, LockGuard, LockOrder};

    #[test]
    fn test_lock_order_levels() {
        assert_eq!(LockOrder::RegionRemSet.level(), 1);
        assert_eq!(LockOrder::QueueRegistry.level(), 1);
        assert_eq!(LockOrder::RefinementMonitor.level(), 2);
        assert_eq!(LockOrder::GangQueue.level(), 3);
        assert_eq!(LockOrder::GangQueue.order_value(), 4);
    }

    #[test]
    fn test_increasing_order_allowed() {
        let _g1 = LockGuard::new(LockOrder::RegionRemSet);
        let _g2 = LockGuard::new(LockOrder::QueueRegistry);
        let _g3 = LockGuard::new(LockOrder::RefinementMonitor);
        let _g4 = LockGuard::new(LockOrder::GangQueue);
    }

    #[test]
    fn test_same_level_any_order() {
        let _g1 = LockGuard::new(LockOrder::QueueRegistry);
        let _g2 = LockGuard::new(LockOrder::RegionRemSet);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_downgrade_panics() {
        let _g1 = LockGuard::new(LockOrder::RefinementMonitor);
        let _g2 = LockGuard::new(LockOrder::RegionRemSet);
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_state_restored_after_drop() {
        {
            let _g1 = LockGuard::new(LockOrder::GangQueue);
            assert_eq!(held_level(), 3);
        }
        assert_eq!(held_level(), 0);
        let _g2 = LockGuard::new(LockOrder::RegionRemSet);
        assert_eq!(held_level(), 1);
    }
}
