//! Dirty card queues.
//!
//! Every mutator owns a [`DirtyCardQueue`]: a registered [`BufferSlot`] into
//! which the write barrier appends newly dirtied cards. A full buffer is
//! published to the [`DirtyCardQueueSet`]'s lock-free completed queue, where
//! refinement threads pick it up.
//!
//! A buffer has exactly one owner at any time. Ownership moves by atomically
//! swapping the boxed buffer pointer in and out of a slot, or by pushing it
//! through a lock-free queue; it is never copied.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::card_table::CardIdx;
use crate::config::RemSetConfig;
use crate::gc::sync::{LockGuard, LockOrder};
use crate::refine::RefinementMonitor;

/// Fixed-capacity buffer of dirty cards.
#[derive(Debug)]
pub struct CardBuffer {
    cards: Vec<CardIdx>,
    capacity: usize,
}

impl CardBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cards: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a card. Returns `true` once the buffer is full.
    pub fn push(&mut self, card: CardIdx) -> bool {
        debug_assert!(!self.is_full(), "push into full card buffer");
        self.cards.push(card);
        self.is_full()
    }

    /// Returns `true` if no more cards fit.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.cards.len() >= self.capacity
    }

    /// Number of cards held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Returns `true` if the buffer holds no cards.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Cards held, oldest first.
    #[must_use]
    pub fn cards(&self) -> &[CardIdx] {
        &self.cards
    }

    /// Drop the first `n` cards, keeping the rest.
    pub fn consume(&mut self, n: usize) {
        self.cards.drain(..n.min(self.cards.len()));
    }

    /// Drop every card.
    pub fn clear(&mut self) {
        self.cards.clear();
    }
}

/// Single-owner slot holding at most one buffer.
#[derive(Debug)]
pub struct BufferSlot {
    ptr: AtomicPtr<CardBuffer>,
}

impl Default for BufferSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferSlot {
    /// Create an empty slot.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Take the buffer out of the slot.
    pub fn take(&self) -> Option<Box<CardBuffer>> {
        let raw = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        // SAFETY: non-null pointers in a slot always come from
        // `Box::into_raw` in `put`, and the swap made us the only owner.
        (!raw.is_null()).then(|| unsafe { Box::from_raw(raw) })
    }

    /// Put `buffer` into the slot, returning whatever was there before.
    pub fn put(&self, buffer: Box<CardBuffer>) -> Option<Box<CardBuffer>> {
        let old = self.ptr.swap(Box::into_raw(buffer), Ordering::AcqRel);
        // SAFETY: as in `take`.
        (!old.is_null()).then(|| unsafe { Box::from_raw(old) })
    }

    /// Returns `true` if the slot holds no buffer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ptr.load(Ordering::Acquire).is_null()
    }
}

impl Drop for BufferSlot {
    fn drop(&mut self) {
        drop(self.take());
    }
}

/// Refinement zones, in completed buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zones {
    /// Refinement starts above this.
    pub green: usize,
    /// Every refinement thread runs above this.
    pub yellow: usize,
    /// Mutators refine their own buffers above this.
    pub red: usize,
}

/// Shared state of all dirty card queues.
pub struct DirtyCardQueueSet {
    completed: SegQueue<Box<CardBuffer>>,
    n_completed: AtomicUsize,
    free: SegQueue<Box<CardBuffer>>,
    buffer_capacity: usize,
    zones: Zones,
    registry: Mutex<Vec<Arc<BufferSlot>>>,
    monitor: RefinementMonitor,
}

impl DirtyCardQueueSet {
    /// Create an empty queue set sized by `config`.
    #[must_use]
    pub fn new(config: &RemSetConfig) -> Self {
        Self {
            completed: SegQueue::new(),
            n_completed: AtomicUsize::new(0),
            free: SegQueue::new(),
            buffer_capacity: config.dirty_buffer_capacity,
            zones: Zones {
                green: config.green_zone,
                yellow: config.yellow_zone,
                red: config.red_zone,
            },
            registry: Mutex::new(Vec::new()),
            monitor: RefinementMonitor::new(),
        }
    }

    /// Refinement zones.
    #[must_use]
    pub const fn zones(&self) -> Zones {
        self.zones
    }

    /// Capacity of each buffer.
    #[must_use]
    pub const fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub(crate) const fn monitor(&self) -> &RefinementMonitor {
        &self.monitor
    }

    /// Number of completed buffers waiting for refinement.
    #[must_use]
    pub fn completed_buffers(&self) -> usize {
        self.n_completed.load(Ordering::Acquire)
    }

    /// Returns `true` once mutators must refine their own buffers.
    #[must_use]
    pub fn is_red(&self) -> bool {
        self.completed_buffers() > self.zones.red
    }

    /// Get an empty buffer, recycling one if available.
    #[must_use]
    pub fn allocate_buffer(&self) -> Box<CardBuffer> {
        self.free
            .pop()
            .unwrap_or_else(|| Box::new(CardBuffer::new(self.buffer_capacity)))
    }

    /// Return a processed buffer to the free list.
    pub fn recycle(&self, mut buffer: Box<CardBuffer>) {
        buffer.clear();
        self.free.push(buffer);
    }

    /// Publish a full buffer.
    ///
    /// Above the red zone the buffer is handed back instead: the caller must
    /// refine it itself and then [`recycle`](Self::recycle) it.
    #[must_use = "a returned buffer must be refined by the caller"]
    pub fn enqueue_completed(&self, buffer: Box<CardBuffer>) -> Option<Box<CardBuffer>> {
        if buffer.is_empty() {
            self.recycle(buffer);
            return None;
        }
        if self.is_red() {
            return Some(buffer);
        }
        self.enqueue_completed_unconditionally(buffer);
        None
    }

    /// Publish a buffer regardless of zones.
    pub fn enqueue_completed_unconditionally(&self, buffer: Box<CardBuffer>) {
        if buffer.is_empty() {
            self.recycle(buffer);
            return;
        }
        // Count before pushing so the counter never undercounts a pop.
        let n = self.n_completed.fetch_add(1, Ordering::AcqRel) + 1;
        self.completed.push(buffer);
        if n > self.zones.green {
            self.monitor.notify();
        }
    }

    /// Take a completed buffer if more than `stop_at` are queued.
    pub fn take_completed(&self, stop_at: usize) -> Option<Box<CardBuffer>> {
        if self.completed_buffers() <= stop_at {
            return None;
        }
        let buffer = self.completed.pop()?;
        self.n_completed.fetch_sub(1, Ordering::AcqRel);
        Some(buffer)
    }

    /// Publish `cards` in as many buffers as needed.
    pub fn enqueue_cards(&self, cards: impl IntoIterator<Item = CardIdx>) {
        let mut buffer = self.allocate_buffer();
        for card in cards {
            if buffer.push(card) {
                self.enqueue_completed_unconditionally(buffer);
                buffer = self.allocate_buffer();
            }
        }
        self.enqueue_completed_unconditionally(buffer);
    }

    fn register(&self) -> Arc<BufferSlot> {
        let slot = Arc::new(BufferSlot::new());
        let _order = LockGuard::new(LockOrder::QueueRegistry);
        self.registry.lock().push(Arc::clone(&slot));
        slot
    }

    fn unregister(&self, slot: &Arc<BufferSlot>) {
        let _order = LockGuard::new(LockOrder::QueueRegistry);
        self.registry.lock().retain(|s| !Arc::ptr_eq(s, slot));
    }

    /// Number of registered mutator queues.
    #[must_use]
    pub fn registered_queues(&self) -> usize {
        let _order = LockGuard::new(LockOrder::QueueRegistry);
        self.registry.lock().len()
    }

    fn for_each_slot(&self, mut f: impl FnMut(&BufferSlot)) {
        let slots: Vec<Arc<BufferSlot>> = {
            let _order = LockGuard::new(LockOrder::QueueRegistry);
            self.registry.lock().clone()
        };
        for slot in &slots {
            f(slot);
        }
    }

    /// Move every mutator's partial buffer into the completed queue.
    ///
    /// Called at a safepoint so the pause sees every dirtied card.
    pub fn concatenate_logs(&self) {
        self.for_each_slot(|slot| {
            if let Some(buffer) = slot.take() {
                self.enqueue_completed_unconditionally(buffer);
            }
        });
    }

    /// Discard every pending card, completed or partial. Returns the number
    /// of cards dropped.
    ///
    /// Only valid when the card table is reset as well, e.g. after a full
    /// collection.
    pub fn abandon_logs(&self) -> usize {
        let mut dropped = 0;
        while let Some(buffer) = self.take_completed(0) {
            dropped += buffer.len();
            self.recycle(buffer);
        }
        self.for_each_slot(|slot| {
            if let Some(buffer) = slot.take() {
                dropped += buffer.len();
                self.recycle(buffer);
            }
        });
        dropped
    }
}

impl std::fmt::Debug for DirtyCardQueueSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyCardQueueSet")
            .field("completed", &self.completed_buffers())
            .field("zones", &self.zones)
            .finish_non_exhaustive()
    }
}

/// A mutator's dirty card queue.
///
/// Dropping the queue publishes its partial buffer.
#[derive(Debug)]
pub struct DirtyCardQueue {
    set: Arc<DirtyCardQueueSet>,
    slot: Arc<BufferSlot>,
}

impl DirtyCardQueue {
    /// Register a new queue with `set`.
    #[must_use]
    pub fn new(set: &Arc<DirtyCardQueueSet>) -> Self {
        Self {
            set: Arc::clone(set),
            slot: set.register(),
        }
    }

    /// Append `card`.
    ///
    /// If this fills the buffer while the set is in the red zone, the full
    /// buffer is returned for the caller to refine.
    #[must_use = "a returned buffer must be refined by the caller"]
    pub fn enqueue(&self, card: CardIdx) -> Option<Box<CardBuffer>> {
        let mut buffer = self
            .slot
            .take()
            .unwrap_or_else(|| self.set.allocate_buffer());
        if buffer.push(card) {
            return self.set.enqueue_completed(buffer);
        }
        if let Some(stray) = self.slot.put(buffer) {
            self.set.enqueue_completed_unconditionally(stray);
        }
        None
    }

    /// Cards in the partial buffer.
    #[must_use]
    pub fn pending(&self) -> usize {
        match self.slot.take() {
            Some(buffer) => {
                let n = buffer.len();
                if let Some(stray) = self.slot.put(buffer) {
                    self.set.enqueue_completed_unconditionally(stray);
                }
                n
            }
            None => 0,
        }
    }

    /// Publish the partial buffer.
    pub fn flush(&self) {
        if let Some(buffer) = self.slot.take() {
            self.set.enqueue_completed_unconditionally(buffer);
        }
    }
}

impl Drop for DirtyCardQueue {
    fn drop(&mut self) {
        self.flush();
        self.set.unregister(&self.slot);
    }
}
