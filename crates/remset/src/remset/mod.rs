//! Per-region remembered sets.
//!
//! A [`RememberedSet`] belongs to one *owner* region and records, per *source*
//! region, which cards of the source may hold references into the owner.
//! Each source is tracked in exactly one of three representations, escalating
//! as it gains cards:
//!
//! 1. **Sparse**: a short list of cards, under the owner's lock.
//! 2. **Fine**: a [`PerRegionTable`] bitmap with one bit per card of the
//!    source. Fine tables live in a small hash of bucket chains that readers
//!    traverse without locking; unlinked tables are reclaimed through
//!    `crossbeam::epoch` once no reader can still see them.
//! 3. **Coarse**: one bit for the whole source in a [`CoarseMap`].
//!
//! Escalation never forgets that a source references the owner; it only
//! loses card precision. When an owner has more fine tables than allowed, the
//! most occupied of a few sampled tables is coarsened: its coarse bit is set
//! *before* the table is unlinked, so a concurrent lookup always finds the
//! source in at least one representation.

pub mod coarse;
pub mod fine;
pub mod from_card_cache;
pub mod sparse;

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::epoch::{self, Atomic, Guard, Owned};
use parking_lot::{Mutex, MutexGuard};

pub use coarse::CoarseMap;
pub use fine::PerRegionTable;
pub use from_card_cache::FromCardCache;
pub use sparse::{SparseAdd, SparseTable};

use crate::card_table::CardIdx;
use crate::config::RemSetConfig;
use crate::gc::sync::{LockGuard, LockOrder};
use crate::heap::RegionIdx;
use crate::live_data::CardLiveData;

/// How a source region is currently remembered by an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Representation {
    /// Exact card list.
    Sparse,
    /// Exact card bitmap.
    Fine,
    /// Whole-region bit.
    Coarse,
}

/// One remembered entry, as produced by [`RememberedSet::iterate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemSetEntry {
    /// A single card that may reference the owner.
    Card(CardIdx),
    /// Any card of this region may reference the owner.
    CoarseRegion(RegionIdx),
}

/// Sizing shared by every remembered set of a heap.
#[derive(Debug, Clone, Copy)]
pub struct RemSetGeometry {
    /// Cards per region.
    pub cards_per_region: usize,
    /// Regions in the heap.
    pub n_regions: usize,
    /// Sparse slots per source.
    pub sparse_entries_per_source: usize,
    /// Fine tables allowed per owner.
    pub max_fine_entries: usize,
    /// Non-empty buckets sampled when choosing a coarsening victim.
    pub eviction_sample_size: usize,
}

impl From<&RemSetConfig> for RemSetGeometry {
    fn from(config: &RemSetConfig) -> Self {
        Self {
            cards_per_region: config.cards_per_region(),
            n_regions: config.max_regions,
            sparse_entries_per_source: config.sparse_entries_per_source,
            max_fine_entries: config.max_fine_entries,
            eviction_sample_size: config.fine_eviction_sample_size,
        }
    }
}

struct FineNode {
    table: PerRegionTable,
    next: Atomic<FineNode>,
}

struct Locked {
    sparse: SparseTable,
    eviction_cursor: usize,
}

/// The remembered set of one owner region.
pub struct RememberedSet {
    owner: RegionIdx,
    geometry: RemSetGeometry,
    coarse: CoarseMap,
    buckets: Box<[Atomic<FineNode>]>,
    n_fine: AtomicUsize,
    coarsenings: AtomicUsize,
    locked: Mutex<Locked>,
}

impl RememberedSet {
    /// Create an empty remembered set for `owner`.
    #[must_use]
    pub fn new(owner: RegionIdx, geometry: RemSetGeometry) -> Self {
        let n_buckets = geometry.max_fine_entries.next_power_of_two();
        Self {
            owner,
            geometry,
            coarse: CoarseMap::new(geometry.n_regions),
            buckets: (0..n_buckets).map(|_| Atomic::null()).collect(),
            n_fine: AtomicUsize::new(0),
            coarsenings: AtomicUsize::new(0),
            locked: Mutex::new(Locked {
                sparse: SparseTable::new(geometry.sparse_entries_per_source),
                eviction_cursor: 0,
            }),
        }
    }

    /// Owner region.
    #[must_use]
    pub const fn owner(&self) -> RegionIdx {
        self.owner
    }

    fn lock(&self) -> (LockGuard, MutexGuard<'_, Locked>) {
        let order = LockGuard::new(LockOrder::RegionRemSet);
        (order, self.locked.lock())
    }

    #[inline]
    fn bucket_of(&self, source: RegionIdx) -> usize {
        source.0 & (self.buckets.len() - 1)
    }

    #[inline]
    const fn source_of(&self, card: CardIdx) -> RegionIdx {
        RegionIdx(card.0 / self.geometry.cards_per_region)
    }

    fn find_fine<'g>(&self, source: RegionIdx, guard: &'g Guard) -> Option<&'g PerRegionTable> {
        let mut cur = self.buckets[self.bucket_of(source)].load(Ordering::Acquire, guard);
        // SAFETY: nodes are only freed through `defer_destroy` after being
        // unlinked, so anything reachable under `guard` is still allocated.
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.table.source() == source {
                return Some(&node.table);
            }
            cur = node.next.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Record that `card` of region `from` may reference the owner.
    ///
    /// Returns `true` if the set changed. Adding an entry that is already
    /// covered, exactly or coarsely, is a no-op.
    pub fn add_reference(&self, from: RegionIdx, card: CardIdx) -> bool {
        debug_assert_eq!(self.source_of(card), from, "card not in source region");
        if self.coarse.contains(from) {
            return false;
        }
        let guard = epoch::pin();
        if let Some(table) = self.find_fine(from, &guard) {
            return table.add_card(card);
        }

        let (_order, mut locked) = self.lock();
        if self.coarse.contains(from) {
            return false;
        }
        if let Some(table) = self.find_fine(from, &guard) {
            return table.add_card(card);
        }
        match locked.sparse.add_card(from, card) {
            SparseAdd::Added => true,
            SparseAdd::Present => false,
            SparseAdd::Overflow => {
                if self.n_fine.load(Ordering::Acquire) >= self.geometry.max_fine_entries {
                    self.coarsen_victim(&mut locked, &guard);
                }
                let table = PerRegionTable::new(
                    from,
                    from.0 * self.geometry.cards_per_region,
                    self.geometry.cards_per_region,
                );
                for &c in locked.sparse.cards(from) {
                    table.add_card(c);
                }
                table.add_card(card);
                self.link_fine(table, &guard);
                locked.sparse.remove(from);
                true
            }
        }
    }

    fn link_fine(&self, table: PerRegionTable, guard: &Guard) {
        let head = &self.buckets[self.bucket_of(table.source())];
        let node = Owned::new(FineNode {
            table,
            next: Atomic::null(),
        });
        node.next.store(head.load(Ordering::Relaxed, guard), Ordering::Relaxed);
        head.store(node, Ordering::Release);
        self.n_fine.fetch_add(1, Ordering::AcqRel);
    }

    /// Unlink the fine table of `source`. Caller holds the lock.
    fn unlink_fine(&self, source: RegionIdx, guard: &Guard) -> bool {
        let mut link = &self.buckets[self.bucket_of(source)];
        loop {
            let cur = link.load(Ordering::Acquire, guard);
            // SAFETY: see `find_fine`.
            let Some(node) = (unsafe { cur.as_ref() }) else {
                return false;
            };
            if node.table.source() == source {
                link.store(node.next.load(Ordering::Acquire, guard), Ordering::Release);
                // SAFETY: the node is no longer reachable from the buckets;
                // readers that already hold it are pinned.
                unsafe { guard.defer_destroy(cur) };
                self.n_fine.fetch_sub(1, Ordering::AcqRel);
                return true;
            }
            link = &node.next;
        }
    }

    /// Pick the most occupied table among sampled buckets and coarsen it.
    fn coarsen_victim(&self, locked: &mut Locked, guard: &Guard) {
        let n = self.buckets.len();
        let mut victim: Option<(RegionIdx, usize)> = None;
        let mut sampled = 0;
        let mut next_cursor = (locked.eviction_cursor + 1) % n;
        for k in 0..n {
            let b = (locked.eviction_cursor + k) % n;
            let mut cur = self.buckets[b].load(Ordering::Acquire, guard);
            let mut non_empty = false;
            // SAFETY: see `find_fine`.
            while let Some(node) = unsafe { cur.as_ref() } {
                non_empty = true;
                let occupied = node.table.occupied();
                if victim.is_none_or(|(_, best)| occupied > best) {
                    victim = Some((node.table.source(), occupied));
                }
                cur = node.next.load(Ordering::Acquire, guard);
            }
            if non_empty {
                sampled += 1;
                if sampled >= self.geometry.eviction_sample_size {
                    next_cursor = (b + 1) % n;
                    break;
                }
            }
        }
        locked.eviction_cursor = next_cursor;
        let Some((source, occupied)) = victim else {
            return;
        };
        self.coarse.insert(source);
        self.unlink_fine(source, guard);
        self.coarsenings.fetch_add(1, Ordering::Relaxed);
        crate::tracing::internal::log_coarsening(self.owner, source, occupied);
    }

    /// Returns `true` if `card` is remembered, exactly or coarsely.
    #[must_use]
    pub fn contains(&self, card: CardIdx) -> bool {
        let source = self.source_of(card);
        if self.coarse.contains(source) {
            return true;
        }
        let guard = epoch::pin();
        if let Some(table) = self.find_fine(source, &guard) {
            return table.contains(card);
        }
        // The source may have been promoted or coarsened since the probe.
        let (_order, locked) = self.lock();
        locked.sparse.contains(source, card)
            || self.coarse.contains(source)
            || self
                .find_fine(source, &guard)
                .is_some_and(|t| t.contains(card))
    }

    /// Current representation of `source`, or `None` if it is not
    /// remembered.
    #[must_use]
    pub fn representation_of(&self, source: RegionIdx) -> Option<Representation> {
        if self.coarse.contains(source) {
            return Some(Representation::Coarse);
        }
        if self.find_fine(source, &epoch::pin()).is_some() {
            return Some(Representation::Fine);
        }
        let (_order, locked) = self.lock();
        locked
            .sparse
            .contains_source(source)
            .then_some(Representation::Sparse)
    }

    /// Visit every entry: exact cards first, then coarse regions.
    ///
    /// The visitor runs without the lock held.
    pub fn iterate(&self, mut visitor: impl FnMut(RemSetEntry)) {
        let sparse: Vec<CardIdx> = {
            let (_order, locked) = self.lock();
            locked.sparse.iter().map(|(_, c)| c).collect()
        };
        for card in sparse {
            visitor(RemSetEntry::Card(card));
        }
        self.for_each_fine(|table| table.for_each_card(|c| visitor(RemSetEntry::Card(c))));
        self.coarse
            .for_each(|source| visitor(RemSetEntry::CoarseRegion(source)));
    }

    /// Visit every remembered card, expanding coarse sources to all of their
    /// cards.
    pub fn for_each_card(&self, mut visitor: impl FnMut(CardIdx)) {
        let per_region = self.geometry.cards_per_region;
        self.iterate(|entry| match entry {
            RemSetEntry::Card(card) => visitor(card),
            RemSetEntry::CoarseRegion(source) => {
                let first = source.0 * per_region;
                (first..first + per_region).for_each(|c| visitor(CardIdx(c)));
            }
        });
    }

    fn for_each_fine(&self, mut f: impl FnMut(&PerRegionTable)) {
        let guard = epoch::pin();
        for bucket in &*self.buckets {
            let mut cur = bucket.load(Ordering::Acquire, &guard);
            // SAFETY: see `find_fine`.
            while let Some(node) = unsafe { cur.as_ref() } {
                f(&node.table);
                cur = node.next.load(Ordering::Acquire, &guard);
            }
        }
    }

    /// Number of remembered cards, counting a coarse source as all of its
    /// cards.
    #[must_use]
    pub fn occupied(&self) -> usize {
        let sparse = self.lock().1.sparse.occupied();
        let mut fine = 0;
        self.for_each_fine(|t| fine += t.occupied());
        sparse + fine + self.coarse.len() * self.geometry.cards_per_region
    }

    /// Returns `true` if [`occupied`](Self::occupied) is at most `limit`,
    /// stopping early once the limit is exceeded.
    #[must_use]
    pub fn occupancy_less_or_equal_than(&self, limit: usize) -> bool {
        let mut total = self.coarse.len() * self.geometry.cards_per_region;
        if total > limit {
            return false;
        }
        total += self.lock().1.sparse.occupied();
        if total > limit {
            return false;
        }
        self.for_each_fine(|t| total += t.occupied());
        total <= limit
    }

    /// Returns `true` if nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.coarse.is_empty()
            && self.n_fine.load(Ordering::Acquire) == 0
            && self.lock().1.sparse.occupied() == 0
    }

    /// Number of fine tables.
    #[must_use]
    pub fn fine_tables(&self) -> usize {
        self.n_fine.load(Ordering::Acquire)
    }

    /// Number of coarse sources.
    #[must_use]
    pub fn coarse_sources(&self) -> usize {
        self.coarse.len()
    }

    /// Number of sparse cards.
    #[must_use]
    pub fn sparse_cards(&self) -> usize {
        self.lock().1.sparse.occupied()
    }

    /// Number of cards held in fine tables.
    #[must_use]
    pub fn fine_cards(&self) -> usize {
        let mut fine = 0;
        self.for_each_fine(|t| fine += t.occupied());
        fine
    }

    /// Fine tables coarsened since creation.
    #[must_use]
    pub fn coarsenings(&self) -> usize {
        self.coarsenings.load(Ordering::Relaxed)
    }

    /// Approximate bytes used.
    #[must_use]
    pub fn mem_size(&self) -> usize {
        let mut fine = 0;
        self.for_each_fine(|t| fine += t.mem_size());
        std::mem::size_of::<Self>()
            + self.buckets.len() * std::mem::size_of::<Atomic<FineNode>>()
            + self.coarse.mem_size()
            + self.lock().1.sparse.mem_size()
            + fine
    }

    /// Forget `source` in every representation.
    pub fn clear_incoming_entry(&self, source: RegionIdx) {
        let (_order, mut locked) = self.lock();
        locked.sparse.remove(source);
        self.unlink_fine(source, &epoch::pin());
        self.coarse.remove(source);
    }

    /// Forget everything.
    pub fn clear(&self) {
        let (_order, mut locked) = self.lock();
        locked.sparse.clear();
        locked.eviction_cursor = 0;
        let guard = epoch::pin();
        for bucket in &*self.buckets {
            let mut cur = bucket.swap(epoch::Shared::null(), Ordering::AcqRel, &guard);
            // SAFETY: the chain is unreachable once the bucket is swapped out.
            while let Some(node) = unsafe { cur.as_ref() } {
                let next = node.next.load(Ordering::Acquire, &guard);
                // SAFETY: each node is reachable from exactly one link.
                unsafe { guard.defer_destroy(cur) };
                cur = next;
            }
        }
        self.n_fine.store(0, Ordering::Release);
        self.coarse.clear();
    }

    /// Drop entries that `live` proves cannot hold live references: cards
    /// without live objects and sources without any live object. Fine tables
    /// left empty are freed.
    ///
    /// Returns the number of cards removed, counting coarse sources as all of
    /// their cards.
    pub fn scrub(&self, live: &CardLiveData) -> usize {
        let per_region = self.geometry.cards_per_region;
        let (_order, mut locked) = self.lock();
        let mut removed = locked.sparse.retain(
            |source| live.is_region_live(source),
            |card| live.is_card_live(card),
        );

        let guard = epoch::pin();
        let mut dead = Vec::new();
        self.for_each_fine(|table| {
            let before = table.occupied();
            let after = if live.is_region_live(table.source()) {
                live.remove_nonlive_cards(table)
            } else {
                0
            };
            removed += before.saturating_sub(after);
            if after == 0 {
                dead.push(table.source());
            }
        });
        for source in dead {
            self.unlink_fine(source, &guard);
        }

        removed += live.remove_nonlive_regions(&self.coarse) * per_region;
        removed
    }
}

impl Drop for RememberedSet {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can reach the chains.
        let guard = unsafe { epoch::unprotected() };
        for bucket in &*self.buckets {
            let mut cur = bucket.load(Ordering::Relaxed, guard);
            while !cur.is_null() {
                // SAFETY: every node was created by `Owned::new` and is
                // reachable from exactly one link.
                let node = unsafe { cur.into_owned() };
                cur = node.next.load(Ordering::Relaxed, guard);
            }
        }
    }
}

impl std::fmt::Debug for RememberedSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RememberedSet")
            .field("owner", &self.owner)
            .field("fine_tables", &self.fine_tables())
            .field("coarse_sources", &self.coarse_sources())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 128 cards per region, 16 regions.
    fn geometry(sparse: usize, fine: usize) -> RemSetGeometry {
        RemSetGeometry {
            cards_per_region: 128,
            n_regions: 16,
            sparse_entries_per_source: sparse,
            max_fine_entries: fine,
            eviction_sample_size: 4,
        }
    }

    fn card(source: usize, offset: usize) -> CardIdx {
        CardIdx(source * 128 + offset)
    }

    #[test]
    fn test_sparse_entries() {
        let rs = RememberedSet::new(RegionIdx(0), geometry(4, 4));
        for s in 1..=3 {
            assert!(rs.add_reference(RegionIdx(s), card(s, 7)));
        }
        assert_eq!(rs.occupied(), 3);
        for s in 1..=3 {
            assert_eq!(
                rs.representation_of(RegionIdx(s)),
                Some(Representation::Sparse)
            );
            assert!(rs.contains(card(s, 7)));
        }
        assert!(!rs.contains(card(1, 8)));
        assert_eq!(rs.representation_of(RegionIdx(4)), None);
    }

    #[test]
    fn test_idempotent_insert() {
        let rs = RememberedSet::new(RegionIdx(0), geometry(4, 4));
        assert!(rs.add_reference(RegionIdx(1), card(1, 1)));
        assert!(!rs.add_reference(RegionIdx(1), card(1, 1)));
        assert_eq!(rs.occupied(), 1);
    }

    #[test]
    fn test_promotion_to_fine() {
        let rs = RememberedSet::new(RegionIdx(0), geometry(4, 4));
        for offset in 0..5 {
            rs.add_reference(RegionIdx(1), card(1, offset));
        }
        assert_eq!(rs.representation_of(RegionIdx(1)), Some(Representation::Fine));
        assert_eq!(rs.occupied(), 5);
        assert_eq!(rs.sparse_cards(), 0);
        assert_eq!(rs.fine_tables(), 1);
        for offset in 0..5 {
            assert!(rs.contains(card(1, offset)));
        }
    }

    #[test]
    fn test_coarsening_keeps_membership() {
        let rs = RememberedSet::new(RegionIdx(0), geometry(1, 2));
        for s in 1..=3 {
            rs.add_reference(RegionIdx(s), card(s, 0));
            rs.add_reference(RegionIdx(s), card(s, 1));
        }
        assert_eq!(rs.fine_tables(), 2);
        assert_eq!(rs.coarse_sources(), 1);
        assert_eq!(rs.coarsenings(), 1);
        for s in 1..=3 {
            assert!(rs.contains(card(s, 0)));
            assert!(rs.contains(card(s, 1)));
        }
        let coarse: Vec<_> = (1..=3)
            .filter(|&s| rs.representation_of(RegionIdx(s)) == Some(Representation::Coarse))
            .collect();
        assert_eq!(coarse.len(), 1);
        // Further inserts from the coarse source are no-ops.
        assert!(!rs.add_reference(RegionIdx(coarse[0]), card(coarse[0], 99)));
    }

    #[test]
    fn test_iterate_yields_every_entry() {
        let rs = RememberedSet::new(RegionIdx(0), geometry(1, 1));
        rs.add_reference(RegionIdx(1), card(1, 3));
        rs.add_reference(RegionIdx(2), card(2, 4));
        rs.add_reference(RegionIdx(2), card(2, 5));
        rs.add_reference(RegionIdx(3), card(3, 6));
        rs.add_reference(RegionIdx(3), card(3, 7));
        let mut cards = Vec::new();
        let mut coarse = Vec::new();
        rs.iterate(|e| match e {
            RemSetEntry::Card(c) => cards.push(c),
            RemSetEntry::CoarseRegion(r) => coarse.push(r),
        });
        assert_eq!(coarse.len(), 1);
        assert!(cards.contains(&card(1, 3)));
        assert_eq!(cards.len(), 3);
        let mut expanded = 0;
        rs.for_each_card(|_| expanded += 1);
        assert_eq!(expanded, 3 + 128);
        assert_eq!(rs.occupied(), 3 + 128);
        assert!(rs.occupancy_less_or_equal_than(131));
        assert!(!rs.occupancy_less_or_equal_than(130));
    }

    #[test]
    fn test_clear_incoming_entry() {
        let rs = RememberedSet::new(RegionIdx(0), geometry(1, 1));
        rs.add_reference(RegionIdx(1), card(1, 0));
        rs.add_reference(RegionIdx(2), card(2, 0));
        rs.add_reference(RegionIdx(2), card(2, 1));
        rs.add_reference(RegionIdx(3), card(3, 0));
        rs.add_reference(RegionIdx(3), card(3, 1));
        for s in 1..=3 {
            rs.clear_incoming_entry(RegionIdx(s));
            assert_eq!(rs.representation_of(RegionIdx(s)), None);
        }
        assert!(rs.is_empty());
    }

    #[test]
    fn test_clear() {
        let rs = RememberedSet::new(RegionIdx(0), geometry(1, 1));
        for s in 1..5 {
            rs.add_reference(RegionIdx(s), card(s, 0));
            rs.add_reference(RegionIdx(s), card(s, 1));
        }
        assert!(!rs.is_empty());
        rs.clear();
        assert!(rs.is_empty());
        assert_eq!(rs.occupied(), 0);
        assert!(rs.add_reference(RegionIdx(1), card(1, 0)));
    }

    #[test]
    fn test_concurrent_inserts() {
        use std::sync::Arc;
        let rs = Arc::new(RememberedSet::new(RegionIdx(0), geometry(2, 4)));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let rs = Arc::clone(&rs);
                std::thread::spawn(move || {
                    for s in 1..9 {
                        for offset in 0..16 {
                            rs.add_reference(RegionIdx(s), card(s, (offset + t * 3) % 32));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for s in 1..9 {
            for offset in 0..16 {
                assert!(rs.contains(card(s, offset)));
            }
        }
        assert!(rs.fine_tables() <= 4);
    }
}
