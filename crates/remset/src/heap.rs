//! Minimal region heap model.
//!
//! The remembered-set engine needs a heap it can ask three questions of:
//! which region holds an address, where the object covering an address
//! starts, and which reference slots an object has. This module answers them
//! for a simple bump-allocated region heap reserved through `sys_alloc`.
//!
//! # Object layout
//!
//! Every object starts with one header word followed by its reference slots:
//!
//! ```text
//! | header | slot 0 | slot 1 | ... |
//! ```
//!
//! The header records the slot count and whether slots are *wide* (one full
//! word holding an absolute address) or *narrow* (a 32-bit word-scaled offset
//! from the heap base, two per word). A zero slot value is a null reference.
//!
//! All heap memory is accessed through atomics, so mutators may store
//! references while refinement threads read them.

use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::{Reservation, ReserveOptions};

use crate::config::{ConfigError, RemSetConfig};

/// A heap address.
pub type Address = usize;

/// Size of a heap word in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();
/// log2 of [`WORD_SIZE`].
pub const WORD_SHIFT: u32 = WORD_SIZE.trailing_zeros();

const HEADER_TAG: usize = 1 << (usize::BITS - 1);
const NARROW_FLAG: usize = 1 << (usize::BITS - 2);
const SLOT_COUNT_MASK: usize = u32::MAX as usize;

/// Index of a region in the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionIdx(pub usize);

impl RegionIdx {
    /// Raw index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// What a region is currently used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionKind {
    /// Not allocated.
    Free = 0,
    /// Young generation; always collected, never refined.
    Young = 1,
    /// Old generation.
    Old = 2,
    /// Holds a single large object.
    Humongous = 3,
}

impl RegionKind {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Young,
            2 => Self::Old,
            3 => Self::Humongous,
            _ => Self::Free,
        }
    }
}

/// Encoding of an object's reference slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefWidth {
    /// Full-word absolute addresses.
    Wide,
    /// Compressed 32-bit word-scaled offsets from the heap base.
    Narrow,
}

/// Decoded object header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjHeader {
    /// Number of reference slots.
    pub slots: usize,
    /// Slot encoding.
    pub width: RefWidth,
}

impl ObjHeader {
    const fn encode(self) -> usize {
        let narrow = match self.width {
            RefWidth::Wide => 0,
            RefWidth::Narrow => NARROW_FLAG,
        };
        HEADER_TAG | narrow | self.slots
    }

    const fn decode(word: usize) -> Option<Self> {
        if word & HEADER_TAG == 0 {
            return None;
        }
        let width = if word & NARROW_FLAG == 0 {
            RefWidth::Wide
        } else {
            RefWidth::Narrow
        };
        Some(Self {
            slots: word & SLOT_COUNT_MASK,
            width,
        })
    }

    /// Object size in words, header included.
    #[must_use]
    pub const fn size_words(self) -> usize {
        1 + match self.width {
            RefWidth::Wide => self.slots,
            RefWidth::Narrow => self.slots.div_ceil(2),
        }
    }

    /// Object size in bytes, header included.
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        self.size_words() << WORD_SHIFT
    }

    const fn slot_offset(self, slot: usize) -> usize {
        WORD_SIZE
            + match self.width {
                RefWidth::Wide => slot * WORD_SIZE,
                RefWidth::Narrow => slot * 4,
            }
    }
}

/// A reference slot inside a heap object.
pub trait RefSlot {
    /// Address of the slot itself.
    fn address(&self) -> Address;
    /// Load the referenced object, or `None` for null.
    fn load(&self) -> Option<Address>;
}

/// Full-word reference slot.
pub struct WideSlot<'h> {
    cell: &'h AtomicUsize,
    addr: Address,
}

impl RefSlot for WideSlot<'_> {
    #[inline]
    fn address(&self) -> Address {
        self.addr
    }

    #[inline]
    fn load(&self) -> Option<Address> {
        match self.cell.load(Ordering::Acquire) {
            0 => None,
            target => Some(target),
        }
    }
}

/// Compressed reference slot.
pub struct NarrowSlot<'h> {
    cell: &'h AtomicU32,
    addr: Address,
    base: Address,
}

impl RefSlot for NarrowSlot<'_> {
    #[inline]
    fn address(&self) -> Address {
        self.addr
    }

    #[inline]
    fn load(&self) -> Option<Address> {
        match self.cell.load(Ordering::Acquire) {
            0 => None,
            v => Some(self.base + ((v as usize - 1) << WORD_SHIFT)),
        }
    }
}

/// Visitor over the reference slots of heap objects.
///
/// One implementation serves both slot encodings; the slot type is a
/// generic parameter resolved per call site.
pub trait OopVisitor {
    /// Visit one reference slot.
    fn do_oop<S: RefSlot>(&mut self, slot: &S);
}

/// One fixed-size heap region.
#[derive(Debug)]
pub struct Region {
    index: RegionIdx,
    bottom: Address,
    end: Address,
    kind: AtomicU8,
    generation: AtomicU32,
    top: AtomicUsize,
    tams: AtomicUsize,
    timestamp: AtomicU64,
    alloc_lock: Mutex<()>,
}

impl Region {
    fn new(index: usize, bottom: Address, size: usize) -> Self {
        Self {
            index: RegionIdx(index),
            bottom,
            end: bottom + size,
            kind: AtomicU8::new(RegionKind::Free as u8),
            generation: AtomicU32::new(0),
            top: AtomicUsize::new(bottom),
            tams: AtomicUsize::new(bottom),
            timestamp: AtomicU64::new(0),
            alloc_lock: Mutex::new(()),
        }
    }

    /// Region index.
    #[must_use]
    pub const fn index(&self) -> RegionIdx {
        self.index
    }

    /// First address of the region.
    #[must_use]
    pub const fn bottom(&self) -> Address {
        self.bottom
    }

    /// One past the last address of the region.
    #[must_use]
    pub const fn end(&self) -> Address {
        self.end
    }

    /// Current use of the region.
    #[must_use]
    pub fn kind(&self) -> RegionKind {
        RegionKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    /// Returns `true` if the region is not allocated.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.kind() == RegionKind::Free
    }

    /// Returns `true` for young regions.
    #[must_use]
    pub fn is_young(&self) -> bool {
        self.kind() == RegionKind::Young
    }

    /// Reuse counter, bumped each time the region is freed.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Allocation frontier.
    #[must_use]
    pub fn top(&self) -> Address {
        self.top.load(Ordering::Acquire)
    }

    /// Top at mark start: objects at or above it are implicitly live.
    #[must_use]
    pub fn tams(&self) -> Address {
        self.tams.load(Ordering::Acquire)
    }

    /// Record the current top as top-at-mark-start.
    pub fn set_tams(&self, tams: Address) {
        debug_assert!((self.bottom..=self.end).contains(&tams));
        self.tams.store(tams, Ordering::Release);
    }

    /// Heap clock value at the region's last allocation or release.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Bytes allocated in the region.
    #[must_use]
    pub fn used(&self) -> usize {
        self.top() - self.bottom
    }

    /// Returns `true` if `addr` lies inside the region.
    #[must_use]
    pub const fn contains(&self, addr: Address) -> bool {
        addr >= self.bottom && addr < self.end
    }
}

/// A contiguous heap of equally sized regions.
pub struct Heap {
    reservation: Reservation,
    base: Address,
    end: Address,
    region_shift: u32,
    card_shift: u32,
    regions: Box<[Region]>,
    // Per card: start of the object covering the card's first byte, 0 if none.
    block_offsets: Box<[AtomicUsize]>,
    free_regions: Mutex<Vec<RegionIdx>>,
    clock: AtomicU64,
}

impl Heap {
    /// Reserve a heap with the geometry of `config`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an invalid configuration, or the OS error
    /// if the reservation fails.
    pub fn new(config: &RemSetConfig) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e: ConfigError| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let size = config.heap_size();
        let reservation = ReserveOptions::new().len(size).no_reserve(true).reserve()?;
        let base = reservation.base() as Address;
        let region_size = config.region_size();
        let regions = (0..config.max_regions)
            .map(|i| Region::new(i, base + i * region_size, region_size))
            .collect();
        let n_cards = size >> config.card_shift;
        Ok(Self {
            reservation,
            base,
            end: base + size,
            region_shift: config.region_shift,
            card_shift: config.card_shift,
            regions,
            block_offsets: (0..n_cards).map(|_| AtomicUsize::new(0)).collect(),
            free_regions: Mutex::new((0..config.max_regions).rev().map(RegionIdx).collect()),
            clock: AtomicU64::new(0),
        })
    }

    /// Lowest heap address.
    #[must_use]
    pub const fn base(&self) -> Address {
        self.base
    }

    /// One past the highest heap address.
    #[must_use]
    pub const fn end(&self) -> Address {
        self.end
    }

    /// Heap size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.end - self.base
    }

    /// Region size in bytes.
    #[must_use]
    pub const fn region_size(&self) -> usize {
        1 << self.region_shift
    }

    /// Number of regions.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    /// Region `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of range.
    #[must_use]
    pub fn region(&self, idx: RegionIdx) -> &Region {
        &self.regions[idx.0]
    }

    /// Every region, in address order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    /// Returns `true` if `addr` is inside the heap.
    #[must_use]
    pub const fn is_in(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.end
    }

    /// Index of the region containing `addr`.
    #[must_use]
    pub const fn region_index_for(&self, addr: Address) -> Option<RegionIdx> {
        if self.is_in(addr) {
            Some(RegionIdx((addr - self.base) >> self.region_shift))
        } else {
            None
        }
    }

    /// Region containing `addr`.
    #[must_use]
    pub fn region_for(&self, addr: Address) -> Option<&Region> {
        self.region_index_for(addr).map(|idx| self.region(idx))
    }

    /// Advance the heap clock and return the new value.
    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current heap clock value.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    /// Take a free region and give it `kind`.
    ///
    /// Returns `None` when the heap is full.
    pub fn allocate_region(&self, kind: RegionKind) -> Option<RegionIdx> {
        debug_assert!(kind != RegionKind::Free, "cannot allocate a free region");
        let idx = self.free_regions.lock().pop()?;
        let region = self.region(idx);
        region.top.store(region.bottom, Ordering::Relaxed);
        region.tams.store(region.bottom, Ordering::Relaxed);
        region.timestamp.store(self.tick(), Ordering::Release);
        region.kind.store(kind as u8, Ordering::Release);
        Some(idx)
    }

    /// Change the kind of an allocated region, e.g. young to old after a
    /// collection.
    pub fn set_region_kind(&self, idx: RegionIdx, kind: RegionKind) {
        let region = self.region(idx);
        debug_assert!(!region.is_free() && kind != RegionKind::Free);
        region.kind.store(kind as u8, Ordering::Release);
    }

    /// Return a region to the free list.
    ///
    /// Callers outside this crate go through `RemSetContext::reclaim_region`,
    /// which purges the region from every remembered set first.
    pub(crate) fn release_region(&self, idx: RegionIdx) -> io::Result<()> {
        let region = self.region(idx);
        debug_assert!(!region.is_free(), "region {} released twice", idx.0);
        region.kind.store(RegionKind::Free as u8, Ordering::Release);
        region.generation.fetch_add(1, Ordering::AcqRel);
        region.top.store(region.bottom, Ordering::Release);
        region.tams.store(region.bottom, Ordering::Release);
        region.timestamp.store(self.tick(), Ordering::Release);
        for offset in &self.block_offsets[self.card_range(idx)] {
            offset.store(0, Ordering::Relaxed);
        }
        let discarded = if self.region_size() % sys_alloc::page_size() == 0 {
            self.reservation
                .discard(region.bottom - self.base, self.region_size())
        } else {
            Ok(())
        };
        self.free_regions.lock().push(idx);
        discarded
    }

    /// Record top-at-mark-start for every region, as at the start of marking.
    pub fn record_top_at_mark_start(&self) {
        for region in self.regions() {
            region.set_tams(region.top());
        }
    }

    fn card_range(&self, idx: RegionIdx) -> Range<usize> {
        let per_region = 1 << (self.region_shift - self.card_shift);
        idx.0 * per_region..(idx.0 + 1) * per_region
    }

    /// Allocate an object with `slots` null reference slots in `region`.
    ///
    /// Returns `None` if the region is free or has no room left.
    pub fn allocate(&self, region: RegionIdx, slots: usize, width: RefWidth) -> Option<Address> {
        let header = ObjHeader {
            slots: slots.min(SLOT_COUNT_MASK),
            width,
        };
        let region = self.region(region);
        let _alloc = region.alloc_lock.lock();
        if region.is_free() {
            return None;
        }
        let obj = region.top.load(Ordering::Relaxed);
        let new_top = obj.checked_add(header.size_bytes())?;
        if new_top > region.end {
            return None;
        }
        self.word(obj).store(header.encode(), Ordering::Relaxed);
        for addr in (obj + WORD_SIZE..new_top).step_by(WORD_SIZE) {
            self.word(addr).store(0, Ordering::Relaxed);
        }
        let card_size = 1usize << self.card_shift;
        let first_card = (obj - self.base).div_ceil(card_size);
        let last_card = (new_top - 1 - self.base) >> self.card_shift;
        for card in first_card..=last_card {
            self.block_offsets[card].store(obj, Ordering::Relaxed);
        }
        region.top.store(new_top, Ordering::Release);
        Some(obj)
    }

    /// Allocate a region of kind [`RegionKind::Humongous`] holding a single
    /// object with `slots` reference slots.
    pub fn allocate_humongous(&self, slots: usize, width: RefWidth) -> Option<Address> {
        let idx = self.allocate_region(RegionKind::Humongous)?;
        let obj = self.allocate(idx, slots, width);
        if obj.is_none() {
            let _ = self.release_region(idx);
        }
        obj
    }

    #[inline]
    fn word(&self, addr: Address) -> &AtomicUsize {
        assert!(
            self.is_in(addr) && addr % WORD_SIZE == 0,
            "bad heap word address {addr:#x}"
        );
        // SAFETY: `addr` is an aligned word inside our live reservation, and
        // all heap accesses go through atomics.
        unsafe { &*(addr as *const AtomicUsize) }
    }

    #[inline]
    fn half_word(&self, addr: Address) -> &AtomicU32 {
        assert!(
            self.is_in(addr) && addr % 4 == 0,
            "bad heap half-word address {addr:#x}"
        );
        // SAFETY: as for `word`, with 4-byte alignment.
        unsafe { &*(addr as *const AtomicU32) }
    }

    /// Decode the header of the object at `obj`, or `None` if no object
    /// starts there.
    #[must_use]
    pub fn header(&self, obj: Address) -> Option<ObjHeader> {
        ObjHeader::decode(self.word(obj).load(Ordering::Acquire))
    }

    /// Address of reference slot `slot` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not an object or `slot` is out of range.
    #[must_use]
    pub fn slot_address(&self, obj: Address, slot: usize) -> Address {
        let header = self.expect_header(obj);
        assert!(slot < header.slots, "slot {slot} out of range");
        obj + header.slot_offset(slot)
    }

    fn expect_header(&self, obj: Address) -> ObjHeader {
        match self.header(obj) {
            Some(header) => header,
            None => panic!("no object at {obj:#x}"),
        }
    }

    /// Store `target` into slot `slot` of `obj` without any barrier.
    ///
    /// Mutators go through `RemSetContext::write_ref`, which adds the
    /// post-write barrier.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not an object, `slot` is out of range, or `target`
    /// is outside the heap.
    pub fn store_ref(&self, obj: Address, slot: usize, target: Option<Address>) -> Address {
        let header = self.expect_header(obj);
        assert!(slot < header.slots, "slot {slot} out of range");
        let addr = obj + header.slot_offset(slot);
        match header.width {
            RefWidth::Wide => {
                let value = target.map_or(0, |t| {
                    assert!(self.is_in(t), "target {t:#x} outside heap");
                    t
                });
                self.word(addr).store(value, Ordering::Release);
            }
            RefWidth::Narrow => {
                let value = target.map_or(0, |t| self.compress(t));
                self.half_word(addr).store(value, Ordering::Release);
            }
        }
        addr
    }

    /// Load slot `slot` of `obj`.
    #[must_use]
    pub fn load_ref(&self, obj: Address, slot: usize) -> Option<Address> {
        let header = self.expect_header(obj);
        assert!(slot < header.slots, "slot {slot} out of range");
        let addr = obj + header.slot_offset(slot);
        match header.width {
            RefWidth::Wide => WideSlot {
                cell: self.word(addr),
                addr,
            }
            .load(),
            RefWidth::Narrow => NarrowSlot {
                cell: self.half_word(addr),
                addr,
                base: self.base,
            }
            .load(),
        }
    }

    fn compress(&self, target: Address) -> u32 {
        assert!(
            self.is_in(target) && target % WORD_SIZE == 0,
            "target {target:#x} not a heap word"
        );
        // Heap size is validated to fit in 32 bits of words.
        #[allow(clippy::cast_possible_truncation)]
        let offset = ((target - self.base) >> WORD_SHIFT) as u32;
        offset + 1
    }

    /// Start of the object covering `addr`, if `addr` is below its region's
    /// top.
    #[must_use]
    pub fn block_start(&self, addr: Address) -> Option<Address> {
        let region = self.region_for(addr)?;
        if addr >= region.top() {
            return None;
        }
        let card = (addr - self.base) >> self.card_shift;
        let mut obj = self.block_offsets[card].load(Ordering::Acquire);
        if obj == 0 {
            return None;
        }
        loop {
            let size = self.header(obj)?.size_bytes();
            if obj + size > addr {
                return Some(obj);
            }
            obj += size;
        }
    }

    /// Visit every reference slot of `obj`.
    pub fn oops_in<V: OopVisitor>(&self, obj: Address, visitor: &mut V) {
        if let Some(header) = self.header(obj) {
            self.visit_slots(obj, header, 0..usize::MAX, visitor);
        }
    }

    /// Visit every reference slot whose address lies in `[lo, hi)`, over all
    /// objects overlapping that range below the region's top.
    ///
    /// Returns the number of objects walked.
    pub fn oops_in_range<V: OopVisitor>(&self, lo: Address, hi: Address, visitor: &mut V) -> usize {
        let Some(region) = self.region_for(lo) else {
            return 0;
        };
        let hi = hi.min(region.top());
        if lo >= hi {
            return 0;
        }
        let Some(mut obj) = self.block_start(lo) else {
            return 0;
        };
        let mut walked = 0;
        while obj < hi {
            let Some(header) = self.header(obj) else {
                break;
            };
            self.visit_slots(obj, header, lo..hi, visitor);
            obj += header.size_bytes();
            walked += 1;
        }
        walked
    }

    fn visit_slots<V: OopVisitor>(
        &self,
        obj: Address,
        header: ObjHeader,
        range: Range<Address>,
        visitor: &mut V,
    ) {
        for slot in 0..header.slots {
            let addr = obj + header.slot_offset(slot);
            if addr < range.start {
                continue;
            }
            if addr >= range.end {
                break;
            }
            match header.width {
                RefWidth::Wide => visitor.do_oop(&WideSlot {
                    cell: self.word(addr),
                    addr,
                }),
                RefWidth::Narrow => visitor.do_oop(&NarrowSlot {
                    cell: self.half_word(addr),
                    addr,
                    base: self.base,
                }),
            }
        }
    }

    /// Call `f(obj, size_bytes)` for each object starting in `[from, to)`.
    /// `from` must be an object start.
    pub fn walk_objects(&self, from: Address, to: Address, mut f: impl FnMut(Address, usize)) {
        let mut obj = from;
        while obj < to {
            let Some(header) = self.header(obj) else {
                break;
            };
            let size = header.size_bytes();
            f(obj, size);
            obj += size;
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size())
            .field("regions", &self.regions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap() -> Heap {
        Heap::new(&RemSetConfig::new(16, 8)).unwrap()
    }

    struct Collect(Vec<(Address, Option<Address>)>);

    impl OopVisitor for Collect {
        fn do_oop<S: RefSlot>(&mut self, slot: &S) {
            self.0.push((slot.address(), slot.load()));
        }
    }

    #[test]
    fn test_region_geometry() {
        let heap = small_heap();
        assert_eq!(heap.num_regions(), 8);
        let r3 = heap.region(RegionIdx(3));
        assert_eq!(r3.bottom(), heap.base() + 3 * 65536);
        assert_eq!(heap.region_index_for(r3.bottom() + 100), Some(RegionIdx(3)));
        assert_eq!(heap.region_index_for(heap.end()), None);
    }

    #[test]
    fn test_allocate_and_store() {
        let heap = small_heap();
        let r = heap.allocate_region(RegionKind::Old).unwrap();
        let a = heap.allocate(r, 3, RefWidth::Wide).unwrap();
        let b = heap.allocate(r, 5, RefWidth::Narrow).unwrap();
        assert_eq!(b, a + 4 * WORD_SIZE);
        assert_eq!(heap.header(b).unwrap().size_words(), 4);

        heap.store_ref(a, 1, Some(b));
        heap.store_ref(b, 4, Some(a));
        assert_eq!(heap.load_ref(a, 1), Some(b));
        assert_eq!(heap.load_ref(a, 0), None);
        assert_eq!(heap.load_ref(b, 4), Some(a));
    }

    #[test]
    fn test_allocate_in_free_region_fails() {
        let heap = small_heap();
        assert_eq!(heap.allocate(RegionIdx(0), 1, RefWidth::Wide), None);
    }

    #[test]
    fn test_region_full() {
        let heap = small_heap();
        let r = heap.allocate_region(RegionKind::Old).unwrap();
        let words = 65536 / WORD_SIZE;
        assert!(heap.allocate(r, words, RefWidth::Wide).is_none());
        assert!(heap.allocate(r, words - 1, RefWidth::Wide).is_some());
        assert!(heap.allocate(r, 0, RefWidth::Wide).is_none());
    }

    #[test]
    fn test_block_start_spans_cards() {
        let heap = small_heap();
        let r = heap.allocate_region(RegionKind::Old).unwrap();
        let small = heap.allocate(r, 1, RefWidth::Wide).unwrap();
        let big = heap.allocate(r, 200, RefWidth::Wide).unwrap();
        assert_eq!(heap.block_start(small + 8), Some(small));
        assert_eq!(heap.block_start(big), Some(big));
        assert_eq!(heap.block_start(big + 1000), Some(big));
        assert_eq!(heap.block_start(heap.region(r).top()), None);
    }

    #[test]
    fn test_oops_in_range_limits_to_range() {
        let heap = small_heap();
        let r = heap.allocate_region(RegionKind::Old).unwrap();
        let obj = heap.allocate(r, 128, RefWidth::Wide).unwrap();
        heap.store_ref(obj, 100, Some(obj));
        let card = 512;
        let lo = heap.base() + (((obj - heap.base()) / card) + 1) * card;
        let mut seen = Collect(Vec::new());
        heap.oops_in_range(lo, lo + card, &mut seen);
        assert_eq!(seen.0.len(), card / WORD_SIZE);
        assert!(seen.0.iter().all(|(a, _)| (lo..lo + card).contains(a)));
        assert!(seen.0.contains(&(heap.slot_address(obj, 100), Some(obj))));
    }

    #[test]
    fn test_release_bumps_generation() {
        let heap = small_heap();
        let r = heap.allocate_region(RegionKind::Old).unwrap();
        let obj = heap.allocate(r, 2, RefWidth::Wide).unwrap();
        let before = heap.region(r).generation();
        let stamp = heap.region(r).timestamp();
        heap.release_region(r).unwrap();
        assert!(heap.region(r).is_free());
        assert_eq!(heap.region(r).generation(), before + 1);
        assert!(heap.region(r).timestamp() > stamp);
        assert_eq!(heap.block_start(obj), None);
    }

    #[test]
    fn test_walk_objects() {
        let heap = small_heap();
        let r = heap.allocate_region(RegionKind::Young).unwrap();
        let objs: Vec<_> = (0..4)
            .map(|i| heap.allocate(r, i, RefWidth::Wide).unwrap())
            .collect();
        let region = heap.region(r);
        let mut seen = Vec::new();
        heap.walk_objects(region.bottom(), region.top(), |obj, _| seen.push(obj));
        assert_eq!(seen, objs);
    }
}
