//! Atomic bitmaps shared by marking, liveness and remembered sets.
//!
//! [`AtomicBitmap`] is a fixed-length array of bits backed by `AtomicU64`
//! words. Every mutation is a single `fetch_or`/`fetch_and`, so any number of
//! threads may set and clear bits concurrently. [`MarkBitmap`] layers heap
//! addressing on top: one bit per heap word, set for every marked object start.

use std::alloc::{alloc_zeroed, handle_alloc_error, Layout};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::heap::{Address, WORD_SHIFT};

const BITS: usize = u64::BITS as usize;

/// Allocate `n` zeroed atomic words.
///
/// Allocation failure is fatal: remembered-set escalation cannot make
/// progress without memory, so this calls [`handle_alloc_error`].
pub(crate) fn zeroed_words(n: usize) -> Box<[AtomicU64]> {
    if n == 0 {
        return Box::new([]);
    }
    let Ok(layout) = Layout::array::<AtomicU64>(n) else {
        handle_alloc_error(Layout::new::<AtomicU64>())
    };
    // SAFETY: layout has non-zero size.
    let ptr = unsafe { alloc_zeroed(layout) }.cast::<AtomicU64>();
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    // SAFETY: the allocation holds `n` zeroed words, and an all-zero bit
    // pattern is a valid `AtomicU64`. The layout matches `Box<[AtomicU64]>`.
    unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, n)) }
}

/// A fixed-size bitmap with lock-free set, clear and test.
#[derive(Debug)]
pub struct AtomicBitmap {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl AtomicBitmap {
    /// Create a cleared bitmap of `len` bits.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            words: zeroed_words(len.div_ceil(BITS)),
            len,
        }
    }

    /// Number of bits.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the bitmap holds no bits.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of backing words.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Set bit `index`. Returns `true` if it was previously clear.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn set(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {index} out of bounds ({})", self.len);
        let mask = 1u64 << (index % BITS);
        self.words[index / BITS].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Clear bit `index`. Returns `true` if it was previously set.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn clear(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {index} out of bounds ({})", self.len);
        let mask = 1u64 << (index % BITS);
        self.words[index / BITS].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// Test bit `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {index} out of bounds ({})", self.len);
        (self.words[index / BITS].load(Ordering::Acquire) >> (index % BITS)) & 1 != 0
    }

    /// Load backing word `word`.
    #[inline]
    #[must_use]
    pub fn word(&self, word: usize) -> u64 {
        self.words[word].load(Ordering::Acquire)
    }

    /// AND backing word `word` with `mask`, returning the new value.
    #[inline]
    pub fn and_word(&self, word: usize, mask: u64) -> u64 {
        self.words[word].fetch_and(mask, Ordering::AcqRel) & mask
    }

    /// Clear every bit.
    pub fn clear_all(&self) {
        for word in &*self.words {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Clear the whole words covering `words`.
    pub fn clear_words(&self, words: Range<usize>) {
        for word in &self.words[words] {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Set every bit in `range`.
    pub fn set_range(&self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        assert!(range.end <= self.len, "range {range:?} out of bounds");
        let (first, last) = (range.start / BITS, (range.end - 1) / BITS);
        for w in first..=last {
            let lo = if w == first { range.start % BITS } else { 0 };
            let hi = if w == last { (range.end - 1) % BITS } else { BITS - 1 };
            let mask = (u64::MAX >> (BITS - 1 - hi)) & (u64::MAX << lo);
            self.words[w].fetch_or(mask, Ordering::AcqRel);
        }
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Index of the first set bit in `range`, if any.
    #[must_use]
    pub fn find_next_set(&self, range: Range<usize>) -> Option<usize> {
        let end = range.end.min(self.len);
        let mut index = range.start;
        while index < end {
            let w = index / BITS;
            let word = self.words[w].load(Ordering::Acquire) >> (index % BITS);
            if word != 0 {
                let found = index + word.trailing_zeros() as usize;
                return (found < end).then_some(found);
            }
            index = (w + 1) * BITS;
        }
        None
    }

    /// Call `f` for each set bit in `range`, in increasing order.
    pub fn for_each_set(&self, range: Range<usize>, mut f: impl FnMut(usize)) {
        let mut from = range.start;
        while let Some(index) = self.find_next_set(from..range.end) {
            f(index);
            from = index + 1;
        }
    }

    /// Returns `true` if both bitmaps hold exactly the same bits.
    #[must_use]
    pub fn same_bits(&self, other: &Self) -> bool {
        self.len == other.len
            && self
                .words
                .iter()
                .zip(other.words.iter())
                .all(|(a, b)| a.load(Ordering::Relaxed) == b.load(Ordering::Relaxed))
    }

    /// Bytes used by the backing storage.
    #[must_use]
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.words.len() * std::mem::size_of::<AtomicU64>()
    }
}

/// Mark bitmap covering a heap: one bit per heap word.
///
/// A set bit means an object starting at that word was found live by the
/// marker. The marker itself is external; this type is only the shared
/// record it leaves behind.
#[derive(Debug)]
pub struct MarkBitmap {
    bits: AtomicBitmap,
    base: Address,
}

impl MarkBitmap {
    /// Create a cleared mark bitmap for `[base, base + size)`.
    #[must_use]
    pub fn new(base: Address, size: usize) -> Self {
        Self {
            bits: AtomicBitmap::new(size >> WORD_SHIFT),
            base,
        }
    }

    #[inline]
    fn index_of(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.base, "address {addr:#x} below heap base");
        (addr - self.base) >> WORD_SHIFT
    }

    #[inline]
    fn addr_of(&self, index: usize) -> Address {
        self.base + (index << WORD_SHIFT)
    }

    /// Mark the object starting at `addr`. Returns `true` if newly marked.
    pub fn mark(&self, addr: Address) -> bool {
        self.bits.set(self.index_of(addr))
    }

    /// Returns `true` if the object at `addr` is marked.
    #[must_use]
    pub fn is_marked(&self, addr: Address) -> bool {
        self.bits.get(self.index_of(addr))
    }

    /// First marked object start in `[from, to)`.
    #[must_use]
    pub fn next_marked(&self, from: Address, to: Address) -> Option<Address> {
        self.bits
            .find_next_set(self.index_of(from)..self.index_of(to))
            .map(|i| self.addr_of(i))
    }

    /// Number of marked objects.
    #[must_use]
    pub fn marked_count(&self) -> usize {
        self.bits.count_ones()
    }

    /// Clear the marks for `[from, to)`. Both bounds must be 64-word aligned
    /// relative to the heap base.
    pub fn clear_range(&self, from: Address, to: Address) {
        let (lo, hi) = (self.index_of(from), self.index_of(to));
        debug_assert!(lo % BITS == 0 && hi % BITS == 0, "unaligned clear");
        self.bits.clear_words(lo / BITS..hi / BITS);
    }

    /// Clear every mark.
    pub fn clear(&self) {
        self.bits.clear_all();
    }
}
