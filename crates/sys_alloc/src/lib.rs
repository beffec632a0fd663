//! Low-level virtual memory primitives for reserving a contiguous GC heap.
//!
//! A [`Reservation`] is one anonymous, zero-filled mapping that a collector
//! carves into fixed-size regions. Individual ranges can later be
//! [discarded](Reservation::discard): their physical pages are returned to the
//! OS and read back as zero, which is how a reclaimed region is scrubbed before
//! it is handed out again.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
/// Reservation lengths are rounded up to this value.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Round `len` up to the next multiple of [`allocation_granularity`].
#[must_use]
pub fn round_to_granularity(len: usize) -> usize {
    let gran = allocation_granularity();
    len.div_ceil(gran) * gran
}

/// An anonymous, zero-initialised address range owned by the collector.
///
/// The range is unmapped when the reservation is dropped.
pub struct Reservation {
    inner: os::MapInner,
}

impl Reservation {
    /// Base address of the reservation.
    #[must_use]
    pub fn base(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Length of the reservation in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the reservation is empty (never the case for a
    /// successfully created reservation).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns `true` if `addr` lies inside the reservation.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base() as usize;
        addr >= base && addr < base + self.len()
    }

    /// Give the physical pages backing `[offset, offset + len)` back to the OS.
    ///
    /// After a successful discard the range reads as zero. Both `offset` and
    /// `len` must be multiples of [`page_size`].
    ///
    /// # Errors
    ///
    /// Returns an error if the range is misaligned, out of bounds, or the OS
    /// rejects the request.
    pub fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        let ps = page_size();
        if offset % ps != 0 || len % ps != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "discard range must be page aligned",
            ));
        }
        if offset.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "discard range exceeds reservation",
            ));
        }
        if len == 0 {
            return Ok(());
        }
        // SAFETY: the range was validated to lie within our own mapping.
        unsafe { self.inner.discard(offset, len) }
    }
}

// SAFETY: the reservation is plain memory; synchronisation of its contents is
// the responsibility of the code that hands out views into it.
unsafe impl Send for Reservation {}
// SAFETY: see Send impl
unsafe impl Sync for Reservation {}

/// Builder for a [`Reservation`].
#[derive(Debug, Clone, Default)]
pub struct ReserveOptions {
    len: usize,
    populate: bool,
    no_reserve: bool,
}

impl ReserveOptions {
    /// Creates options for an empty reservation. A length must be set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            populate: false,
            no_reserve: false,
        }
    }

    /// Sets the length in bytes. Rounded up to the allocation granularity.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Pre-fault page tables (`MAP_POPULATE` on Linux).
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Do not reserve swap space (`MAP_NORESERVE` where supported).
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Map the reservation.
    ///
    /// # Errors
    ///
    /// Returns an error if the length is zero or the OS refuses the mapping.
    pub fn reserve(&self) -> io::Result<Reservation> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        let len = round_to_granularity(self.len);
        // SAFETY: we request a fresh anonymous mapping at an OS-chosen address.
        let inner = unsafe { os::MapInner::map_anon(len, self.populate, self.no_reserve)? };
        Ok(Reservation { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag >= page_size());
        assert_eq!(round_to_granularity(1), ag);
        assert_eq!(round_to_granularity(ag), ag);
    }

    #[test]
    fn test_reserve_is_zeroed_and_aligned() {
        let res = ReserveOptions::new()
            .len(page_size() * 4)
            .reserve()
            .expect("failed to reserve");
        assert_eq!(res.base() as usize % page_size(), 0);
        assert!(res.len() >= page_size() * 4);

        let words = res.base().cast::<AtomicUsize>();
        // SAFETY: the mapping is at least one page long and page aligned.
        let first = unsafe { &*words };
        assert_eq!(first.load(Ordering::Relaxed), 0);
        first.store(0xdead_beef, Ordering::Relaxed);
        assert_eq!(first.load(Ordering::Relaxed), 0xdead_beef);
        assert!(res.contains(res.base() as usize));
        assert!(!res.contains(res.base() as usize + res.len()));
    }

    #[test]
    fn test_discard_zeroes_range() {
        let ps = page_size();
        let res = ReserveOptions::new()
            .len(ps * 2)
            .reserve()
            .expect("failed to reserve");
        // SAFETY: second page is within the mapping.
        let word = unsafe { &*res.base().add(ps).cast::<AtomicUsize>() };
        word.store(7, Ordering::Relaxed);
        res.discard(ps, ps).expect("discard failed");
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_discard_rejects_bad_ranges() {
        let ps = page_size();
        let res = ReserveOptions::new().len(ps).reserve().expect("reserve");
        assert!(res.discard(1, ps).is_err());
        assert!(res.discard(0, res.len() + ps).is_err());
        assert!(res.discard(0, 0).is_ok());
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(ReserveOptions::new().reserve().is_err());
    }
}
