use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

fn system_info() -> SYSTEM_INFO {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// Returns the system allocation granularity (typically 64KB).
pub fn allocation_granularity() -> usize {
    match system_info().dwAllocationGranularity as usize {
        0 => 65536,
        gran => gran,
    }
}

pub fn page_size() -> usize {
    match system_info().dwPageSize as usize {
        0 => 4096,
        size => size,
    }
}

pub struct MapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MapInner {
    /// Reserves and commits a read/write range.
    ///
    /// # Safety
    ///
    /// Calls `VirtualAlloc`; the caller owns the returned range.
    pub unsafe fn map_anon(len: usize, _populate: bool, _no_reserve: bool) -> io::Result<Self> {
        let ptr = unsafe {
            VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    /// Decommit and recommit `[offset, offset + len)`, leaving it zero filled.
    ///
    /// # Safety
    ///
    /// The range must lie within this mapping and be page aligned.
    pub unsafe fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) }.cast::<std::ffi::c_void>();
        if unsafe { VirtualFree(addr, len, MEM_DECOMMIT) } == 0 {
            return Err(Error::last_os_error());
        }
        if unsafe { VirtualAlloc(addr, len, MEM_COMMIT, PAGE_READWRITE) }.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                // MEM_RELEASE requires dwSize to be 0
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}
