//! Memory mapped register windows.
use core::ptr::NonNull;

use drivers_core::registers::RegisterAccess;

/// A window of device registers mapped into the address space.
#[derive(Debug)]
pub struct Mmio {
    base: NonNull<u32>,
    size: usize,
}

// SAFETY: the window is device memory. Every access is a single volatile 32-bit read or write,
// and drivers serialize multi-register sequences with their own locks.
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
    /// Wrap `size` bytes of registers starting at `base`.
    ///
    /// # Safety
    /// `base` must be the 4-byte aligned virtual address of a mapped device window of at least
    /// `size` bytes, and nothing else may treat that memory as ordinary memory.
    pub unsafe fn new(base: usize, size: usize) -> Option<Self> {
        if base % 4 != 0 {
            return None;
        }
        NonNull::new(base as *mut u32).map(|base| Self { base, size })
    }

    /// Size of the window in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    fn register(&self, offset: usize) -> *mut u32 {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.size,
            "register offset {offset:#x} outside window of {:#x} bytes",
            self.size
        );
        // SAFETY: in bounds of the window, checked above.
        unsafe { self.base.as_ptr().byte_add(offset) }
    }
}

impl RegisterAccess for Mmio {
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: see `Mmio::new`.
        unsafe { self.register(offset).read_volatile() }
    }

    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: see `Mmio::new`.
        unsafe { self.register(offset).write_volatile(value) }
    }
}
