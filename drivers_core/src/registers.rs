//! Register access primitives.
//!
//! Every block handled by this crate is a window of 32-bit registers at byte offsets from a
//! mapped base. Drivers never touch memory directly; they go through [`RegisterAccess`] so that
//! the same code runs against real MMIO or against a fake register bank under test.

/// Access to a window of 32-bit device registers.
///
/// Offsets are in bytes from the start of the window. No narrower or unaligned access is ever
/// performed.
#[cfg_attr(test, mockall::automock)]
pub trait RegisterAccess {
    /// Read the register at `offset`.
    fn read32(&self, offset: usize) -> u32;

    /// Write `value` to the register at `offset`.
    fn write32(&self, offset: usize, value: u32);
}

/// Read-modify-write helpers available on every [`RegisterAccess`].
pub trait RegisterAccessExt: RegisterAccess {
    /// Read-modify-write the register at `offset`.
    ///
    /// This is two separate bus accesses; callers must hold whatever lock protects the register.
    fn modify32(&self, offset: usize, f: impl FnOnce(u32) -> u32) {
        let value = self.read32(offset);
        self.write32(offset, f(value));
    }

    /// Set the bits of `mask` in the register at `offset`.
    fn set_bits32(&self, offset: usize, mask: u32) {
        self.modify32(offset, |v| v | mask);
    }

    /// Clear the bits of `mask` in the register at `offset`.
    fn clear_bits32(&self, offset: usize, mask: u32) {
        self.modify32(offset, |v| v & !mask);
    }
}

impl<R: RegisterAccess + ?Sized> RegisterAccessExt for R {}

impl<R: RegisterAccess + ?Sized> RegisterAccess for &R {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value);
    }
}

impl<R: RegisterAccess + ?Sized> RegisterAccess for alloc::sync::Arc<R> {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value);
    }
}

/// Busy-wait for a fixed number of iterations.
///
/// Used for silicon-mandated settle times where no calibrated timer is involved.
#[inline(never)]
pub fn spin_delay(iterations: u32) {
    for _ in 0..iterations {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! An in-memory register bank for tests.

    use super::RegisterAccess;
    use hashbrown::HashMap;
    use std::{collections::VecDeque, sync::Mutex, vec::Vec};

    /// A register bank that remembers values, records every write and can script reads.
    #[derive(Default)]
    pub struct FakeRegisters {
        values: Mutex<HashMap<usize, u32>>,
        held: Mutex<HashMap<usize, u32>>,
        scripted: Mutex<HashMap<usize, VecDeque<u32>>>,
        writes: Mutex<Vec<(usize, u32)>>,
        reads: Mutex<Vec<usize>>,
    }

    impl FakeRegisters {
        pub fn new() -> Self {
            Self::default()
        }

        /// Set the stored value of a register without recording a write.
        pub fn set(&self, offset: usize, value: u32) {
            self.values.lock().unwrap().insert(offset, value);
        }

        /// Reads of `offset` always return `value`, regardless of writes.
        pub fn hold(&self, offset: usize, value: u32) {
            self.held.lock().unwrap().insert(offset, value);
        }

        pub fn release(&self, offset: usize) {
            self.held.lock().unwrap().remove(&offset);
        }

        /// Queue values returned by successive reads of `offset` before falling back.
        pub fn script(&self, offset: usize, values: &[u32]) {
            self.scripted
                .lock()
                .unwrap()
                .entry(offset)
                .or_default()
                .extend(values.iter().copied());
        }

        pub fn get(&self, offset: usize) -> u32 {
            self.values
                .lock()
                .unwrap()
                .get(&offset)
                .copied()
                .unwrap_or(0)
        }

        pub fn writes(&self) -> Vec<(usize, u32)> {
            self.writes.lock().unwrap().clone()
        }

        pub fn writes_to(&self, offset: usize) -> Vec<u32> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .filter(|(o, _)| *o == offset)
                .map(|(_, v)| *v)
                .collect()
        }

        pub fn reads_of(&self, offset: usize) -> usize {
            self.reads
                .lock()
                .unwrap()
                .iter()
                .filter(|o| **o == offset)
                .count()
        }

        pub fn clear_log(&self) {
            self.writes.lock().unwrap().clear();
            self.reads.lock().unwrap().clear();
        }
    }

    impl RegisterAccess for FakeRegisters {
        fn read32(&self, offset: usize) -> u32 {
            self.reads.lock().unwrap().push(offset);
            if let Some(v) = self
                .scripted
                .lock()
                .unwrap()
                .get_mut(&offset)
                .and_then(VecDeque::pop_front)
            {
                return v;
            }
            if let Some(v) = self.held.lock().unwrap().get(&offset) {
                return *v;
            }
            self.get(offset)
        }

        fn write32(&self, offset: usize, value: u32) {
            self.writes.lock().unwrap().push((offset, value));
            self.values.lock().unwrap().insert(offset, value);
        }
    }
}
