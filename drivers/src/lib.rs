//! Board support for the BCM2709 (Raspberry Pi 2/3).
//!
//! Binds the portable drivers in `drivers_core` to real registers: memory-mapped register
//! windows, the processor's run level and time source, the PL011 log console, and the device set
//! started from firmware-provided resources.
#![no_std]
#![deny(missing_docs)]

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod arch;
pub mod board;
pub mod logging;
pub mod mmio;
pub mod uart;
