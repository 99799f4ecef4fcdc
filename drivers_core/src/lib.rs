//! Interrupt-driven I/O core: interrupt controllers, timers, GPIO, simple peripheral buses and
//! SD/MMC controllers, written against abstract register and time interfaces so that every
//! algorithm can run on the host under test.
#![no_std]
#![deny(missing_docs)]

extern crate alloc;

#[cfg(all(test, not(target_os = "none")))]
#[macro_use]
extern crate std;

pub mod gpio;
pub mod interrupt;
pub mod logger;
pub mod mailbox;
pub mod registers;
pub mod resources;
pub mod run_level;
pub mod sd;
pub mod spb;
pub mod time;
pub mod timer;
