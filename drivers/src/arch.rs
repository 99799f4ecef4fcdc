//! AArch64 run level and time glue.
//!
//! Run levels are tracked in software. Interrupt delivery to the processor is masked whenever the
//! run level is above [`RunLevel::DISPATCH`], so a device lock taken at its interrupt's run level
//! cannot be re-entered by that interrupt on the same processor. Time comes from the BCM2709
//! free-running 1MHz system timer.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use drivers_core::{
    registers::RegisterAccess,
    run_level::{RunLevel, RunLevelControl},
    time::TimeSource,
};
use spin::Once;

use crate::mmio::Mmio;

#[allow(unused, missing_docs)]
mod regs {
    pub const COUNTER_LOW: usize = 0x04;
    pub const COUNTER_HIGH: usize = 0x08;
}

/// Frequency of the system timer counter.
pub const SYSTEM_TIMER_FREQUENCY: u64 = 1_000_000;

static RUN_LEVEL: AtomicU8 = AtomicU8::new(RunLevel::LOW.0);
static RECENT_COUNTER: AtomicU64 = AtomicU64::new(0);
static SYSTEM_TIMER: Once<Mmio> = Once::new();
static INTERRUPTS_MASKED: AtomicBool = AtomicBool::new(false);

/// Serializes tests that move the processor-wide run level.
#[cfg(test)]
pub(crate) static RUN_LEVEL_TESTS: spin::Mutex<()> = spin::Mutex::new(());

/// Mask IRQs at the processor.
#[cfg(target_arch = "aarch64")]
fn disable_interrupts() {
    // SAFETY: only changes the IRQ mask bit.
    unsafe {
        core::arch::asm!("msr DAIFSet, #2", options(nomem, nostack));
    }
    INTERRUPTS_MASKED.store(true, Ordering::Release);
}

/// Unmask IRQs at the processor.
#[cfg(target_arch = "aarch64")]
fn enable_interrupts() {
    INTERRUPTS_MASKED.store(false, Ordering::Release);
    // SAFETY: only changes the IRQ mask bit.
    unsafe {
        core::arch::asm!("msr DAIFClr, #2", options(nomem, nostack));
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn disable_interrupts() {
    INTERRUPTS_MASKED.store(true, Ordering::Release);
}

#[cfg(not(target_arch = "aarch64"))]
fn enable_interrupts() {
    INTERRUPTS_MASKED.store(false, Ordering::Release);
}

/// Whether the run level currently keeps IRQs from reaching the processor.
pub fn interrupts_masked() -> bool {
    INTERRUPTS_MASKED.load(Ordering::Acquire)
}

/// The processor's run level.
#[derive(Debug, Default, Copy, Clone)]
pub struct ProcessorRunLevel;

impl RunLevelControl for ProcessorRunLevel {
    fn current(&self) -> RunLevel {
        RunLevel(RUN_LEVEL.load(Ordering::Acquire))
    }

    fn raise(&self, level: RunLevel) -> RunLevel {
        if level > RunLevel::DISPATCH {
            disable_interrupts();
        }
        RunLevel(RUN_LEVEL.fetch_max(level.0, Ordering::AcqRel))
    }

    fn lower(&self, level: RunLevel) {
        RUN_LEVEL.store(level.0, Ordering::Release);
        if level <= RunLevel::DISPATCH {
            enable_interrupts();
        }
    }
}

/// Install the system timer window used by [`SystemTime`]. Later calls are ignored.
pub fn init_time(system_timer: Mmio) {
    SYSTEM_TIMER.call_once(|| system_timer);
}

/// Read the 64-bit system counter, or zero before [`init_time`].
pub fn read_counter() -> u64 {
    let Some(timer) = SYSTEM_TIMER.get() else {
        return 0;
    };
    loop {
        let high = timer.read32(regs::COUNTER_HIGH);
        let low = timer.read32(regs::COUNTER_LOW);
        if timer.read32(regs::COUNTER_HIGH) == high {
            return (u64::from(high) << 32) | u64::from(low);
        }
    }
}

/// Record the counter for [`TimeSource::recent_counter`]. Called from the clock interrupt.
pub fn clock_tick() {
    RECENT_COUNTER.store(read_counter(), Ordering::Release);
}

/// Board time source.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemTime;

impl TimeSource for SystemTime {
    fn recent_counter(&self) -> u64 {
        RECENT_COUNTER.load(Ordering::Acquire)
    }

    fn query_counter(&self) -> u64 {
        read_counter()
    }

    fn frequency(&self) -> u64 {
        SYSTEM_TIMER_FREQUENCY
    }

    fn stall(&self, microseconds: u32) {
        let end = read_counter() + u64::from(microseconds);
        while read_counter() < end {
            core::hint::spin_loop();
        }
    }
}
