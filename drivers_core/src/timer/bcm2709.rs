//! Driver for the BCM2709 timers.
//!
//! Two register blocks are involved. The ARM timer is an SP804 derivative providing a periodic
//! down-counter and a free-running counter, both clocked from the APB clock through a
//! predivider. The system timer is a 64-bit counter with four compare registers, of which 1 and 3
//! are not claimed by the GPU and can be used as interrupt sources.
//!
//! # Reference Documentation
//! - BCM2835 ARM Peripherals, chapter 12 "System Timer" and chapter 14 "Timer (ARM side)".

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use bitfield::bitfield;
use log::debug;

use super::{Error, HardwareTimer, InvalidParameterSnafu, TimerFeatures, TimerMode};
use crate::{interrupt::Line, registers::RegisterAccess};

#[allow(unused, missing_docs)]
mod arm_regs {
    pub const LOAD: usize = 0x00;
    pub const CURRENT: usize = 0x04;
    pub const CONTROL: usize = 0x08;
    pub const INTERRUPT_CLEAR: usize = 0x0C;
    pub const RAW_STATUS: usize = 0x10;
    pub const STATUS: usize = 0x14;
    pub const BACKGROUND_LOAD: usize = 0x18;
    pub const PREDIVIDER: usize = 0x1C;
    pub const FREE_RUNNING: usize = 0x20;
}

#[allow(unused, missing_docs)]
mod system_regs {
    pub const CONTROL: usize = 0x00;
    pub const COUNTER_LOW: usize = 0x04;
    pub const COUNTER_HIGH: usize = 0x08;
    pub const COMPARE0: usize = 0x0C;
    pub const COMPARE1: usize = 0x10;
    pub const COMPARE2: usize = 0x14;
    pub const COMPARE3: usize = 0x18;
}

/// The ARM timer is programmed to run as close to this as the predivider allows.
pub const ARM_TIMER_TARGET_FREQUENCY: u64 = 1_000_000;

/// Largest value the ARM timer predivider register holds.
pub const ARM_TIMER_PREDIVIDER_MAX: u32 = 0x1FF;

bitfield! {
    struct ArmTimerControl(u32);
    impl Debug;
    u8, free_running_divide, set_free_running_divide: 23, 16;
    free_running_enabled, set_free_running_enabled: 9;
    enabled, set_enabled: 7;
    interrupt_enable, set_interrupt_enable: 5;
    u8, prescale, set_prescale: 3, 2;
    counter_32bit, set_counter_32bit: 1;
}

/// Choose the ARM timer predivider for an APB clock frequency.
///
/// Returns the predivider and the resulting timer frequency, which is
/// `apb_frequency / (predivider + 1)`.
#[must_use]
pub fn arm_timer_predivider(apb_frequency: u64) -> (u32, u64) {
    let max_frequency = ARM_TIMER_TARGET_FREQUENCY * (u64::from(ARM_TIMER_PREDIVIDER_MAX) + 1);
    if apb_frequency <= ARM_TIMER_TARGET_FREQUENCY {
        (0, apb_frequency)
    } else if apb_frequency <= max_frequency {
        let predivider = apb_frequency / ARM_TIMER_TARGET_FREQUENCY - 1;
        (predivider as u32, ARM_TIMER_TARGET_FREQUENCY)
    } else {
        (
            ARM_TIMER_PREDIVIDER_MAX,
            apb_frequency / (u64::from(ARM_TIMER_PREDIVIDER_MAX) + 1),
        )
    }
}

/// Which of the BCM2709 timers an instance drives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Bcm2709TimerKind {
    /// The SP804-style down counter.
    ArmPeriodic,
    /// The ARM timer's free-running counter.
    ArmCounter,
    /// The 64-bit system counter.
    SystemCounter,
    /// System timer compare channel 1.
    SystemPeriodic1,
    /// System timer compare channel 3.
    SystemPeriodic3,
}

impl Bcm2709TimerKind {
    fn uses_arm_block(self) -> bool {
        matches!(self, Self::ArmPeriodic | Self::ArmCounter)
    }

    fn compare_channel(self) -> Option<(usize, u32)> {
        match self {
            Self::SystemPeriodic1 => Some((system_regs::COMPARE1, 1 << 1)),
            Self::SystemPeriodic3 => Some((system_regs::COMPARE3, 1 << 3)),
            _ => None,
        }
    }
}

/// Board description needed to register the BCM2709 timers.
#[derive(Debug, Copy, Clone)]
pub struct Bcm2709TimerConfig {
    /// Frequency of the APB clock feeding the ARM timer.
    pub apb_clock_frequency: u64,
    /// Frequency of the system timer counter.
    pub system_timer_frequency: u64,
    /// Interrupt line of the ARM timer.
    pub arm_timer_line: Line,
    /// Interrupt line of system timer compare channel 0; channel `n` is this plus `n`.
    pub system_timer_line_base: Line,
}

const MODE_INVALID: u8 = 0;
const MODE_PERIODIC: u8 = 1;
const MODE_ONE_SHOT: u8 = 2;

/// One BCM2709 timer.
pub struct Bcm2709Timer<R> {
    kind: Bcm2709TimerKind,
    registers: R,
    predivider: u32,
    frequency: u64,
    line: Option<Line>,
    /// Odd while `mode` and `ticks` are being changed.
    generation: AtomicU32,
    mode: AtomicU8,
    ticks: AtomicU32,
}

impl<R: RegisterAccess> Bcm2709Timer<R> {
    /// Create a timer of `kind` over the register block it lives in: the ARM timer block for the
    /// `Arm*` kinds and the system timer block otherwise.
    pub fn new(kind: Bcm2709TimerKind, registers: R, config: &Bcm2709TimerConfig) -> Self {
        let (predivider, arm_frequency) = arm_timer_predivider(config.apb_clock_frequency);
        let (frequency, line) = match kind {
            Bcm2709TimerKind::ArmPeriodic => (arm_frequency, Some(config.arm_timer_line)),
            Bcm2709TimerKind::ArmCounter => (arm_frequency, None),
            Bcm2709TimerKind::SystemCounter => (config.system_timer_frequency, None),
            Bcm2709TimerKind::SystemPeriodic1 => (
                config.system_timer_frequency,
                Some(config.system_timer_line_base + 1),
            ),
            Bcm2709TimerKind::SystemPeriodic3 => (
                config.system_timer_frequency,
                Some(config.system_timer_line_base + 3),
            ),
        };
        Self {
            kind,
            registers,
            predivider,
            frequency,
            line,
            generation: AtomicU32::new(0),
            mode: AtomicU8::new(MODE_INVALID),
            ticks: AtomicU32::new(0),
        }
    }

    /// Which timer this is.
    pub fn kind(&self) -> Bcm2709TimerKind {
        self.kind
    }

    fn arm_control(&self) -> ArmTimerControl {
        ArmTimerControl(self.registers.read32(arm_regs::CONTROL))
    }

    fn write_arm_control(&self, control: &ArmTimerControl) {
        self.registers.write32(arm_regs::CONTROL, control.0);
    }

    fn set_schedule(&self, mode: u8, ticks: u32) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.mode.store(mode, Ordering::Release);
        self.ticks.store(ticks, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn rearm_compare(&self, compare_register: usize) {
        loop {
            let generation = self.generation.load(Ordering::Acquire);
            let mode = self.mode.load(Ordering::Acquire);
            let ticks = self.ticks.load(Ordering::Acquire);
            let check = self.generation.load(Ordering::Acquire);
            // someone is arming or disarming right now; they will program the compare
            if generation != check || generation % 2 != 0 || mode == MODE_INVALID {
                return;
            }

            let counter = self.registers.read32(system_regs::COUNTER_LOW);
            let mut compare = counter.wrapping_add(ticks);
            if mode == MODE_PERIODIC {
                let next = self
                    .registers
                    .read32(compare_register)
                    .wrapping_add(ticks);
                if (counter.wrapping_sub(next) as i32) < 0 {
                    compare = next;
                }
            }
            self.registers.write32(compare_register, compare);

            if self.generation.load(Ordering::Acquire) == check {
                return;
            }
        }
    }
}

impl<R: RegisterAccess> HardwareTimer for Bcm2709Timer<R> {
    fn initialize(&self) -> Result<(), Error> {
        match self.kind {
            Bcm2709TimerKind::ArmPeriodic => {
                self.registers
                    .write32(arm_regs::PREDIVIDER, self.predivider);
                let mut control = self.arm_control();
                control.set_interrupt_enable(false);
                control.set_enabled(true);
                control.set_prescale(0);
                control.set_counter_32bit(true);
                self.registers.write32(arm_regs::LOAD, u32::MAX);
                self.write_arm_control(&control);
                self.registers.write32(arm_regs::INTERRUPT_CLEAR, 1);
            }
            Bcm2709TimerKind::ArmCounter => {
                let mut control = self.arm_control();
                control.set_free_running_divide(self.predivider as u8);
                control.set_free_running_enabled(true);
                self.write_arm_control(&control);
            }
            Bcm2709TimerKind::SystemPeriodic1 | Bcm2709TimerKind::SystemPeriodic3 => {
                if let Some((_, matched)) = self.kind.compare_channel() {
                    self.registers.write32(system_regs::CONTROL, matched);
                }
            }
            Bcm2709TimerKind::SystemCounter => {}
        }
        debug!(
            "BCM2709 {:?} timer at {} Hz",
            self.kind, self.frequency
        );
        Ok(())
    }

    fn read_counter(&self) -> u64 {
        match self.kind {
            Bcm2709TimerKind::ArmPeriodic => {
                u64::from(u32::MAX - self.registers.read32(arm_regs::CURRENT))
            }
            Bcm2709TimerKind::ArmCounter => {
                u64::from(self.registers.read32(arm_regs::FREE_RUNNING))
            }
            Bcm2709TimerKind::SystemPeriodic1 | Bcm2709TimerKind::SystemPeriodic3 => {
                u64::from(self.registers.read32(system_regs::COUNTER_LOW))
            }
            Bcm2709TimerKind::SystemCounter => loop {
                let high = self.registers.read32(system_regs::COUNTER_HIGH);
                let low = self.registers.read32(system_regs::COUNTER_LOW);
                if self.registers.read32(system_regs::COUNTER_HIGH) == high {
                    break (u64::from(high) << 32) | u64::from(low);
                }
            },
        }
    }

    fn arm(&self, mode: TimerMode, ticks: u64) -> Result<(), Error> {
        let ticks = u32::try_from(ticks).unwrap_or(u32::MAX);
        match self.kind {
            Bcm2709TimerKind::ArmPeriodic => {
                // The load and background load registers must not both be written within one
                // timer clock, so the timer is stopped while the load value is moved in.
                let mut control = self.arm_control();
                control.set_enabled(false);
                self.write_arm_control(&control);
                self.registers.write32(arm_regs::LOAD, ticks);
                control.set_enabled(true);
                control.set_prescale(0);
                control.set_counter_32bit(true);
                control.set_interrupt_enable(true);
                self.write_arm_control(&control);
                if mode == TimerMode::OneShot {
                    self.registers
                        .write32(arm_regs::BACKGROUND_LOAD, u32::MAX);
                }
                Ok(())
            }
            Bcm2709TimerKind::SystemPeriodic1 | Bcm2709TimerKind::SystemPeriodic3 => {
                let Some((compare_register, matched)) = self.kind.compare_channel() else {
                    return InvalidParameterSnafu.fail();
                };
                let mode = match mode {
                    TimerMode::Periodic => MODE_PERIODIC,
                    TimerMode::OneShot => MODE_ONE_SHOT,
                };
                self.set_schedule(mode, ticks);
                self.registers.write32(system_regs::CONTROL, matched);
                let counter = self.registers.read32(system_regs::COUNTER_LOW);
                self.registers
                    .write32(compare_register, counter.wrapping_add(ticks));
                Ok(())
            }
            Bcm2709TimerKind::ArmCounter | Bcm2709TimerKind::SystemCounter => {
                InvalidParameterSnafu.fail()
            }
        }
    }

    fn disarm(&self) {
        match self.kind {
            Bcm2709TimerKind::ArmPeriodic => {
                let mut control = self.arm_control();
                control.set_interrupt_enable(false);
                control.set_enabled(true);
                control.set_prescale(0);
                control.set_counter_32bit(true);
                self.write_arm_control(&control);
                self.registers.write32(arm_regs::INTERRUPT_CLEAR, 1);
            }
            // compare channels cannot be disabled; they just stop being re-armed
            Bcm2709TimerKind::SystemPeriodic1 | Bcm2709TimerKind::SystemPeriodic3 => {
                self.set_schedule(MODE_INVALID, 0);
            }
            Bcm2709TimerKind::ArmCounter | Bcm2709TimerKind::SystemCounter => {}
        }
    }

    fn acknowledge_interrupt(&self) {
        match self.kind {
            Bcm2709TimerKind::ArmPeriodic => {
                self.registers.write32(arm_regs::INTERRUPT_CLEAR, 1);
            }
            Bcm2709TimerKind::SystemPeriodic1 | Bcm2709TimerKind::SystemPeriodic3 => {
                if let Some((compare_register, matched)) = self.kind.compare_channel() {
                    self.registers.write32(system_regs::CONTROL, matched);
                    self.rearm_compare(compare_register);
                }
            }
            Bcm2709TimerKind::ArmCounter | Bcm2709TimerKind::SystemCounter => {}
        }
    }

    fn features(&self) -> TimerFeatures {
        match self.kind {
            Bcm2709TimerKind::ArmPeriodic => {
                TimerFeatures::READABLE
                    | TimerFeatures::PERIODIC
                    | TimerFeatures::ONE_SHOT
                    | TimerFeatures::P_STATE_VARIANT
            }
            Bcm2709TimerKind::ArmCounter => {
                TimerFeatures::READABLE | TimerFeatures::P_STATE_VARIANT
            }
            Bcm2709TimerKind::SystemCounter => TimerFeatures::READABLE,
            Bcm2709TimerKind::SystemPeriodic1 | Bcm2709TimerKind::SystemPeriodic3 => {
                TimerFeatures::READABLE | TimerFeatures::PERIODIC | TimerFeatures::ONE_SHOT
            }
        }
    }

    fn counter_frequency(&self) -> u64 {
        self.frequency
    }

    fn counter_bit_width(&self) -> u32 {
        if self.kind == Bcm2709TimerKind::SystemCounter {
            64
        } else {
            32
        }
    }

    fn interrupt_line(&self) -> Option<Line> {
        self.line
    }
}

/// Every timer on a BCM2709, sharing the two register blocks.
pub struct Bcm2709Timers<R> {
    /// The ARM periodic timer.
    pub arm_periodic: Bcm2709Timer<R>,
    /// The ARM free-running counter.
    pub arm_counter: Bcm2709Timer<R>,
    /// The 64-bit system counter.
    pub system_counter: Bcm2709Timer<R>,
    /// System timer compare channel 1.
    pub system_periodic1: Bcm2709Timer<R>,
    /// System timer compare channel 3.
    pub system_periodic3: Bcm2709Timer<R>,
}

impl<R: RegisterAccess + Clone> Bcm2709Timers<R> {
    /// Create every timer. `arm_block` and `system_block` are the two register windows.
    pub fn new(arm_block: R, system_block: R, config: &Bcm2709TimerConfig) -> Self {
        let make = |kind: Bcm2709TimerKind| {
            let block = if kind.uses_arm_block() {
                arm_block.clone()
            } else {
                system_block.clone()
            };
            Bcm2709Timer::new(kind, block, config)
        };
        Self {
            arm_periodic: make(Bcm2709TimerKind::ArmPeriodic),
            arm_counter: make(Bcm2709TimerKind::ArmCounter),
            system_counter: make(Bcm2709TimerKind::SystemCounter),
            system_periodic1: make(Bcm2709TimerKind::SystemPeriodic1),
            system_periodic3: make(Bcm2709TimerKind::SystemPeriodic3),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::{
        arm_regs, arm_timer_predivider, system_regs, Bcm2709Timer, Bcm2709TimerConfig,
        Bcm2709TimerKind,
    };
    use crate::{
        registers::fake::FakeRegisters,
        timer::{Error, HardwareTimer, TimerFeatures, TimerMode},
    };

    const CONFIG: Bcm2709TimerConfig = Bcm2709TimerConfig {
        apb_clock_frequency: 250_000_000,
        system_timer_frequency: 1_000_000,
        arm_timer_line: 64,
        system_timer_line_base: 0,
    };

    fn timer(kind: Bcm2709TimerKind) -> Bcm2709Timer<FakeRegisters> {
        Bcm2709Timer::new(kind, FakeRegisters::new(), &CONFIG)
    }

    test_hardware_timer!(ArmPeriodic, timer(Bcm2709TimerKind::ArmPeriodic));
    test_hardware_timer!(ArmCounter, timer(Bcm2709TimerKind::ArmCounter));
    test_hardware_timer!(SystemCounter, timer(Bcm2709TimerKind::SystemCounter));
    test_hardware_timer!(SystemPeriodic1, timer(Bcm2709TimerKind::SystemPeriodic1));
    test_hardware_timer!(SystemPeriodic3, timer(Bcm2709TimerKind::SystemPeriodic3));

    #[test_case(500_000 => (0, 500_000); "slow apb runs undivided")]
    #[test_case(1_000_000 => (0, 1_000_000); "exact target")]
    #[test_case(250_000_000 => (249, 1_000_000); "typical apb")]
    #[test_case(1_000_000_000 => (0x1FF, 1_000_000_000 / 0x200); "clamped")]
    fn predivider(apb: u64) -> (u32, u64) {
        arm_timer_predivider(apb)
    }

    #[test]
    fn arm_periodic_init() {
        let t = timer(Bcm2709TimerKind::ArmPeriodic);
        t.registers.set(arm_regs::CONTROL, 0x20);
        t.initialize().unwrap();
        assert_eq!(t.registers.writes_to(arm_regs::PREDIVIDER), [249]);
        assert_eq!(t.registers.writes_to(arm_regs::LOAD), [u32::MAX]);
        assert_eq!(t.registers.writes_to(arm_regs::CONTROL), [0x80 | 0x2]);
        assert_eq!(t.registers.writes_to(arm_regs::INTERRUPT_CLEAR), [1]);
        assert_eq!(t.interrupt_line(), Some(64));
        assert_eq!(t.counter_frequency(), 1_000_000);
    }

    #[test]
    fn arm_counter_init_sets_divider() {
        let t = timer(Bcm2709TimerKind::ArmCounter);
        t.initialize().unwrap();
        assert_eq!(t.registers.writes_to(arm_regs::CONTROL), [(249 << 16) | 0x200]);
        assert_eq!(t.interrupt_line(), None);
    }

    #[test]
    fn arm_periodic_one_shot() {
        let t = timer(Bcm2709TimerKind::ArmPeriodic);
        t.registers.set(arm_regs::CONTROL, 0x82);
        t.arm(TimerMode::OneShot, 1 << 40).unwrap();
        assert_eq!(t.registers.writes(), [
            (arm_regs::CONTROL, 0x02),
            (arm_regs::LOAD, u32::MAX),
            (arm_regs::CONTROL, 0xA2),
            (arm_regs::BACKGROUND_LOAD, u32::MAX),
        ]);
    }

    #[test]
    fn arm_periodic_periodic_leaves_background_load() {
        let t = timer(Bcm2709TimerKind::ArmPeriodic);
        t.arm(TimerMode::Periodic, 1000).unwrap();
        assert_eq!(t.registers.writes_to(arm_regs::LOAD), [1000]);
        assert!(t.registers.writes_to(arm_regs::BACKGROUND_LOAD).is_empty());
    }

    #[test]
    fn arm_periodic_read_counts_up() {
        let t = timer(Bcm2709TimerKind::ArmPeriodic);
        t.registers.set(arm_regs::CURRENT, u32::MAX - 10);
        assert_eq!(t.read_counter(), 10);
    }

    #[test_case(Bcm2709TimerKind::ArmCounter)]
    #[test_case(Bcm2709TimerKind::SystemCounter)]
    fn counters_cannot_be_armed(kind: Bcm2709TimerKind) {
        let t = timer(kind);
        assert!(matches!(
            t.arm(TimerMode::Periodic, 5),
            Err(Error::InvalidParameter)
        ));
        assert!(t.registers.writes().is_empty());
    }

    #[test]
    fn system_counter_rereads_torn_value() {
        let t = timer(Bcm2709TimerKind::SystemCounter);
        t.registers.script(system_regs::COUNTER_HIGH, &[1, 2, 2, 2]);
        t.registers.script(system_regs::COUNTER_LOW, &[0xFFFF_FFFF, 5]);
        assert_eq!(t.read_counter(), (2 << 32) | 5);
        assert_eq!(t.counter_bit_width(), 64);
        assert_eq!(t.features(), TimerFeatures::READABLE);
    }

    #[test]
    fn system_periodic_arm_programs_compare() {
        let t = timer(Bcm2709TimerKind::SystemPeriodic3);
        t.registers.set(system_regs::COUNTER_LOW, 1000);
        t.arm(TimerMode::Periodic, 500).unwrap();
        assert_eq!(t.registers.writes_to(system_regs::CONTROL), [1 << 3]);
        assert_eq!(t.registers.writes_to(system_regs::COMPARE3), [1500]);
        assert_eq!(t.interrupt_line(), Some(3));
    }

    #[test]
    fn periodic_acknowledge_advances_compare() {
        let t = timer(Bcm2709TimerKind::SystemPeriodic1);
        t.registers.set(system_regs::COUNTER_LOW, 1000);
        t.arm(TimerMode::Periodic, 500).unwrap();
        t.registers.set(system_regs::COUNTER_LOW, 1510);
        t.registers.clear_log();
        t.acknowledge_interrupt();
        assert_eq!(t.registers.writes_to(system_regs::CONTROL), [1 << 1]);
        assert_eq!(t.registers.writes_to(system_regs::COMPARE1), [2000]);
    }

    #[test]
    fn periodic_acknowledge_catches_up_after_slip() {
        let t = timer(Bcm2709TimerKind::SystemPeriodic1);
        t.registers.set(system_regs::COUNTER_LOW, 1000);
        t.arm(TimerMode::Periodic, 500).unwrap();
        t.registers.set(system_regs::COUNTER_LOW, 9000);
        t.registers.clear_log();
        t.acknowledge_interrupt();
        assert_eq!(t.registers.writes_to(system_regs::COMPARE1), [9500]);
    }

    #[test]
    fn periodic_acknowledge_across_wrap() {
        let t = timer(Bcm2709TimerKind::SystemPeriodic1);
        t.registers.set(system_regs::COUNTER_LOW, u32::MAX - 100);
        t.arm(TimerMode::Periodic, 500).unwrap();
        assert_eq!(t.registers.writes_to(system_regs::COMPARE1), [399]);
        t.registers.set(system_regs::COUNTER_LOW, 400);
        t.registers.clear_log();
        t.acknowledge_interrupt();
        assert_eq!(t.registers.writes_to(system_regs::COMPARE1), [899]);
    }

    #[test]
    fn disarmed_compare_not_rearmed() {
        let t = timer(Bcm2709TimerKind::SystemPeriodic1);
        t.arm(TimerMode::OneShot, 500).unwrap();
        t.disarm();
        t.registers.clear_log();
        t.acknowledge_interrupt();
        assert_eq!(t.registers.writes(), [(system_regs::CONTROL, 1 << 1)]);
    }

    #[test]
    fn arm_periodic_disarm_clears_interrupt() {
        let t = timer(Bcm2709TimerKind::ArmPeriodic);
        t.registers.set(arm_regs::CONTROL, 0xA2);
        t.disarm();
        assert_eq!(t.registers.writes_to(arm_regs::CONTROL), [0x82]);
        assert_eq!(t.registers.writes_to(arm_regs::INTERRUPT_CLEAR), [1]);
    }
}
