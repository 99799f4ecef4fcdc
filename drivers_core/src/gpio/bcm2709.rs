//! Driver for the Broadcom BCM2709 (BCM2835/6/7) GPIO block.
//!
//! # Reference Documentation
//! - BCM2835 ARM Peripherals, chapter 6 "General Purpose I/O (GPIO)".

use log::trace;
use snafu::ensure;

use super::{Error, GpioFlags, GpioFunctions, InvalidPinSnafu, PinConfiguration};
use crate::{
    interrupt::InterruptCause,
    registers::{spin_delay, RegisterAccess, RegisterAccessExt},
};

/// Number of pins on the block.
pub const LINE_COUNT: u32 = 54;

/// Default pull-up resistors after reset, indexed by `pin / 32`.
pub const PULL_UP_DEFAULTS: [u32; 2] = [0x0000_01FF, 0x003F_C01C];

/// Default pull-down resistors after reset, indexed by `pin / 32`.
pub const PULL_DOWN_DEFAULTS: [u32; 2] = [0xCFFF_FE00, 0x0000_0FE3];

/// Cycles the pull control signals must be held before and after clocking.
const PULL_SETTLE_CYCLES: u32 = 150;

#[allow(unused, missing_docs)]
mod regs {
    pub const SELECT0: usize = 0x00;
    pub const OUTPUT_SET0: usize = 0x1C;
    pub const OUTPUT_CLEAR0: usize = 0x28;
    pub const LEVEL0: usize = 0x34;
    pub const EVENT_STATUS0: usize = 0x40;
    pub const EVENT_STATUS1: usize = 0x44;
    pub const RISING_EDGE0: usize = 0x4C;
    pub const FALLING_EDGE0: usize = 0x58;
    pub const HIGH_DETECT0: usize = 0x64;
    pub const LOW_DETECT0: usize = 0x70;
    pub const ASYNC_RISING_EDGE0: usize = 0x7C;
    pub const ASYNC_FALLING_EDGE0: usize = 0x88;
    pub const PULL_ENABLE: usize = 0x94;
    pub const PULL_CLOCK0: usize = 0x98;
    pub const PULL_CLOCK1: usize = 0x9C;
}

const FUNCTION_SELECT_PINS_PER_REGISTER: u32 = 10;
const FUNCTION_SELECT_BITS: u32 = 3;
const FUNCTION_SELECT_MASK: u32 = 0x7;
const FUNCTION_INPUT: u32 = 0x0;
const FUNCTION_OUTPUT: u32 = 0x1;

/// Values for the pull enable register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum Pull {
    /// Disable both resistors.
    None = 0,
    /// Enable the pull-down.
    Down = 1,
    /// Enable the pull-up.
    Up = 2,
}

/// The pull state a pin has after reset.
#[must_use]
pub fn default_pull(pin: u32) -> Pull {
    let index = (pin / 32) as usize;
    let mask = 1 << (pin % 32);
    debug_assert_eq!(PULL_UP_DEFAULTS[index] & PULL_DOWN_DEFAULTS[index] & mask, 0);
    if PULL_DOWN_DEFAULTS[index] & mask != 0 {
        Pull::Down
    } else if PULL_UP_DEFAULTS[index] & mask != 0 {
        Pull::Up
    } else {
        Pull::None
    }
}

/// Split a pin into the register bank offset (0 or 4) and its bit.
fn bank(pin: u32) -> (usize, u32) {
    if pin >= 32 {
        (4, 1 << (pin - 32))
    } else {
        (0, 1 << pin)
    }
}

/// BCM2709 GPIO backend.
pub struct Bcm2709Gpio<R> {
    registers: R,
    /// Interrupt flags of every pin. The detect-enable registers aggregate many pins, so
    /// masking and unmasking a single pin needs to know which of them it was using.
    pin_interrupt_state: [GpioFlags; LINE_COUNT as usize],
}

impl<R: RegisterAccess> Bcm2709Gpio<R> {
    /// Create the backend over the block's register window.
    pub fn new(registers: R) -> Self {
        Self {
            registers,
            pin_interrupt_state: [GpioFlags::empty(); LINE_COUNT as usize],
        }
    }

    fn check_pin(pin: u32) -> Result<(), Error> {
        ensure!(pin < LINE_COUNT, InvalidPinSnafu { pin });
        Ok(())
    }

    fn mask_pin(&self, pin: u32, enable: bool) {
        let flags = self.pin_interrupt_state[pin as usize];
        let (offset, mask) = bank(pin);
        let update = |register: usize| {
            self.registers.modify32(register + offset, |v| {
                if enable {
                    v | mask
                } else {
                    v & !mask
                }
            });
        };

        if flags.contains(GpioFlags::INTERRUPT_EDGE_TRIGGERED) {
            if flags.contains(GpioFlags::INTERRUPT_RISING_EDGE) {
                update(regs::RISING_EDGE0);
            }
            if flags.contains(GpioFlags::INTERRUPT_FALLING_EDGE) {
                update(regs::FALLING_EDGE0);
            }
        } else if flags.contains(GpioFlags::INTERRUPT_ACTIVE_LOW) {
            update(regs::LOW_DETECT0);
        } else {
            update(regs::HIGH_DETECT0);
        }
    }

    /// Program a pull resistor with the two-stage clocked sequence the pull control block needs.
    fn set_pull(&self, pin: u32, pull: Pull) {
        let (offset, mask) = bank(pin);
        let clock = regs::PULL_CLOCK0 + offset;
        self.registers.write32(regs::PULL_ENABLE, pull as u32);
        spin_delay(PULL_SETTLE_CYCLES);
        self.registers.write32(clock, mask);
        spin_delay(PULL_SETTLE_CYCLES);
        self.registers.write32(regs::PULL_ENABLE, 0);
        self.registers.write32(clock, 0);
    }
}

impl<R: RegisterAccess> GpioFunctions for Bcm2709Gpio<R> {
    fn set_configuration(
        &mut self,
        pin: u32,
        configuration: &PinConfiguration,
    ) -> Result<(), Error> {
        Self::check_pin(pin)?;
        let flags = configuration.flags;

        // Nothing may fire while the pin is in flux.
        self.mask_pin(pin, false);
        self.set_direction(pin, flags)?;
        if !flags.contains(GpioFlags::OUTPUT) && flags.contains(GpioFlags::INTERRUPT) {
            self.pin_interrupt_state[pin as usize] = flags;
            self.mask_pin(pin, true);
        } else {
            self.pin_interrupt_state[pin as usize] = GpioFlags::empty();
        }

        let pull = if flags.contains(GpioFlags::PULL_NONE) {
            Pull::None
        } else if flags.contains(GpioFlags::PULL_UP) {
            Pull::Up
        } else if flags.contains(GpioFlags::PULL_DOWN) {
            Pull::Down
        } else {
            default_pull(pin)
        };
        self.set_pull(pin, pull);
        trace!("GPIO pin {pin} configured {flags:?} pull {pull:?}");
        Ok(())
    }

    fn set_direction(&mut self, pin: u32, flags: GpioFlags) -> Result<(), Error> {
        Self::check_pin(pin)?;
        let register = regs::SELECT0 + (pin / FUNCTION_SELECT_PINS_PER_REGISTER) as usize * 4;
        let shift = (pin % FUNCTION_SELECT_PINS_PER_REGISTER) * FUNCTION_SELECT_BITS;
        let function = if flags.contains(GpioFlags::OUTPUT) {
            self.set_value(pin, flags.contains(GpioFlags::OUTPUT_HIGH));
            FUNCTION_OUTPUT
        } else {
            FUNCTION_INPUT
        };

        // clear the field before setting it
        let value = self.registers.read32(register) & !(FUNCTION_SELECT_MASK << shift);
        self.registers.write32(register, value);
        self.registers.write32(register, value | (function << shift));
        Ok(())
    }

    fn set_value(&mut self, pin: u32, value: bool) {
        if pin >= LINE_COUNT {
            return;
        }
        let (offset, mask) = bank(pin);
        let register = if value {
            regs::OUTPUT_SET0
        } else {
            regs::OUTPUT_CLEAR0
        };
        self.registers.write32(register + offset, mask);
    }

    fn get_value(&mut self, pin: u32) -> Option<bool> {
        if pin >= LINE_COUNT {
            return None;
        }
        let (offset, mask) = bank(pin);
        Some(self.registers.read32(regs::LEVEL0 + offset) & mask != 0)
    }

    fn prepare_for_interrupts(&mut self) -> Result<(), Error> {
        self.pin_interrupt_state = [GpioFlags::empty(); LINE_COUNT as usize];
        for register in [
            regs::RISING_EDGE0,
            regs::FALLING_EDGE0,
            regs::HIGH_DETECT0,
            regs::LOW_DETECT0,
            regs::ASYNC_RISING_EDGE0,
            regs::ASYNC_FALLING_EDGE0,
        ] {
            self.registers.write32(register, 0);
            self.registers.write32(register + 4, 0);
        }
        self.registers.write32(regs::EVENT_STATUS0, u32::MAX);
        self.registers.write32(regs::EVENT_STATUS1, 0x003F_FFFF);
        Ok(())
    }

    fn mask_interrupt_line(&mut self, pin: u32, enable: bool) {
        if pin < LINE_COUNT {
            self.mask_pin(pin, enable);
        }
    }

    fn begin_interrupt(&mut self) -> InterruptCause<u32> {
        let low = self.registers.read32(regs::EVENT_STATUS0);
        let (status, base) = if low != 0 {
            (low, 0)
        } else {
            (self.registers.read32(regs::EVENT_STATUS1), 32)
        };
        if status == 0 {
            return InterruptCause::NoInterruptHere;
        }
        let line = status.trailing_zeros() + base;
        InterruptCause::LineFired { line, token: line }
    }

    fn end_of_interrupt(&mut self, pin: u32) {
        let register = if pin >= 32 {
            regs::EVENT_STATUS1
        } else {
            regs::EVENT_STATUS0
        };
        self.registers.write32(register, 1 << (pin % 32));
    }
}

#[cfg(test)]
mod tests {
    use std::{boxed::Box, sync::Arc, vec::Vec};

    use test_case::test_case;

    use super::*;
    use crate::{
        gpio::{GpioController, GpioFeatures, GpioRegistration},
        interrupt::{Connection, InterruptStatus},
        registers::fake::FakeRegisters,
        run_level::fake::TrackedRunLevel,
    };

    fn gpio() -> Bcm2709Gpio<Arc<FakeRegisters>> {
        Bcm2709Gpio::new(Arc::new(FakeRegisters::new()))
    }

    fn input_interrupt(flags: GpioFlags) -> PinConfiguration {
        PinConfiguration {
            flags: GpioFlags::INTERRUPT | flags,
            ..Default::default()
        }
    }

    #[test]
    fn pull_defaults_never_overlap() {
        for pin in 0..LINE_COUNT {
            let index = (pin / 32) as usize;
            let mask = 1u32 << (pin % 32);
            assert!(
                PULL_UP_DEFAULTS[index] & mask == 0 || PULL_DOWN_DEFAULTS[index] & mask == 0,
                "pin {pin} has both default pulls"
            );
            let _ = default_pull(pin);
        }
    }

    #[test_case(0 => Pull::Up)]
    #[test_case(9 => Pull::Down)]
    #[test_case(28 => Pull::None)]
    #[test_case(34 => Pull::Up)]
    #[test_case(40 => Pull::Down)]
    #[test_case(46 => Pull::Up)]
    fn default_pulls(pin: u32) -> Pull {
        default_pull(pin)
    }

    #[test]
    fn pull_sequence_order() {
        let mut g = gpio();
        g.set_configuration(
            35,
            &PinConfiguration {
                flags: GpioFlags::PULL_DOWN,
                ..Default::default()
            },
        )
        .unwrap();
        let pull_writes: Vec<_> = g
            .registers
            .writes()
            .into_iter()
            .filter(|(o, _)| [regs::PULL_ENABLE, regs::PULL_CLOCK0, regs::PULL_CLOCK1].contains(o))
            .collect();
        assert_eq!(
            pull_writes,
            [
                (regs::PULL_ENABLE, Pull::Down as u32),
                (regs::PULL_CLOCK1, 1 << 3),
                (regs::PULL_ENABLE, 0),
                (regs::PULL_CLOCK1, 0),
            ]
        );
    }

    #[test]
    fn explicit_pull_none_beats_default() {
        let mut g = gpio();
        g.set_configuration(
            2,
            &PinConfiguration {
                flags: GpioFlags::PULL_NONE,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(g.registers.writes_to(regs::PULL_ENABLE), [0, 0]);
        assert_eq!(g.registers.writes_to(regs::PULL_CLOCK0), [1 << 2, 0]);
    }

    #[test]
    fn output_direction_sets_value_then_function() {
        let mut g = gpio();
        g.registers.set(regs::SELECT0 + 4, 0xFFFF_FFFF);
        g.set_direction(13, GpioFlags::OUTPUT | GpioFlags::OUTPUT_HIGH)
            .unwrap();
        assert_eq!(g.registers.writes(), [
            (regs::OUTPUT_SET0, 1 << 13),
            (regs::SELECT0 + 4, 0xFFFF_FFFF & !(0x7 << 9)),
            (regs::SELECT0 + 4, (0xFFFF_FFFF & !(0x7 << 9)) | (1 << 9)),
        ]);
    }

    #[test]
    fn values_round_trip_on_looped_pins() {
        let mut g = gpio();
        for pin in [4, 31, 32, 53] {
            let (offset, mask) = bank(pin);
            for value in [true, false, true] {
                g.set_value(pin, value);
                let register = if value {
                    regs::OUTPUT_SET0
                } else {
                    regs::OUTPUT_CLEAR0
                };
                assert_eq!(g.registers.get(register + offset), mask);
                // loop the output back onto the level register
                g.registers
                    .set(regs::LEVEL0 + offset, if value { mask } else { 0 });
                assert_eq!(g.get_value(pin), Some(value));
                assert_eq!(g.get_value(pin), Some(value));
            }
        }
        assert_eq!(g.get_value(54), None);
    }

    #[test]
    fn invalid_pin_rejected() {
        let mut g = gpio();
        assert!(matches!(
            g.set_configuration(54, &PinConfiguration::default()),
            Err(Error::InvalidPin { pin: 54 })
        ));
        assert!(matches!(
            g.set_direction(60, GpioFlags::OUTPUT),
            Err(Error::InvalidPin { pin: 60 })
        ));
        assert!(g.registers.writes().is_empty());
    }

    #[test]
    fn interrupt_pin_masked_before_reprogram() {
        let mut g = gpio();
        let rising = input_interrupt(GpioFlags::INTERRUPT_EDGE_TRIGGERED | GpioFlags::INTERRUPT_RISING_EDGE);
        g.set_configuration(40, &rising).unwrap();
        assert_eq!(g.registers.get(regs::RISING_EDGE0 + 4), 1 << 8);

        // reconfigure as falling: the old rising enable goes first, then the falling one
        g.registers.clear_log();
        let falling = input_interrupt(GpioFlags::INTERRUPT_EDGE_TRIGGERED | GpioFlags::INTERRUPT_FALLING_EDGE);
        g.set_configuration(40, &falling).unwrap();
        let writes = g.registers.writes();
        let rising_off = writes
            .iter()
            .position(|w| *w == (regs::RISING_EDGE0 + 4, 0))
            .unwrap();
        let falling_on = writes
            .iter()
            .position(|w| *w == (regs::FALLING_EDGE0 + 4, 1 << 8))
            .unwrap();
        assert!(rising_off < falling_on);
    }

    #[test]
    fn level_low_uses_low_detect() {
        let mut g = gpio();
        g.set_configuration(7, &input_interrupt(GpioFlags::INTERRUPT_ACTIVE_LOW))
            .unwrap();
        assert_eq!(g.registers.get(regs::LOW_DETECT0), 1 << 7);
        g.mask_interrupt_line(7, false);
        assert_eq!(g.registers.get(regs::LOW_DETECT0), 0);
        assert_eq!(g.registers.get(regs::HIGH_DETECT0), 0);
    }

    #[test]
    fn prepare_clears_detects_and_events() {
        let mut g = gpio();
        g.prepare_for_interrupts().unwrap();
        assert_eq!(g.registers.writes_to(regs::EVENT_STATUS0), [u32::MAX]);
        assert_eq!(g.registers.writes_to(regs::EVENT_STATUS1), [0x003F_FFFF]);
        assert_eq!(g.registers.writes_to(regs::ASYNC_FALLING_EDGE0 + 4), [0]);
    }

    #[test]
    fn high_bank_event_reports_exact_pin() {
        let regs_bank = Arc::new(FakeRegisters::new());
        let controller = GpioController::new(
            GpioRegistration {
                functions: Box::new(Bcm2709Gpio::new(regs_bank.clone())),
                line_count: LINE_COUNT,
                features: GpioFeatures::INTERRUPTS,
            },
            Arc::new(TrackedRunLevel::default()),
        )
        .unwrap();
        controller.start(Some(49)).unwrap();

        let rising = input_interrupt(GpioFlags::INTERRUPT_EDGE_TRIGGERED | GpioFlags::INTERRUPT_RISING_EDGE);
        let h5 = controller.open_pin(5).unwrap();
        let h40 = controller.open_pin(40).unwrap();
        controller.set_configuration(&h5, &rising).unwrap();
        controller.set_configuration(&h40, &rising).unwrap();

        let fired = Arc::new(std::sync::Mutex::new(Vec::new()));
        for pin in [5, 40] {
            let fired = fired.clone();
            controller
                .connect_pin_interrupt(
                    pin,
                    Connection {
                        service: Some(Arc::new(move || {
                            fired.lock().unwrap().push(pin);
                            InterruptStatus::Claimed
                        })),
                        worker: None,
                    },
                )
                .unwrap();
        }

        regs_bank.clear_log();
        regs_bank.set(regs::EVENT_STATUS0, 0);
        regs_bank.set(regs::EVENT_STATUS1, 1 << 8);
        assert_eq!(controller.interrupt_service(), InterruptStatus::Claimed);
        assert_eq!(*fired.lock().unwrap(), [40]);
        assert_eq!(regs_bank.writes(), [(regs::EVENT_STATUS1, 1 << 8)]);
    }

    #[test]
    fn begin_reports_no_interrupt_when_quiet() {
        let mut g = gpio();
        assert_eq!(g.begin_interrupt(), InterruptCause::NoInterruptHere);
        g.registers.set(regs::EVENT_STATUS0, 0b1010_0000);
        assert_eq!(
            g.begin_interrupt(),
            InterruptCause::LineFired { line: 5, token: 5 }
        );
    }
}
