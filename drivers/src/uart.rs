//! PL011 UART driver.
//!
//! Documentation for the interface can be found [on ARM's website](https://developer.arm.com/documentation/ddi0183/latest/).
//! Only what the log sink needs is implemented: polled transmit at a fixed baud rate, 8N1.

use core::fmt::Write;

use bitfield::bitfield;
use drivers_core::{logger::LogSink, registers::RegisterAccess};

#[allow(unused, missing_docs)]
mod regs {
    pub const DATA: usize = 0x00;
    pub const FLAGS: usize = 0x18;
    pub const INTEGER_BAUD: usize = 0x24;
    pub const FRACTIONAL_BAUD: usize = 0x28;
    pub const LINE_CONTROL: usize = 0x2C;
    pub const CONTROL: usize = 0x30;
    pub const INTERRUPT_MASK: usize = 0x38;
    pub const INTERRUPT_CLEAR: usize = 0x44;

    pub const CONTROL_ENABLE: u32 = 1 << 0;
    pub const CONTROL_TRANSMIT_ENABLE: u32 = 1 << 8;
    pub const CONTROL_RECEIVE_ENABLE: u32 = 1 << 9;
}

bitfield! {
    struct Flags(u32);
    impl Debug;
    busy, _: 3;
    receive_empty, _: 4;
    transmit_full, _: 5;
}

bitfield! {
    struct LineControl(u32);
    u8;
    _, set_two_stop_bits: 3;
    _, set_fifo_enable: 4;
    _, set_word_length: 6, 5;
}

/// Integer and fractional baud rate divisors for `baud` from a `clock` Hz reference.
///
/// The divisor is `clock / (16 * baud)` with six fractional bits, rounded to nearest.
pub fn baud_divisors(clock: u32, baud: u32) -> (u32, u32) {
    let divisor_x64 = (u64::from(clock) * 4 + u64::from(baud) / 2) / u64::from(baud.max(1));
    ((divisor_x64 >> 6) as u32, (divisor_x64 & 0x3F) as u32)
}

/// The PL011 UART.
pub struct PL011<R> {
    registers: R,
}

impl<R: RegisterAccess> PL011<R> {
    /// Wrap a UART that firmware already configured.
    pub fn new(registers: R) -> Self {
        Self { registers }
    }

    /// Reprogram the UART for `baud` 8N1 from a `clock` Hz reference.
    pub fn configure(&self, clock: u32, baud: u32) {
        self.registers.write32(regs::CONTROL, 0);
        while self.flags().busy() {}
        let (integer, fraction) = baud_divisors(clock, baud);
        self.registers.write32(regs::INTERRUPT_MASK, 0);
        self.registers.write32(regs::INTERRUPT_CLEAR, 0x7FF);
        self.registers.write32(regs::INTEGER_BAUD, integer);
        self.registers.write32(regs::FRACTIONAL_BAUD, fraction);
        let mut line = LineControl(0);
        line.set_fifo_enable(true);
        line.set_word_length(0b11);
        self.registers.write32(regs::LINE_CONTROL, line.0);
        self.registers.write32(
            regs::CONTROL,
            regs::CONTROL_ENABLE | regs::CONTROL_TRANSMIT_ENABLE | regs::CONTROL_RECEIVE_ENABLE,
        );
    }

    fn flags(&self) -> Flags {
        Flags(self.registers.read32(regs::FLAGS))
    }

    /// Transmit one byte, waiting for room in the FIFO.
    pub fn write_byte(&self, byte: u8) {
        while self.flags().transmit_full() {}
        self.registers.write32(regs::DATA, u32::from(byte));
    }
}

impl<R: RegisterAccess> Write for PL011<R> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

impl<R: RegisterAccess> LogSink for PL011<R> {
    fn accept(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use std::vec::Vec;
    use test_case::test_case;

    /// Records data register writes; flags always read idle.
    #[derive(Default)]
    struct Wire(RefCell<Vec<(usize, u32)>>);

    impl RegisterAccess for Wire {
        fn read32(&self, _offset: usize) -> u32 {
            0
        }

        fn write32(&self, offset: usize, value: u32) {
            self.0.borrow_mut().push((offset, value));
        }
    }

    #[test_case(48_000_000, 115_200 => (26, 3); "48MHz reference")]
    #[test_case(3_000_000, 115_200 => (1, 40); "3MHz reference")]
    #[test_case(24_000_000, 9600 => (156, 16); "slow line")]
    fn divisors(clock: u32, baud: u32) -> (u32, u32) {
        baud_divisors(clock, baud)
    }

    #[test]
    fn newlines_gain_carriage_returns() {
        let wire = Wire::default();
        let mut uart = PL011::new(&wire);
        uart.accept(b"ok\n");
        let data: Vec<u32> = wire
            .0
            .borrow()
            .iter()
            .filter(|(offset, _)| *offset == regs::DATA)
            .map(|(_, value)| *value)
            .collect();
        assert_eq!(data, [b'o', b'k', b'\r', b'\n'].map(u32::from));
    }

    #[test]
    fn configure_disables_before_divisors() {
        let wire = Wire::default();
        PL011::new(&wire).configure(48_000_000, 115_200);
        let writes = wire.0.borrow();
        assert_eq!(writes.first(), Some(&(regs::CONTROL, 0)));
        assert!(writes.contains(&(regs::INTEGER_BAUD, 26)));
        assert!(writes.contains(&(regs::FRACTIONAL_BAUD, 3)));
        assert!(writes.contains(&(regs::LINE_CONTROL, 0x70)));
        assert_eq!(writes.last().map(|w| w.0), Some(regs::CONTROL));
    }
}
