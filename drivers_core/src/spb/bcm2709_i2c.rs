//! Driver for the Broadcom BCM2709 I2C (BSC) controller.
//!
//! # Reference Documentation
//! - BCM2835 ARM Peripherals, chapter 3 "BSC".

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use log::{debug, trace};
use spin::Mutex;

use super::{
    BusConfiguration, BusKind, Error, FinishedTransfer, Progress, Rejected, SpbFunctions,
    SpbTransfer, SpbTransferFlags, TransferDirection,
};
use crate::{interrupt::InterruptStatus, registers::RegisterAccess, time::TimeSource};

/// Bytes moved per worker invocation.
pub const BUFFER_SIZE: usize = 16;

/// Largest value the data length register holds.
pub const DATA_LENGTH_MAX: usize = 0xFFFF;

const TEN_BIT_ADDRESS_HEADER: u32 = 0x78;

#[allow(unused, missing_docs)]
mod regs {
    pub const CONTROL: usize = 0x00;
    pub const STATUS: usize = 0x04;
    pub const DATA_LENGTH: usize = 0x08;
    pub const SLAVE_ADDRESS: usize = 0x0C;
    pub const DATA_FIFO: usize = 0x10;
    pub const CLOCK_DIVIDER: usize = 0x14;
    pub const DATA_DELAY: usize = 0x18;
    pub const CLOCK_STRETCH_TIMEOUT: usize = 0x1C;
}

bitflags! {
    /// Control register.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct Control: u32 {
        /// Controller enable.
        const ENABLE = 1 << 15;
        /// Interrupt while the receive FIFO needs reading.
        const INTERRUPT_RECEIVE = 1 << 10;
        /// Interrupt while the transmit FIFO needs writing.
        const INTERRUPT_TRANSMIT = 1 << 9;
        /// Interrupt when the transfer is done.
        const INTERRUPT_DONE = 1 << 8;
        /// Start a new transfer.
        const START_TRANSFER = 1 << 7;
        /// Clear the FIFO.
        const CLEAR_FIFO = 0x3 << 4;
        /// Read transfer.
        const READ_TRANSFER = 1 << 0;
    }
}

bitflags! {
    /// Status register.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct Status: u32 {
        /// The slave held the clock too long.
        const CLOCK_STRETCH_TIMEOUT = 1 << 9;
        /// The slave did not acknowledge its address.
        const ACK_ERROR = 1 << 8;
        /// Receive FIFO full.
        const RECEIVE_FIFO_FULL = 1 << 7;
        /// Transmit FIFO empty.
        const TRANSMIT_FIFO_EMPTY = 1 << 6;
        /// Receive FIFO holds data.
        const RECEIVE_FIFO_DATA = 1 << 5;
        /// Transmit FIFO can accept data.
        const TRANSMIT_FIFO_DATA = 1 << 4;
        /// Receive FIFO is getting full.
        const RECEIVE_FIFO_READING = 1 << 3;
        /// Transmit FIFO is getting empty.
        const TRANSMIT_FIFO_WRITING = 1 << 2;
        /// Transfer done.
        const TRANSFER_DONE = 1 << 1;
        /// Transfer active.
        const TRANSFER_ACTIVE = 1 << 0;
    }
}

#[derive(Default)]
struct Inner {
    transfer: Option<Box<SpbTransfer>>,
    slave_address: u16,
    ten_bit: bool,
}

/// BCM2709 I2C backend.
///
/// The interrupt mask, the control shadow and the pending status are atomics: they are what the
/// fast interrupt service routine touches. Everything else lives behind the lock.
pub struct Bcm2709I2c<R, T> {
    registers: R,
    time: T,
    pending_interrupts: AtomicU32,
    interrupt_mask: AtomicU32,
    control: AtomicU32,
    inner: Mutex<Inner>,
}

impl<R: RegisterAccess, T: TimeSource> Bcm2709I2c<R, T> {
    /// Create the backend over the controller's register window.
    pub fn new(registers: R, time: T) -> Self {
        Self {
            registers,
            time,
            pending_interrupts: AtomicU32::new(0),
            interrupt_mask: AtomicU32::new(0),
            control: AtomicU32::new(0),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Reset the controller to disabled.
    pub fn initialize(&self) {
        self.registers.write32(regs::CONTROL, 0);
    }

    fn status(&self) -> Status {
        Status::from_bits_retain(self.registers.read32(regs::STATUS))
    }

    fn setup_transfer(
        &self,
        inner: &mut Inner,
        mut transfer: Box<SpbTransfer>,
    ) -> Result<(), Rejected> {
        let reject = |reason, transfer| {
            Err(Rejected {
                error: Error::InvalidParameter { reason },
                transfer,
            })
        };
        if inner.transfer.is_some() {
            return reject("a transfer is already in flight", transfer);
        }
        if let Err(error) = transfer.validate() {
            return Err(Rejected { error, transfer });
        }

        let mut mask =
            Status::ACK_ERROR | Status::CLOCK_STRETCH_TIMEOUT | Status::TRANSFER_DONE;
        let mut control = Control::START_TRANSFER | Control::ENABLE | Control::INTERRUPT_DONE;
        let mut max_size = DATA_LENGTH_MAX;
        match transfer.direction {
            TransferDirection::In => {
                control |= Control::READ_TRANSFER | Control::INTERRUPT_RECEIVE;
                mask |= Status::RECEIVE_FIFO_READING;
            }
            TransferDirection::Out => {
                // the low address byte takes one slot of the data length
                if inner.ten_bit {
                    max_size -= 1;
                }
                control |= Control::INTERRUPT_TRANSMIT;
                mask |= Status::TRANSMIT_FIFO_WRITING;
            }
        }
        if transfer.size > max_size {
            return reject("transfer too large", transfer);
        }

        transfer.transmit_size_completed = 0;
        transfer.receive_size_completed = 0;

        // clear any old interrupts
        self.registers.write32(regs::CONTROL, 0);
        self.registers.write32(regs::STATUS, mask.bits());
        self.interrupt_mask.store(mask.bits(), Ordering::Release);

        let size = transfer.size as u32;
        if inner.ten_bit {
            let reading = transfer.direction == TransferDirection::In;
            self.registers
                .write32(regs::DATA_LENGTH, if reading { 1 } else { size + 1 });
            self.registers
                .write32(regs::DATA_FIFO, u32::from(inner.slave_address & 0xFF));

            // A read first writes the low address byte, then turns around once the hardware has
            // latched it.
            if reading {
                self.registers.write32(
                    regs::CONTROL,
                    (Control::ENABLE | Control::START_TRANSFER).bits(),
                );
                while !self.status().contains(Status::TRANSFER_ACTIVE) {
                    core::hint::spin_loop();
                }
                self.registers.write32(regs::DATA_LENGTH, size);
            }
        } else {
            self.registers.write32(regs::DATA_LENGTH, size);
        }

        let delay = transfer.microsecond_delay;
        inner.transfer = Some(transfer);
        self.control.store(control.bits(), Ordering::Release);
        self.registers.write32(regs::CONTROL, control.bits());
        if delay != 0 {
            self.time.stall(delay);
        }
        Ok(())
    }

    /// Move up to [`BUFFER_SIZE`] bytes between the transfer and the FIFO.
    fn transfer_data(
        &self,
        transfer: &mut SpbTransfer,
        status: Status,
    ) -> Result<Progress, Error> {
        let size = transfer.size;
        match transfer.direction {
            TransferDirection::Out => {
                if status.intersects(Status::TRANSFER_DONE | Status::TRANSMIT_FIFO_WRITING) {
                    let done = transfer.transmit_size_completed;
                    if done == size {
                        // queued bytes are not sent bytes; only the controller's done ends a write
                        if status.contains(Status::TRANSFER_DONE) {
                            return Ok(Progress::Done);
                        }
                    } else {
                        let count = BUFFER_SIZE.min(size - done);
                        let mut written = 0;
                        for &byte in transfer.window(done, count).iter() {
                            if !self.status().contains(Status::TRANSMIT_FIFO_DATA) {
                                break;
                            }
                            self.registers.write32(regs::DATA_FIFO, u32::from(byte));
                            written += 1;
                        }
                        transfer.transmit_size_completed += written;
                    }
                    if transfer.transmit_size_completed == size {
                        self.control
                            .fetch_and(!Control::INTERRUPT_TRANSMIT.bits(), Ordering::AcqRel);
                        self.interrupt_mask
                            .fetch_and(!Status::TRANSMIT_FIFO_WRITING.bits(), Ordering::AcqRel);
                    }
                }
            }
            TransferDirection::In => {
                if status.intersects(Status::TRANSFER_DONE | Status::RECEIVE_FIFO_READING) {
                    let done = transfer.receive_size_completed;
                    let count = BUFFER_SIZE.min(size - done);
                    let mut read = 0;
                    for slot in transfer.window(done, count).iter_mut() {
                        if !self.status().contains(Status::RECEIVE_FIFO_DATA) {
                            break;
                        }
                        *slot = self.registers.read32(regs::DATA_FIFO) as u8;
                        read += 1;
                    }
                    transfer.receive_size_completed += read;
                    if transfer.receive_size_completed >= size {
                        return Ok(Progress::Done);
                    }
                }
            }
        }

        // back to the armed control value, which turns the FIFO interrupts on again
        self.registers
            .write32(regs::CONTROL, self.control.load(Ordering::Acquire));
        Ok(Progress::MoreProcessing)
    }

    fn send_stop(&self) {
        self.control.store(0, Ordering::Release);
        self.registers.write32(regs::CONTROL, 0);
    }
}

impl<R: RegisterAccess, T: TimeSource> SpbFunctions for Bcm2709I2c<R, T> {
    fn configure_bus(&self, configuration: &BusConfiguration) -> Result<(), Error> {
        let BusKind::I2c {
            slave_address,
            ten_bit,
            slave_mode,
        } = configuration.kind
        else {
            return Err(Error::InvalidParameter {
                reason: "not an I2C bus",
            });
        };
        if slave_mode {
            return Err(Error::NotSupported);
        }

        let mut inner = self.inner.lock();
        // A 10-bit address puts the well-known header plus its top two bits in the address
        // register; the low byte goes through the FIFO per transfer.
        let address = if ten_bit {
            TEN_BIT_ADDRESS_HEADER | ((u32::from(slave_address) >> 8) & 0x3)
        } else {
            u32::from(slave_address) & 0x7F
        };
        self.registers
            .write32(regs::CONTROL, Control::CLEAR_FIFO.bits());
        self.registers.write32(regs::SLAVE_ADDRESS, address);
        inner.slave_address = slave_address;
        inner.ten_bit = ten_bit;
        debug!("BCM27 I2C: slave {slave_address:#x} ten bit {ten_bit}");
        Ok(())
    }

    fn submit_transfer(&self, transfer: Box<SpbTransfer>) -> Result<(), Rejected> {
        let mut inner = self.inner.lock();
        self.setup_transfer(&mut inner, transfer)
    }

    fn interrupt_service(&self) -> InterruptStatus {
        let status = self.registers.read32(regs::STATUS)
            & self.interrupt_mask.load(Ordering::Acquire);
        if status == 0 {
            return InterruptStatus::NotClaimed;
        }

        // Keep the FIFO interrupts from firing again until the worker has serviced them.
        let flags = Status::from_bits_retain(status);
        let control = self.control.load(Ordering::Acquire);
        let mut quieted = Control::from_bits_retain(control);
        if flags.contains(Status::TRANSMIT_FIFO_WRITING) {
            quieted.remove(Control::INTERRUPT_TRANSMIT);
        }
        if flags.contains(Status::RECEIVE_FIFO_READING) {
            quieted.remove(Control::INTERRUPT_RECEIVE);
        }
        if quieted.bits() != control {
            self.registers.write32(regs::CONTROL, quieted.bits());
        }

        self.registers.write32(regs::STATUS, status);
        self.pending_interrupts.fetch_or(status, Ordering::AcqRel);
        trace!("BCM27 I2C: interrupt {status:#x}");
        InterruptStatus::Claimed
    }

    fn interrupt_service_worker(&self) -> Option<FinishedTransfer> {
        let bits = self.pending_interrupts.swap(0, Ordering::AcqRel);
        if bits == 0 {
            return None;
        }
        let status = Status::from_bits_retain(bits);

        let mut inner = self.inner.lock();
        let mut transfer = inner.transfer.take()?;
        let result = if status.contains(Status::ACK_ERROR) {
            debug!("BCM27 I2C: error {bits:#010x}");
            Err(Error::DeviceIoError { status: bits })
        } else if status.contains(Status::CLOCK_STRETCH_TIMEOUT) {
            debug!("BCM27 I2C: clock stretch timeout {bits:#010x}");
            Err(Error::Timeout { status: bits })
        } else {
            match self.transfer_data(&mut transfer, status) {
                Ok(Progress::MoreProcessing) => {
                    inner.transfer = Some(transfer);
                    return None;
                }
                Ok(Progress::Done) => Ok(()),
                Err(e) => Err(e),
            }
        };

        // A failed transfer leaves the bus stopped even in the middle of a set.
        if result.is_err() || transfer.flags.contains(SpbTransferFlags::LAST) {
            self.send_stop();
        }
        Some(FinishedTransfer { transfer, result })
    }

    fn quiesce(&self) {
        let inner = self.inner.lock();
        if inner.transfer.is_none() {
            self.interrupt_mask.store(0, Ordering::Release);
            self.control.store(0, Ordering::Release);
            self.registers.write32(regs::CONTROL, 0);
        }
    }
}
