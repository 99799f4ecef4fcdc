//! Driver for the RockChip RK32xx I2C controller.
//!
//! The start condition to address byte window on this controller is too short to leave to the
//! deferred worker, so the fast interrupt service routine writes the address itself.
//!
//! # Reference Documentation
//! - RK3288 Technical Reference Manual, chapter "I2C Interface".

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};
use spin::Mutex;

use super::{
    BusConfiguration, BusKind, Error, FinishedTransfer, Progress, Rejected, SpbFunctions,
    SpbTransfer, SpbTransferFlags, TransferDirection,
};
use crate::{interrupt::InterruptStatus, registers::RegisterAccess, time::TimeSource};

/// Size of the transmit and receive data register banks.
pub const BUFFER_SIZE: usize = 32;

#[allow(unused, missing_docs)]
mod regs {
    pub const CONTROL: usize = 0x00;
    pub const CLOCK_DIVIDER: usize = 0x04;
    pub const MASTER_RECEIVE_SLAVE_ADDRESS: usize = 0x08;
    pub const MASTER_RECEIVE_SLAVE_REGISTER: usize = 0x0C;
    pub const MASTER_TRANSMIT_COUNT: usize = 0x10;
    pub const MASTER_RECEIVE_COUNT: usize = 0x14;
    pub const INTERRUPT_ENABLE: usize = 0x18;
    pub const INTERRUPT_PENDING: usize = 0x1C;
    pub const FINISHED_COUNT: usize = 0x20;
    pub const TRANSMIT_DATA0: usize = 0x100;
    pub const RECEIVE_DATA0: usize = 0x200;
}

const SLAVE_ADDRESS_SHIFT: u32 = 1;
const SLAVE_ADDRESS_MASK: u32 = 0xFE;
const SLAVE_ADDRESS_LOW_BYTE_VALID: u32 = 1 << 24;

bitflags! {
    /// Control register.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct Control: u32 {
        /// Controller enable.
        const ENABLE = 1 << 0;
        /// Receive mode. Transmit mode is all mode bits clear.
        const MODE_RECEIVE = 0x2 << 1;
        /// Generate a start condition.
        const START = 1 << 3;
        /// Generate a stop condition.
        const STOP = 1 << 4;
        /// Answer the next received byte with a NAK.
        const SEND_NAK = 1 << 5;
        /// Stop the transfer when a NAK is received.
        const STOP_ON_NAK = 1 << 6;
    }
}

bitflags! {
    /// Interrupt enable and pending registers.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct Interrupt: u32 {
        /// A byte was transmitted.
        const BYTE_TRANSMIT_FINISHED = 1 << 0;
        /// A byte was received.
        const BYTE_RECEIVE_FINISHED = 1 << 1;
        /// The transmit count was sent.
        const MASTER_TRANSMIT_FINISHED = 1 << 2;
        /// The receive count was received.
        const MASTER_RECEIVE_FINISHED = 1 << 3;
        /// A start condition went out.
        const START = 1 << 4;
        /// A stop condition went out.
        const STOP = 1 << 5;
        /// The slave answered with a NAK.
        const NAK = 1 << 6;
    }
}

#[derive(Default)]
struct Inner {
    transfer: Option<Box<SpbTransfer>>,
}

/// RK32xx I2C backend.
pub struct Rk32I2c<R, T> {
    registers: R,
    time: T,
    pending_interrupts: AtomicU32,
    interrupt_mask: AtomicU32,
    control: AtomicU32,
    /// The interrupt service routine builds the address byte from these two.
    slave_address: AtomicU32,
    reading: AtomicBool,
    inner: Mutex<Inner>,
}

impl<R: RegisterAccess, T: TimeSource> Rk32I2c<R, T> {
    /// Create the backend over the controller's register window.
    pub fn new(registers: R, time: T) -> Self {
        Self {
            registers,
            time,
            pending_interrupts: AtomicU32::new(0),
            interrupt_mask: AtomicU32::new(0),
            control: AtomicU32::new(0),
            slave_address: AtomicU32::new(0),
            reading: AtomicBool::new(false),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Disable the controller and its interrupts.
    pub fn initialize(&self) {
        self.registers.write32(regs::INTERRUPT_ENABLE, 0);
        self.registers.write32(regs::CONTROL, 0);
    }

    fn write_control(&self, control: Control) {
        self.control.store(control.bits(), Ordering::Release);
        self.registers.write32(regs::CONTROL, control.bits());
    }

    fn setup_transfer(
        &self,
        inner: &mut Inner,
        mut transfer: Box<SpbTransfer>,
    ) -> Result<(), Rejected> {
        if inner.transfer.is_some() {
            return Err(Rejected {
                error: Error::InvalidParameter {
                    reason: "a transfer is already in flight",
                },
                transfer,
            });
        }
        if let Err(error) = transfer.validate() {
            return Err(Rejected { error, transfer });
        }

        self.reading.store(
            transfer.direction == TransferDirection::In,
            Ordering::Release,
        );
        transfer.transmit_size_completed = 0;
        transfer.receive_size_completed = 0;

        let mask = Interrupt::NAK
            | Interrupt::START
            | Interrupt::MASTER_TRANSMIT_FINISHED
            | Interrupt::MASTER_RECEIVE_FINISHED;

        // clear any old interrupts
        self.registers.write32(regs::CONTROL, 0);
        self.registers.write32(regs::INTERRUPT_ENABLE, 0);
        self.registers
            .write32(regs::INTERRUPT_PENDING, Interrupt::all().bits());

        let delay = transfer.microsecond_delay;
        inner.transfer = Some(transfer);
        self.write_control(Control::START | Control::ENABLE | Control::STOP_ON_NAK);
        if delay != 0 {
            self.time.stall(delay);
        }

        self.interrupt_mask.store(mask.bits(), Ordering::Release);
        self.registers
            .write32(regs::INTERRUPT_ENABLE, mask.bits());
        Ok(())
    }

    fn transfer_data(
        &self,
        transfer: &mut SpbTransfer,
        status: Interrupt,
    ) -> Result<Progress, Error> {
        let mut buffer = [0u8; BUFFER_SIZE];
        let size = transfer.size;
        match transfer.direction {
            TransferDirection::Out => {
                if !status.contains(Interrupt::MASTER_TRANSMIT_FINISHED) {
                    debug!("RK32 I2C: unexpected interrupt {status:?} while writing");
                    return Ok(Progress::MoreProcessing);
                }
                let done = transfer.transmit_size_completed;
                if done == size {
                    return Ok(Progress::Done);
                }
                let count = BUFFER_SIZE.min(size - done);
                buffer[..count].copy_from_slice(transfer.window(done, count));
                for (index, word) in buffer[..count.next_multiple_of(4)].chunks(4).enumerate() {
                    self.registers.write32(
                        regs::TRANSMIT_DATA0 + index * 4,
                        LittleEndian::read_u32(word),
                    );
                }
                transfer.transmit_size_completed += count;
                // kick off the next write
                self.registers
                    .write32(regs::MASTER_TRANSMIT_COUNT, count as u32);
            }
            TransferDirection::In => {
                if status.contains(Interrupt::MASTER_RECEIVE_FINISHED) {
                    let done = transfer.receive_size_completed;
                    let count = BUFFER_SIZE.min(size - done);
                    for (index, word) in buffer[..count.next_multiple_of(4)]
                        .chunks_mut(4)
                        .enumerate()
                    {
                        LittleEndian::write_u32(
                            word,
                            self.registers.read32(regs::RECEIVE_DATA0 + index * 4),
                        );
                    }
                    transfer
                        .window(done, count)
                        .copy_from_slice(&buffer[..count]);
                    transfer.receive_size_completed += count;
                    if transfer.receive_size_completed >= size {
                        return Ok(Progress::Done);
                    }
                } else if status.contains(Interrupt::MASTER_TRANSMIT_FINISHED) {
                    // the address is out; turn the bus around
                    self.write_control(Control::ENABLE | Control::STOP_ON_NAK | Control::MODE_RECEIVE);
                } else {
                    debug!("RK32 I2C: unexpected interrupt {status:?} while reading");
                    return Ok(Progress::MoreProcessing);
                }

                // ask for the next batch, ending it with a NAK if it is the last
                let count = BUFFER_SIZE.min(size - transfer.receive_size_completed);
                if transfer.receive_size_completed + count >= size {
                    let control = Control::from_bits_retain(self.control.load(Ordering::Acquire));
                    self.write_control(control | Control::SEND_NAK);
                }
                self.registers
                    .write32(regs::MASTER_RECEIVE_COUNT, count as u32);
            }
        }
        Ok(Progress::MoreProcessing)
    }

    fn send_stop(&self) {
        let control = Control::from_bits_retain(self.control.load(Ordering::Acquire));
        self.registers.write32(
            regs::CONTROL,
            (control | Control::STOP | Control::ENABLE).bits(),
        );
        while !Interrupt::from_bits_retain(self.registers.read32(regs::INTERRUPT_PENDING))
            .contains(Interrupt::STOP)
        {
            core::hint::spin_loop();
        }
        self.registers
            .write32(regs::INTERRUPT_PENDING, Interrupt::STOP.bits());
        self.write_control(Control::empty());
    }
}

impl<R: RegisterAccess, T: TimeSource> SpbFunctions for Rk32I2c<R, T> {
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
        // The address byte is written straight into the FIFO, which has no room for a 10-bit
        // address.
        if slave_mode || ten_bit {
            return Err(Error::NotSupported);
        }

        let _inner = self.inner.lock();
        let address = ((u32::from(slave_address) << SLAVE_ADDRESS_SHIFT) & SLAVE_ADDRESS_MASK)
            | SLAVE_ADDRESS_LOW_BYTE_VALID;
        self.registers
            .write32(regs::MASTER_RECEIVE_SLAVE_ADDRESS, address);
        self.slave_address
            .store(u32::from(slave_address), Ordering::Release);
        debug!("RK32 I2C: slave {slave_address:#x}");
        Ok(())
    }

    fn submit_transfer(&self, transfer: Box<SpbTransfer>) -> Result<(), Rejected> {
        let mut inner = self.inner.lock();
        self.setup_transfer(&mut inner, transfer)
    }

    fn interrupt_service(&self) -> InterruptStatus {
        let status = self.registers.read32(regs::INTERRUPT_PENDING)
            & self.interrupt_mask.load(Ordering::Acquire);
        if status == 0 {
            return InterruptStatus::NotClaimed;
        }
        self.registers.write32(regs::INTERRUPT_PENDING, status);

        let mut status = Interrupt::from_bits_retain(status);
        if status.contains(Interrupt::START) {
            let control = Control::from_bits_retain(self.control.load(Ordering::Acquire));
            self.write_control(control - Control::START);
            let mut address = self.slave_address.load(Ordering::Acquire) << 1;
            if self.reading.load(Ordering::Acquire) {
                address |= 1;
            }
            self.registers.write32(regs::TRANSMIT_DATA0, address);
            self.registers.write32(regs::MASTER_TRANSMIT_COUNT, 1);
            status.remove(Interrupt::START);
        }

        if !status.is_empty() {
            self.pending_interrupts
                .fetch_or(status.bits(), Ordering::AcqRel);
        }
        trace!("RK32 I2C: interrupt {status:?}");
        InterruptStatus::Claimed
    }

    fn interrupt_service_worker(&self) -> Option<FinishedTransfer> {
        let bits = self.pending_interrupts.swap(0, Ordering::AcqRel);
        if bits == 0 {
            return None;
        }
        let status = Interrupt::from_bits_retain(bits);

        let mut inner = self.inner.lock();
        let mut transfer = inner.transfer.take()?;
        let result = if status.contains(Interrupt::NAK) {
            debug!("RK32 I2C: error {bits:#010x}");
            Err(Error::DeviceIoError { status: bits })
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

        if result.is_err() || transfer.flags.contains(SpbTransferFlags::LAST) {
            self.send_stop();
        }
        Some(FinishedTransfer { transfer, result })
    }

    fn quiesce(&self) {
        let inner = self.inner.lock();
        if inner.transfer.is_none() {
            self.interrupt_mask.store(0, Ordering::Release);
            self.registers.write32(regs::INTERRUPT_ENABLE, 0);
        }
    }
}
