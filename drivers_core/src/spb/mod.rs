//! Simple peripheral bus (I2C, SPI) controller library.
//!
//! A bus backend implements [`SpbFunctions`]: it runs exactly one [`SpbTransfer`] at a time and
//! rejects a second submission outright. [`SpbController`] is the consumer layer on top of it. It
//! queues whole [`TransferSet`]s, feeds their transfers to the backend one after another, and
//! reports each finished set to its [`TransferCompletion`].
//!
//! Backends split interrupt handling in two. [`SpbFunctions::interrupt_service`] runs at the
//! interrupt run level and only latches status into an atomic. The deferred
//! [`SpbFunctions::interrupt_service_worker`] moves data and hands back a finished transfer, after
//! which the controller notifies the consumer without any backend lock held and immediately starts
//! the next transfer.

use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};

use bitflags::bitflags;
use log::{debug, trace, warn};
use snafu::{ensure, Snafu};
use spin::Mutex;

use crate::interrupt::{Connection, InterruptStatus};

pub mod bcm2709_i2c;
pub mod rk32_i2c;

/// Direction of a transfer, from the controller's point of view.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferDirection {
    /// Read from the device.
    In,
    /// Write to the device.
    Out,
}

bitflags! {
    /// Position of a transfer within its set.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct SpbTransferFlags: u32 {
        /// The first transfer of a set; the bus is started.
        const FIRST = 1 << 0;
        /// The last transfer of a set; the bus is stopped when it finishes.
        const LAST = 1 << 1;
    }
}

/// Errors from bus operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A parameter was rejected.
    #[snafu(display("invalid parameter: {reason}"))]
    InvalidParameter {
        /// What was wrong.
        reason: &'static str,
    },
    /// The controller cannot do what was asked.
    NotSupported,
    /// The device did not acknowledge.
    #[snafu(display("device I/O error, status {status:#x}"))]
    DeviceIoError {
        /// Raw interrupt status that reported the error.
        status: u32,
    },
    /// The device held the clock too long.
    #[snafu(display("bus timeout, status {status:#x}"))]
    Timeout {
        /// Raw interrupt status that reported the timeout.
        status: u32,
    },
}

/// Result of one data movement step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Progress {
    /// The transfer is still running; wait for the next interrupt.
    MoreProcessing,
    /// The transfer finished.
    Done,
}

/// One discrete data movement on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpbTransfer {
    /// Direction of the data.
    pub direction: TransferDirection,
    /// Data to send, or space to receive into.
    pub buffer: Vec<u8>,
    /// Byte offset into `buffer` where the transfer starts.
    pub offset: usize,
    /// Number of bytes to move.
    pub size: usize,
    /// Delay after the transfer is started, in microseconds.
    pub microsecond_delay: u32,
    /// Position within the set. Filled in by [`SpbController::submit`].
    pub flags: SpbTransferFlags,
    /// Bytes sent so far.
    pub transmit_size_completed: usize,
    /// Bytes received so far.
    pub receive_size_completed: usize,
}

impl SpbTransfer {
    /// A transfer that writes all of `data`.
    pub fn write(data: Vec<u8>) -> Self {
        Self {
            direction: TransferDirection::Out,
            size: data.len(),
            buffer: data,
            offset: 0,
            microsecond_delay: 0,
            flags: SpbTransferFlags::empty(),
            transmit_size_completed: 0,
            receive_size_completed: 0,
        }
    }

    /// A transfer that reads `size` bytes into a fresh buffer.
    pub fn read(size: usize) -> Self {
        Self {
            direction: TransferDirection::In,
            buffer: alloc::vec![0; size],
            size,
            ..Self::write(Vec::new())
        }
    }

    /// Check that the transfer fits its buffer.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if `offset + size` overruns the buffer.
    pub fn validate(&self) -> Result<(), Error> {
        ensure!(
            self.offset
                .checked_add(self.size)
                .is_some_and(|end| end <= self.buffer.len()),
            InvalidParameterSnafu {
                reason: "transfer overruns its buffer"
            }
        );
        Ok(())
    }

    /// The part of the buffer the next `len` bytes of the transfer use, starting `done` bytes in.
    pub(crate) fn window(&mut self, done: usize, len: usize) -> &mut [u8] {
        let start = self.offset + done;
        &mut self.buffer[start..start + len]
    }
}

/// The kind of bus and its addressing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusKind {
    /// An I2C bus.
    I2c {
        /// Address of the device on the bus.
        slave_address: u16,
        /// `slave_address` is a 10-bit address.
        ten_bit: bool,
        /// The controller is the slave on this bus.
        slave_mode: bool,
    },
    /// An SPI bus.
    Spi {
        /// Chip select line of the device.
        chip_select: u32,
        /// Clock polarity and phase, 0 through 3.
        mode: u8,
        /// Bits per word.
        word_size: u8,
    },
}

/// Settings for talking to one device on a bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BusConfiguration {
    /// Bus clock in Hz.
    pub speed: u32,
    /// Bus type and addressing.
    pub kind: BusKind,
}

impl BusConfiguration {
    /// A 7-bit I2C device at standard speed.
    pub fn i2c(slave_address: u16) -> Self {
        Self {
            speed: 100_000,
            kind: BusKind::I2c {
                slave_address,
                ten_bit: false,
                slave_mode: false,
            },
        }
    }

    /// Check the configuration independent of any particular controller.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] for a zero speed or an address that does not fit its
    /// addressing mode.
    pub fn validate(&self) -> Result<(), Error> {
        ensure!(
            self.speed != 0,
            InvalidParameterSnafu {
                reason: "zero bus speed"
            }
        );
        if let BusKind::I2c {
            slave_address,
            ten_bit,
            ..
        } = self.kind
        {
            let limit = if ten_bit { 0x3FF } else { 0x7F };
            ensure!(
                slave_address <= limit,
                InvalidParameterSnafu {
                    reason: "slave address out of range"
                }
            );
        }
        Ok(())
    }
}

/// A transfer the backend refused to start, handed back to the caller.
#[derive(Debug)]
pub struct Rejected {
    /// Why it was refused.
    pub error: Error,
    /// The untouched transfer.
    pub transfer: Box<SpbTransfer>,
}

/// A transfer the backend is done with.
#[derive(Debug)]
pub struct FinishedTransfer {
    /// The transfer, with its completion counters.
    pub transfer: Box<SpbTransfer>,
    /// How it ended.
    pub result: Result<(), Error>,
}

/// Operations a bus controller backend provides.
#[cfg_attr(test, mockall::automock)]
pub trait SpbFunctions {
    /// Apply a bus configuration.
    ///
    /// # Errors
    /// [`Error::InvalidParameter`] for a bus type the controller does not drive,
    /// [`Error::NotSupported`] for modes it cannot do.
    fn configure_bus(&self, configuration: &BusConfiguration) -> Result<(), Error>;

    /// Start a transfer. The backend owns it until it comes back from
    /// [`Self::interrupt_service_worker`].
    ///
    /// # Errors
    /// The transfer is returned untouched if one is already in flight or it is malformed.
    fn submit_transfer(&self, transfer: Box<SpbTransfer>) -> Result<(), Rejected>;

    /// Fast interrupt service routine. Must not block.
    fn interrupt_service(&self) -> InterruptStatus;

    /// Deferred interrupt work. Returns the transfer in flight once it has finished.
    fn interrupt_service_worker(&self) -> Option<FinishedTransfer>;

    /// Mask interrupts and disable the controller if no transfer is in flight.
    fn quiesce(&self);
}

/// Notification that a transfer set has finished.
#[cfg_attr(test, mockall::automock)]
pub trait TransferCompletion {
    /// Every transfer of the set comes back in order, including any that never ran because an
    /// earlier one failed.
    fn transfer_set_complete(&self, transfers: Vec<SpbTransfer>, result: Result<(), Error>);
}

/// A sequence of transfers executed back to back between one start and one stop.
pub struct TransferSet {
    /// The transfers in bus order.
    pub transfers: Vec<SpbTransfer>,
    /// Who to tell when the set is done.
    pub completion: Arc<dyn TransferCompletion + Send + Sync>,
}

struct ActiveSet {
    remaining: VecDeque<SpbTransfer>,
    done: Vec<SpbTransfer>,
    completion: Arc<dyn TransferCompletion + Send + Sync>,
}

#[derive(Default)]
struct State {
    active: Option<ActiveSet>,
    queue: VecDeque<TransferSet>,
}

impl State {
    fn activate_next(&mut self) -> Option<Box<SpbTransfer>> {
        let set = self.queue.pop_front()?;
        let mut remaining: VecDeque<_> = set.transfers.into();
        let first = remaining.pop_front()?;
        self.active = Some(ActiveSet {
            remaining,
            done: Vec::new(),
            completion: set.completion,
        });
        Some(Box::new(first))
    }
}

/// A bus controller: one backend plus the queue of sets waiting for it.
pub struct SpbController {
    backend: Box<dyn SpbFunctions + Send + Sync>,
    state: Mutex<State>,
}

impl SpbController {
    /// Wrap a backend.
    pub fn new(backend: Box<dyn SpbFunctions + Send + Sync>) -> Self {
        Self {
            backend,
            state: Mutex::new(State::default()),
        }
    }

    /// Validate and apply a bus configuration.
    ///
    /// # Errors
    /// Returns the validation or backend error.
    pub fn configure_bus(&self, configuration: &BusConfiguration) -> Result<(), Error> {
        configuration.validate()?;
        self.backend.configure_bus(configuration)
    }

    /// Queue a transfer set. If the bus is idle the first transfer starts before this returns.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] for an empty set or a transfer that overruns its
    /// buffer. Failures of the transfers themselves are reported to the set's completion.
    pub fn submit(&self, mut set: TransferSet) -> Result<(), Error> {
        ensure!(
            !set.transfers.is_empty(),
            InvalidParameterSnafu {
                reason: "empty transfer set"
            }
        );
        for transfer in &mut set.transfers {
            transfer.validate()?;
            transfer.flags = SpbTransferFlags::empty();
        }
        if let Some(first) = set.transfers.first_mut() {
            first.flags.insert(SpbTransferFlags::FIRST);
        }
        if let Some(last) = set.transfers.last_mut() {
            last.flags.insert(SpbTransferFlags::LAST);
        }

        let start = {
            let mut state = self.state.lock();
            state.queue.push_back(set);
            if state.active.is_none() {
                state.activate_next()
            } else {
                None
            }
        };
        self.start(start);
        Ok(())
    }

    /// Whether any set is in flight or queued.
    pub fn is_busy(&self) -> bool {
        let state = self.state.lock();
        state.active.is_some() || !state.queue.is_empty()
    }

    /// Record a finished transfer and pick the one to run next.
    ///
    /// The set's completion is called here, with no lock held, when this was its last transfer
    /// or the transfer failed.
    pub fn transfer_completion(
        &self,
        transfer: Box<SpbTransfer>,
        result: Result<(), Error>,
    ) -> Option<Box<SpbTransfer>> {
        let (finished, next) = {
            let mut state = self.state.lock();
            let Some(active) = state.active.as_mut() else {
                warn!("SPB: completion with no transfer set active");
                return None;
            };
            active.done.push(*transfer);
            if result.is_ok() {
                if let Some(next) = active.remaining.pop_front() {
                    return Some(Box::new(next));
                }
            }
            let finished = state.active.take();
            (finished, state.activate_next())
        };

        if let Some(ActiveSet {
            remaining,
            mut done,
            completion,
        }) = finished
        {
            if let Err(e) = &result {
                debug!("SPB: transfer set failed: {e}");
            }
            done.extend(remaining);
            completion.transfer_set_complete(done, result);
        }
        next
    }

    /// Hand `next` to the backend, completing any it rejects. Returns whether a transfer is now
    /// running.
    fn start(&self, mut next: Option<Box<SpbTransfer>>) -> bool {
        while let Some(transfer) = next.take() {
            match self.backend.submit_transfer(transfer) {
                Ok(()) => return true,
                Err(Rejected { error, transfer }) => {
                    warn!("SPB: transfer rejected: {error}");
                    next = self.transfer_completion(transfer, Err(error));
                }
            }
        }
        false
    }

    /// Fast interrupt service routine for the bus interrupt.
    pub fn interrupt_service(&self) -> InterruptStatus {
        self.backend.interrupt_service()
    }

    /// Deferred interrupt work for the bus interrupt.
    pub fn interrupt_service_worker(&self) -> InterruptStatus {
        if let Some(FinishedTransfer { transfer, result }) = self.backend.interrupt_service_worker()
        {
            trace!(
                "SPB: transfer finished tx {} rx {}",
                transfer.transmit_size_completed,
                transfer.receive_size_completed
            );
            let next = self.transfer_completion(transfer, result);
            if !self.start(next) {
                self.backend.quiesce();
            }
        }
        InterruptStatus::Claimed
    }

    /// The interrupt connection for this controller's bus interrupt.
    pub fn connection(self: &Arc<Self>) -> Connection {
        let service = self.clone();
        let worker = self.clone();
        Connection {
            service: Some(Arc::new(move || service.interrupt_service())),
            worker: Some(Arc::new(move || worker.interrupt_service_worker())),
        }
    }
}
