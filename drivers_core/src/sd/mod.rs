//! SD/MMC controller library.
//!
//! [`SdController`] brings a card up from power-on, moves blocks with either polled I/O or
//! ADMA2/SDMA, and recovers from command and data errors. Every hardware interaction goes through
//! the [`SdFunctions`] table. A host that follows the SD host controller standard supplies its
//! register window in [`SdParameters::standard_registers`] and gets [`standard::StandardHost`]
//! for every function it does not override. Hosts that are not standard must provide at least
//! [`SdFunctionSet::REQUIRED`].
//!
//! Timeouts are measured against the [`TimeSource`] recent counter. In critical mode, used when
//! the clock interrupt is not running, they poll the hardware counter instead.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use arc_swap::ArcSwapOption;
use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, trace, warn};
use snafu::{ensure, Snafu};
use spin::Mutex;

use crate::{
    interrupt::{Connection, InterruptStatus},
    registers::RegisterAccess,
    time::{ticks_for_milliseconds, TimeSource},
};

pub mod adma2;
pub mod standard;

use adma2::{DescriptorTable, DmaFragment};
use standard::{InterruptBits, StandardHost};

/// Attempts made by [`SdController::perform_io_with_retries`] beyond the first.
pub const SD_MAX_IO_RETRIES: u32 = 5;

/// The only block size used for data transfers.
pub const SD_BLOCK_SIZE: u32 = 512;

/// Largest block count the block count register holds.
pub const SD_MAX_BLOCK_COUNT: u32 = 0xFFFF;

const MAX_CMD23_BLOCKS: u32 = 0xFFFF;

const CONTROLLER_TIMEOUT_MS: u64 = 1000;
const STATUS_TIMEOUT_MS: u64 = 5000;
const CMD1_TIMEOUT_MS: u64 = 1000;
const CARD_DELAY_US: u32 = 1000;
const POST_RESET_DELAY_US: u32 = 2000;
const FREQUENCY_SETTLE_US: u32 = 10_000;

const INTERFACE_CONDITION_RETRIES: u32 = 3;
const OPERATING_CONDITION_RETRIES: u32 = 1000;
const SET_BLOCK_LENGTH_RETRIES: u32 = 3;
const SCR_RETRIES: u32 = 3;
const SWITCH_RETRIES: u32 = 4;

const COMMAND8_ARGUMENT: u32 = 0x1AA;

const CLOCK_400KHZ: u32 = 400_000;
const CLOCK_25MHZ: u32 = 25_000_000;
const CLOCK_26MHZ: u32 = 26_000_000;
const CLOCK_50MHZ: u32 = 50_000_000;
const CLOCK_52MHZ: u32 = 52_000_000;

/// Command indices. Application commands follow [`command::APPLICATION_SPECIFIC`].
#[allow(unused, missing_docs)]
pub mod command {
    pub const RESET: u8 = 0;
    pub const SEND_MMC_OPERATING_CONDITION: u8 = 1;
    pub const ALL_SEND_CARD_IDENTIFICATION: u8 = 2;
    pub const SET_RELATIVE_ADDRESS: u8 = 3;
    pub const SWITCH: u8 = 6;
    pub const SET_BUS_WIDTH: u8 = 6;
    pub const SELECT_CARD: u8 = 7;
    pub const SEND_INTERFACE_CONDITION: u8 = 8;
    pub const MMC_SEND_EXTENDED_CARD_SPECIFIC_DATA: u8 = 8;
    pub const SEND_CARD_SPECIFIC_DATA: u8 = 9;
    pub const SEND_CARD_IDENTIFICATION: u8 = 10;
    pub const VOLTAGE_SWITCH: u8 = 11;
    pub const STOP_TRANSMISSION: u8 = 12;
    pub const SEND_STATUS: u8 = 13;
    pub const SET_BLOCK_LENGTH: u8 = 16;
    pub const READ_SINGLE_BLOCK: u8 = 17;
    pub const READ_MULTIPLE_BLOCKS: u8 = 18;
    pub const SET_BLOCK_COUNT: u8 = 23;
    pub const WRITE_SINGLE_BLOCK: u8 = 24;
    pub const WRITE_MULTIPLE_BLOCKS: u8 = 25;
    pub const SEND_SD_OPERATING_CONDITION: u8 = 41;
    pub const SEND_SD_CONFIGURATION_REGISTER: u8 = 51;
    pub const APPLICATION_SPECIFIC: u8 = 55;
    pub const SPI_READ_OPERATING_CONDITION: u8 = 58;
    pub const SPI_CRC_ON_OFF: u8 = 59;
}

#[allow(unused, missing_docs)]
mod ocr {
    pub const BUSY: u32 = 0x8000_0000;
    pub const HIGH_CAPACITY: u32 = 0x4000_0000;
    pub const ACCESS_MODE: u32 = 0x6000_0000;
    pub const SWITCH_1V8_REQUEST: u32 = 1 << 24;
    pub const VOLTAGE_MASK: u32 = 0x007F_FF80;
}

#[allow(unused, missing_docs)]
mod card_status {
    pub const READY_FOR_DATA: u32 = 1 << 8;
    pub const STATE_MASK: u32 = 0xF << 9;
    pub const STATE_TRANSFER: u32 = 4 << 9;
    pub const STATE_PROGRAM: u32 = 7 << 9;
    pub const ERROR_MASK: u32 = !0x0206_BF7F;
}

#[allow(unused, missing_docs)]
mod configuration_register {
    pub const VERSION_SHIFT: u32 = 24;
    pub const VERSION_MASK: u32 = 0xF;
    pub const VERSION3: u32 = 1 << 15;
    pub const BUS_WIDTH_4: u32 = 0x0004_0000;
    pub const CMD23: u32 = 0x2;
}

#[allow(unused, missing_docs)]
mod switch_status {
    pub const SIZE: usize = 64;
    pub const HIGH_SPEED_SUPPORTED: u32 = 0x0002_0000;
    pub const GROUP0_RESULT_MASK: u32 = 0x0F00_0000;
    pub const GROUP0_RESULT_HIGH_SPEED: u32 = 0x0100_0000;
    pub const GROUP0_BUSY: u32 = 0x0002_0000;
}

#[allow(unused, missing_docs)]
mod extended_csd {
    pub const SIZE: usize = 512;
    pub const BUS_WIDTH: u8 = 183;
    pub const HS_TIMING: u8 = 185;
    pub const CARD_TYPE: usize = 196;
    pub const CARD_TYPE_MASK: u8 = 0xF;
    pub const CARD_TYPE_26MHZ: u8 = 1 << 0;
    pub const CARD_TYPE_52MHZ: u8 = 1 << 1;
    pub const WIDTH_1: u8 = 0;
    pub const WIDTH_4: u8 = 1;
    pub const WIDTH_8: u8 = 2;
    pub const ACCESS_WRITE_BYTE: u32 = 3;
}

bitflags! {
    /// Bus modes a host or a card supports.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct SdMode: u32 {
        /// 50MHz SD high speed, or 26MHz MMC high speed.
        const HIGH_SPEED = 0x0001;
        /// 52MHz MMC high speed.
        const HIGH_SPEED_52MHZ = 0x0002;
        /// Four data lines.
        const FOUR_BIT = 0x0004;
        /// Eight data lines.
        const EIGHT_BIT = 0x0008;
        /// The card is attached over SPI.
        const SPI = 0x0010;
        /// Block addressing instead of byte addressing.
        const HIGH_CAPACITY = 0x0020;
        /// The host stops multiple block transfers by itself.
        const AUTO_CMD12 = 0x0040;
        /// ADMA2 descriptor DMA.
        const ADMA2 = 0x0080;
        /// The host strips the CRC from 136-bit responses, leaving them shifted by a byte.
        const RESPONSE136_SHIFTED = 0x0100;
        /// Single address DMA.
        const SDMA = 0x0200;
        /// DMA performed by a system DMA engine outside the host.
        const SYSTEM_DMA = 0x0400;
        /// The card supports SET_BLOCK_COUNT.
        const CMD23 = 0x0800;
    }

    /// Parts of the host controller to reset.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct ResetFlags: u32 {
        /// The whole controller.
        const ALL = 1 << 0;
        /// The command line state machine.
        const COMMAND_LINE = 1 << 1;
        /// The data line state machine.
        const DATA_LINE = 1 << 2;
    }

    /// Controller state shared between the library and the host functions.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct ControllerFlags: u32 {
        /// The card uses block addressing.
        const HIGH_CAPACITY = 1 << 0;
        /// A card is initialized and ready for I/O.
        const MEDIA_PRESENT = 1 << 1;
        /// DMA has been initialized.
        const DMA_ENABLED = 1 << 2;
        /// The host is signalling DMA completion interrupts.
        const DMA_INTERRUPTS_ENABLED = 1 << 3;
        /// Timeouts poll the hardware counter.
        const CRITICAL_MODE = 1 << 4;
        /// Data commands use DMA.
        const DMA_COMMAND_ENABLED = 1 << 5;
        /// The card was swapped. I/O fails until the card is initialized again.
        const MEDIA_CHANGED = 1 << 6;
        /// A card arrived and nobody has been told yet.
        const INSERTION_PENDING = 1 << 7;
        /// A card left and nobody has been told yet.
        const REMOVAL_PENDING = 1 << 8;
    }

    /// Supply voltage windows, in the operating condition register layout.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct Voltages: u32 {
        /// 1.65V to 1.95V.
        const V165_195 = 0x0000_0080;
        /// 2.9V to 3.0V.
        const V29_30 = 0x0002_0000;
        /// 3.0V to 3.1V.
        const V30_31 = 0x0004_0000;
        /// 3.2V to 3.3V.
        const V32_33 = 0x0010_0000;
        /// 3.3V to 3.4V.
        const V33_34 = 0x0020_0000;
        /// The host can switch signalling to 1.8V.
        const SWITCH_1V8 = 1 << 24;
        const _ = !0;
    }

    /// How a command's response is formatted and checked.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct ResponseType: u32 {
        /// The card responds.
        const PRESENT = 1 << 0;
        /// The response is 136 bits long.
        const LONG = 1 << 1;
        /// The response carries a CRC.
        const CRC = 1 << 2;
        /// The card signals busy on the data line after responding.
        const BUSY = 1 << 3;
        /// The response echoes the command index.
        const OPCODE = 1 << 4;
    }

    /// The functions an [`SdFunctions`] implementation provides.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct SdFunctionSet: u32 {
        /// [`SdFunctions::initialize_controller`].
        const INITIALIZE = 1 << 0;
        /// [`SdFunctions::reset_controller`].
        const RESET = 1 << 1;
        /// [`SdFunctions::send_command`].
        const SEND_COMMAND = 1 << 2;
        /// Bus width get and set.
        const BUS_WIDTH = 1 << 3;
        /// Clock speed get and set.
        const CLOCK_SPEED = 1 << 4;
        /// Voltage get and set.
        const VOLTAGE = 1 << 5;
        /// [`SdFunctions::stop_data_transfer`].
        const STOP_DATA_TRANSFER = 1 << 6;
        /// [`SdFunctions::card_detect`].
        const CARD_DETECT = 1 << 7;
        /// [`SdFunctions::write_protect`].
        const WRITE_PROTECT = 1 << 8;
        /// What a host without standard registers must provide.
        const REQUIRED = Self::RESET.bits()
            | Self::SEND_COMMAND.bits()
            | Self::BUS_WIDTH.bits()
            | Self::CLOCK_SPEED.bits();
    }
}

#[allow(missing_docs)]
impl ResponseType {
    pub const NONE: Self = Self::empty();
    pub const R1: Self =
        Self::from_bits_retain(Self::PRESENT.bits() | Self::CRC.bits() | Self::OPCODE.bits());
    pub const R1B: Self = Self::from_bits_retain(Self::R1.bits() | Self::BUSY.bits());
    pub const R2: Self =
        Self::from_bits_retain(Self::PRESENT.bits() | Self::CRC.bits() | Self::LONG.bits());
    pub const R3: Self = Self::PRESENT;
    pub const R6: Self = Self::R1;
    pub const R7: Self = Self::R1;
}

/// Signalling voltage.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum SdVoltage {
    /// Bus power off.
    Off,
    /// 1.8V signalling.
    V1_8,
    /// 3.0V.
    V3_0,
    /// 3.3V.
    #[default]
    V3_3,
}

/// Card generation, as far as initialization could tell.
#[allow(missing_docs)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum CardVersion {
    #[default]
    Unknown,
    Sd1p0,
    Sd1p10,
    Sd2,
    Sd3,
    Mmc1p2,
    Mmc1p4,
    Mmc2p2,
    Mmc3,
    Mmc4,
}

impl CardVersion {
    /// Whether this is an SD card, as opposed to MMC.
    #[must_use]
    pub fn is_sd(self) -> bool {
        matches!(self, Self::Sd1p0 | Self::Sd1p10 | Self::Sd2 | Self::Sd3)
    }

    fn from_mmc_csd(csd: &[u32; 4]) -> Self {
        match (csd[0] >> 26) & 0xF {
            1 => Self::Mmc1p4,
            2 => Self::Mmc2p2,
            3 => Self::Mmc3,
            4 => Self::Mmc4,
            _ => Self::Mmc1p2,
        }
    }
}

/// Which half of controller bring-up [`SdFunctions::initialize_controller`] should do.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitializePhase {
    /// Read capabilities: supported voltages, base clock and modes.
    Capabilities,
    /// Power the bus and enable interrupts, after the initial bus parameters are set.
    PowerOn,
}

/// Errors from SD operations.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A parameter was rejected.
    #[snafu(display("invalid parameter: {reason}"))]
    InvalidParameter {
        /// What was wrong.
        reason: &'static str,
    },
    /// Neither the host nor the card can do this.
    NotSupported,
    /// A descriptor table or buffer was missing.
    InsufficientResources,
    /// The command or data transfer failed.
    #[snafu(display("device I/O error, status {status:#x}"))]
    DeviceIoError {
        /// Raw status that reported the error.
        status: u32,
    },
    /// The controller or card did not respond in time.
    Timeout,
    /// No card is present.
    NoMedia,
    /// The card was replaced since it was initialized.
    MediaChanged,
    /// The controller reports a configuration it cannot run in.
    InvalidConfiguration,
    /// The card is not in a state to accept the command.
    NotReady,
    /// The host and card share no usable voltage.
    DeviceNotConnected,
}

/// One command, with its response and any data phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdCommand {
    /// Command index.
    pub index: u8,
    /// Response format.
    pub response_type: ResponseType,
    /// Command argument.
    pub argument: u32,
    /// The response. 136-bit responses are most significant word first.
    pub response: [u32; 4],
    /// Data to write, or space for data read when the command does not use DMA.
    pub buffer: Vec<u8>,
    /// Data phase length in bytes. Zero for commands without data.
    pub buffer_size: u32,
    /// The data phase moves from host to card.
    pub write: bool,
    /// The data phase uses DMA and completes through the interrupt path.
    pub dma: bool,
}

impl SdCommand {
    /// A command without a data phase.
    #[must_use]
    pub fn new(index: u8, response_type: ResponseType, argument: u32) -> Self {
        Self {
            index,
            response_type,
            argument,
            response: [0; 4],
            buffer: Vec::new(),
            buffer_size: 0,
            write: false,
            dma: false,
        }
    }

    /// Read `size` bytes into a fresh buffer.
    #[must_use]
    pub fn with_read(mut self, size: usize) -> Self {
        self.buffer = alloc::vec![0; size];
        self.buffer_size = size as u32;
        self.write = false;
        self
    }

    /// Write all of `data`.
    #[must_use]
    pub fn with_write(mut self, data: Vec<u8>) -> Self {
        self.buffer_size = data.len() as u32;
        self.buffer = data;
        self.write = true;
        self
    }

    /// Move `size` bytes through a previously prepared DMA transfer.
    #[must_use]
    pub fn with_dma(mut self, size: u32, write: bool) -> Self {
        self.buffer_size = size;
        self.write = write;
        self.dma = true;
        self
    }
}

const FREQUENCY_MULTIPLIERS: [u32; 16] = [0, 10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80];

/// Card parameters decoded from the card specific data register.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CardGeometry {
    /// Maximum transfer rate in Hz.
    pub clock_speed: u32,
    /// Read block length, clamped to [`SD_BLOCK_SIZE`].
    pub read_block_length: u32,
    /// Write block length, clamped to [`SD_BLOCK_SIZE`].
    pub write_block_length: u32,
    /// User area size in bytes.
    pub capacity: u64,
}

impl CardGeometry {
    /// Decode a card specific data register.
    #[must_use]
    pub fn decode(csd: &[u32; 4], high_capacity: bool, sd: bool) -> Self {
        let frequency = 10_000u32.saturating_mul(10u32.pow(csd[0] & 0x7));
        let clock_speed =
            frequency.saturating_mul(FREQUENCY_MULTIPLIERS[((csd[0] >> 3) & 0xF) as usize]);
        let read_block_length = 1u32 << ((csd[1] >> 16) & 0xF);
        let write_block_length = if sd {
            read_block_length
        } else {
            1u32 << ((csd[1] >> 22) & 0xF)
        };
        let (base, shift) = if high_capacity {
            (
                u64::from(((csd[1] & 0x3F) << 16) | ((csd[2] & 0xFFFF_0000) >> 16)),
                8,
            )
        } else {
            (
                u64::from(((csd[1] & 0x3FF) << 2) | ((csd[2] & 0xC000_0000) >> 30)),
                (csd[2] & 0x0003_8000) >> 15,
            )
        };
        Self {
            clock_speed,
            read_block_length: read_block_length.min(SD_BLOCK_SIZE),
            write_block_length: write_block_length.min(SD_BLOCK_SIZE),
            capacity: ((base + 1) << (shift + 2)) * u64::from(read_block_length),
        }
    }
}

/// State shared with the host functions: flags, capabilities, and the time source for timeouts.
pub struct SdHost {
    time: Arc<dyn TimeSource + Send + Sync>,
    flags: AtomicU32,
    host_capabilities: AtomicU32,
    card_capabilities: AtomicU32,
    voltages: AtomicU32,
    fundamental_clock: AtomicU32,
}

impl SdHost {
    pub(crate) fn new(
        time: Arc<dyn TimeSource + Send + Sync>,
        host_capabilities: SdMode,
        voltages: Voltages,
        fundamental_clock: u32,
    ) -> Self {
        Self {
            time,
            flags: AtomicU32::new(ControllerFlags::INSERTION_PENDING.bits()),
            host_capabilities: AtomicU32::new(host_capabilities.bits()),
            card_capabilities: AtomicU32::new(0),
            voltages: AtomicU32::new(voltages.bits()),
            fundamental_clock: AtomicU32::new(fundamental_clock),
        }
    }

    /// Current controller flags.
    pub fn flags(&self) -> ControllerFlags {
        ControllerFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Set `flags`.
    pub fn insert_flags(&self, flags: ControllerFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear `flags`.
    pub fn remove_flags(&self, flags: ControllerFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    fn retain_flags(&self, flags: ControllerFlags) -> ControllerFlags {
        ControllerFlags::from_bits_retain(self.flags.fetch_and(flags.bits(), Ordering::AcqRel))
    }

    /// Modes the host supports.
    pub fn host_capabilities(&self) -> SdMode {
        SdMode::from_bits_retain(self.host_capabilities.load(Ordering::Acquire))
    }

    /// Record more host modes, usually read from a capabilities register.
    pub fn add_host_capabilities(&self, modes: SdMode) {
        self.host_capabilities
            .fetch_or(modes.bits(), Ordering::AcqRel);
    }

    /// Modes the card supports, limited to those the host supports once initialization is done.
    pub fn card_capabilities(&self) -> SdMode {
        SdMode::from_bits_retain(self.card_capabilities.load(Ordering::Acquire))
    }

    fn set_card_capabilities(&self, modes: SdMode) {
        self.card_capabilities.store(modes.bits(), Ordering::Release);
    }

    /// Voltages the host can supply.
    pub fn voltages(&self) -> Voltages {
        Voltages::from_bits_retain(self.voltages.load(Ordering::Acquire))
    }

    /// Record more supported voltages.
    pub fn add_voltages(&self, voltages: Voltages) {
        self.voltages.fetch_or(voltages.bits(), Ordering::AcqRel);
    }

    /// Base clock the host divides down to the bus clock, in Hz. Zero if not known yet.
    pub fn fundamental_clock(&self) -> u32 {
        self.fundamental_clock.load(Ordering::Acquire)
    }

    /// Record the base clock.
    pub fn set_fundamental_clock(&self, hz: u32) {
        self.fundamental_clock.store(hz, Ordering::Release);
    }

    /// The time counter used for timeouts.
    pub fn query_time_counter(&self) -> u64 {
        if self.flags().contains(ControllerFlags::CRITICAL_MODE) {
            self.time.query_counter()
        } else {
            self.time.recent_counter()
        }
    }

    /// Busy-wait for `microseconds`.
    pub fn stall(&self, microseconds: u32) {
        self.time.stall(microseconds);
    }

    /// Poll `done` until it returns true or the controller timeout passes.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] if `done` never returned true.
    pub fn wait_for(&self, done: impl FnMut() -> bool) -> Result<(), Error> {
        self.wait_for_milliseconds(CONTROLLER_TIMEOUT_MS, done)
    }

    fn wait_for_milliseconds(
        &self,
        milliseconds: u64,
        mut done: impl FnMut() -> bool,
    ) -> Result<(), Error> {
        let deadline = self
            .query_time_counter()
            .saturating_add(ticks_for_milliseconds(self.time.frequency(), milliseconds));
        loop {
            if done() {
                return Ok(());
            }
            if self.query_time_counter() > deadline {
                return TimeoutSnafu.fail();
            }
        }
    }
}

/// The per-host function table.
///
/// Every function has a default that reports [`Error::NotSupported`]; implementations list the
/// ones they override in [`SdFunctions::provides`].
#[cfg_attr(test, mockall::automock)]
pub trait SdFunctions {
    /// The functions this implementation overrides.
    fn provides(&self) -> SdFunctionSet;

    /// Run one phase of controller bring-up.
    ///
    /// # Errors
    /// Returns an error if the controller could not be brought up.
    fn initialize_controller(&self, host: &SdHost, phase: InitializePhase) -> Result<(), Error> {
        let _ = (host, phase);
        NotSupportedSnafu.fail()
    }

    /// Reset the parts of the controller named in `flags`.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] if the reset never completed.
    fn reset_controller(&self, host: &SdHost, flags: ResetFlags) -> Result<(), Error> {
        let _ = (host, flags);
        NotSupportedSnafu.fail()
    }

    /// Send a command and wait for its response and any polled data phase.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] or [`Error::DeviceIoError`] if the command failed.
    fn send_command(&self, host: &SdHost, command: &mut SdCommand) -> Result<(), Error> {
        let _ = (host, command);
        NotSupportedSnafu.fail()
    }

    /// The bus width in use, in data lines.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if not implemented.
    fn bus_width(&self, host: &SdHost) -> Result<u8, Error> {
        let _ = host;
        NotSupportedSnafu.fail()
    }

    /// Set the bus width, in data lines.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] for a width the host lacks.
    fn set_bus_width(&self, host: &SdHost, width: u8) -> Result<(), Error> {
        let _ = (host, width);
        NotSupportedSnafu.fail()
    }

    /// The bus clock in Hz.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if not implemented.
    fn clock_speed(&self, host: &SdHost) -> Result<u32, Error> {
        let _ = host;
        NotSupportedSnafu.fail()
    }

    /// Set the bus clock, rounding down to what the host can generate.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] if the clock never stabilized.
    fn set_clock_speed(&self, host: &SdHost, hz: u32) -> Result<(), Error> {
        let _ = (host, hz);
        NotSupportedSnafu.fail()
    }

    /// The signalling voltage.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if not implemented.
    fn voltage(&self, host: &SdHost) -> Result<SdVoltage, Error> {
        let _ = host;
        NotSupportedSnafu.fail()
    }

    /// Switch the signalling voltage.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] for a voltage the host lacks.
    fn set_voltage(&self, host: &SdHost, voltage: SdVoltage) -> Result<(), Error> {
        let _ = (host, voltage);
        NotSupportedSnafu.fail()
    }

    /// Halt an in-flight data transfer at the next block gap.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] if the transfer did not stop.
    fn stop_data_transfer(&self, host: &SdHost) -> Result<(), Error> {
        let _ = host;
        NotSupportedSnafu.fail()
    }

    /// Whether a card is inserted.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if the host cannot tell.
    fn card_detect(&self, host: &SdHost) -> Result<bool, Error> {
        let _ = host;
        NotSupportedSnafu.fail()
    }

    /// Whether the card's write protect switch is set.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if the host cannot tell.
    fn write_protect(&self, host: &SdHost) -> Result<bool, Error> {
        let _ = host;
        NotSupportedSnafu.fail()
    }
}

/// Told when a card arrives or leaves.
#[cfg_attr(test, mockall::automock)]
pub trait MediaChangeHandler {
    /// A card was removed, inserted, or both (swapped).
    fn media_changed(&self, removed: bool, inserted: bool);
}

/// Told when a DMA transfer finishes.
#[cfg_attr(test, mockall::automock)]
pub trait IoCompletion {
    /// `bytes` were transferred before `result` ended the request.
    fn io_complete(&self, bytes: u32, result: Result<(), Error>);
}

/// Everything [`SdController::new`] needs.
pub struct SdParameters {
    /// Register window of a standard host, if the host is one.
    pub standard_registers: Option<Arc<dyn RegisterAccess + Send + Sync>>,
    /// Functions overriding or replacing the standard host.
    pub functions: Option<Box<dyn SdFunctions + Send + Sync>>,
    /// Time source for timeouts and delays.
    pub time: Arc<dyn TimeSource + Send + Sync>,
    /// Voltages known to be supported, added to what the host reports.
    pub voltages: Voltages,
    /// Base clock in Hz, or zero to read it from the host.
    pub fundamental_clock: u32,
    /// Modes known to be supported, added to what the host reports.
    pub host_capabilities: SdMode,
    /// Largest number of blocks per command, or zero for [`SD_MAX_BLOCK_COUNT`].
    pub max_blocks_per_transfer: u32,
    /// ADMA2 descriptor table, required for ADMA2.
    pub dma_table: Option<DescriptorTable>,
    /// Media change callback.
    pub media_change: Option<Box<dyn MediaChangeHandler + Send + Sync>>,
}

impl SdParameters {
    /// Parameters with nothing but a time source.
    pub fn new(time: Arc<dyn TimeSource + Send + Sync>) -> Self {
        Self {
            standard_registers: None,
            functions: None,
            time,
            voltages: Voltages::empty(),
            fundamental_clock: 0,
            host_capabilities: SdMode::empty(),
            max_blocks_per_transfer: 0,
            dma_table: None,
            media_change: None,
        }
    }
}

/// Size of an initialized card.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MediaParameters {
    /// Number of blocks.
    pub block_count: u64,
    /// Bytes per block.
    pub block_size: u32,
}

#[derive(Debug, Default)]
struct CardState {
    version: CardVersion,
    card_address: u16,
    bus_width: u8,
    clock_speed: u32,
    voltage: SdVoltage,
    read_block_length: u32,
    write_block_length: u32,
    user_capacity: u64,
    card_specific_data: [u32; 4],
    identification: [u32; 4],
    max_blocks_per_transfer: u32,
}

struct PendingIo {
    completion: Arc<dyn IoCompletion + Send + Sync>,
    size: u32,
}

/// One SD/MMC slot.
pub struct SdController {
    host: SdHost,
    standard: Option<StandardHost>,
    functions: Option<Box<dyn SdFunctions + Send + Sync>>,
    card: Mutex<CardState>,
    try_count: AtomicU32,
    media_change: ArcSwapOption<Box<dyn MediaChangeHandler + Send + Sync>>,
    pending_io: ArcSwapOption<PendingIo>,
}

impl SdController {
    /// Create a controller. No hardware is touched until [`Self::initialize`].
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if there are no standard registers and the supplied
    /// functions do not cover [`SdFunctionSet::REQUIRED`].
    pub fn new(parameters: SdParameters) -> Result<Self, Error> {
        let provided = parameters
            .functions
            .as_ref()
            .map_or(SdFunctionSet::empty(), |functions| functions.provides());
        ensure!(
            parameters.standard_registers.is_some() || provided.contains(SdFunctionSet::REQUIRED),
            InvalidParameterSnafu {
                reason: "non-standard host is missing required functions"
            }
        );
        let max_blocks = match parameters.max_blocks_per_transfer {
            0 => SD_MAX_BLOCK_COUNT,
            count => count.min(SD_MAX_BLOCK_COUNT),
        };
        Ok(Self {
            host: SdHost::new(
                parameters.time,
                parameters.host_capabilities,
                parameters.voltages,
                parameters.fundamental_clock,
            ),
            standard: parameters
                .standard_registers
                .map(|registers| StandardHost::new(registers, parameters.dma_table)),
            functions: parameters.functions,
            card: Mutex::new(CardState {
                max_blocks_per_transfer: max_blocks,
                ..CardState::default()
            }),
            try_count: AtomicU32::new(0),
            media_change: ArcSwapOption::new(parameters.media_change.map(Arc::new)),
            pending_io: ArcSwapOption::empty(),
        })
    }

    /// Shared state, for host functions and diagnostics.
    pub fn host(&self) -> &SdHost {
        &self.host
    }

    fn functions(&self, needed: SdFunctionSet) -> Result<&(dyn SdFunctions + Send + Sync), Error> {
        if let Some(functions) = &self.functions {
            if functions.provides().contains(needed) {
                return Ok(functions.as_ref());
            }
        }
        match &self.standard {
            Some(standard) => Ok(standard as &(dyn SdFunctions + Send + Sync)),
            None => NotSupportedSnafu.fail(),
        }
    }

    fn send(&self, command: &mut SdCommand) -> Result<(), Error> {
        self.functions(SdFunctionSet::SEND_COMMAND)?
            .send_command(&self.host, command)
    }

    fn send_application(&self, card_address: u16, command: &mut SdCommand) -> Result<(), Error> {
        let mut prefix = SdCommand::new(
            command::APPLICATION_SPECIFIC,
            ResponseType::R1,
            u32::from(card_address) << 16,
        );
        self.send(&mut prefix)?;
        self.send(command)
    }

    fn reset(&self, flags: ResetFlags) -> Result<(), Error> {
        self.functions(SdFunctionSet::RESET)?
            .reset_controller(&self.host, flags)
    }

    /// Install or replace the media change callback.
    pub fn set_media_change_handler(&self, handler: Box<dyn MediaChangeHandler + Send + Sync>) {
        self.media_change.store(Some(Arc::new(handler)));
    }

    /// Switch timeouts to polling the hardware counter, for contexts where the clock interrupt is
    /// not running.
    pub fn set_critical_mode(&self, enable: bool) {
        if enable {
            self.host.insert_flags(ControllerFlags::CRITICAL_MODE);
        } else {
            self.host.remove_flags(ControllerFlags::CRITICAL_MODE);
        }
    }

    /// Reset the controller if asked, then bring the card up to transfer state at the fastest
    /// bus mode both sides support.
    ///
    /// # Errors
    /// Returns [`Error::NoMedia`] if no card is inserted, [`Error::DeviceNotConnected`] if the
    /// host has no usable voltage, or the error of the first failing command.
    pub fn initialize(&self, reset: bool) -> Result<(), Error> {
        let mut card = self.card.lock();
        self.initialize_card(&mut card, reset)
    }

    fn initialize_card(&self, card: &mut CardState, reset: bool) -> Result<(), Error> {
        let previous = self.host.retain_flags(
            ControllerFlags::CRITICAL_MODE
                | ControllerFlags::INSERTION_PENDING
                | ControllerFlags::REMOVAL_PENDING,
        );
        self.host.set_card_capabilities(SdMode::empty());
        let max_blocks = card.max_blocks_per_transfer;
        *card = CardState {
            max_blocks_per_transfer: max_blocks,
            ..CardState::default()
        };

        ensure!(self.card_detected()?, NoMediaSnafu);
        if reset {
            self.reset(ResetFlags::ALL)?;
            self.host.stall(POST_RESET_DELAY_US);
        }
        if let Ok(functions) = self.functions(SdFunctionSet::INITIALIZE) {
            match functions.initialize_controller(&self.host, InitializePhase::Capabilities) {
                Ok(()) | Err(Error::NotSupported) => {}
                Err(error) => return Err(error),
            }
        }
        ensure!(
            self.host.voltages().intersects(Voltages::from_bits_retain(ocr::VOLTAGE_MASK)),
            DeviceNotConnectedSnafu
        );

        card.bus_width = 1;
        card.clock_speed = CLOCK_400KHZ;
        card.voltage = SdVoltage::V3_3;
        self.set_bus_parameters(card)?;
        if let Ok(functions) = self.functions(SdFunctionSet::INITIALIZE) {
            match functions.initialize_controller(&self.host, InitializePhase::PowerOn) {
                Ok(()) | Err(Error::NotSupported) => {}
                Err(error) => return Err(error),
            }
        }

        let operating_condition = self.wait_for_card_to_initialize(card)?;
        if operating_condition & ocr::HIGH_CAPACITY != 0 {
            self.host.insert_flags(ControllerFlags::HIGH_CAPACITY);
        }
        if card.version.is_sd()
            && operating_condition & ocr::SWITCH_1V8_REQUEST != 0
            && self.host.voltages().contains(Voltages::SWITCH_1V8)
        {
            self.switch_to_1v8(card)?;
        }

        self.read_identification(card)?;
        self.set_card_address(card)?;
        self.read_card_specific_data(card)?;
        self.select_card(card)?;

        let mut card_modes = if card.version.is_sd() {
            self.read_sd_capabilities(card)?
        } else {
            self.read_mmc_capabilities(card)?
        };
        self.host.stall(FREQUENCY_SETTLE_US);
        card_modes &= self.host.host_capabilities();
        self.host.set_card_capabilities(card_modes);

        if card.version.is_sd() {
            self.apply_sd_bus_mode(card, card_modes)?;
        } else {
            self.apply_mmc_bus_mode(card, card_modes)?;
        }
        self.set_block_length()?;

        self.host.insert_flags(ControllerFlags::MEDIA_PRESENT);
        if previous.contains(ControllerFlags::DMA_ENABLED) {
            self.initialize_dma()?;
        }
        info!(
            "SD: {:?} card, {} blocks, {} data lines at {}Hz",
            card.version,
            card.user_capacity / u64::from(SD_BLOCK_SIZE),
            card.bus_width,
            card.clock_speed
        );
        Ok(())
    }

    /// Hosts that cannot detect cards report one as present.
    fn card_detected(&self) -> Result<bool, Error> {
        let Ok(functions) = self.functions(SdFunctionSet::CARD_DETECT) else {
            return Ok(true);
        };
        match functions.card_detect(&self.host) {
            Err(Error::NotSupported) => Ok(true),
            other => other,
        }
    }

    fn set_bus_parameters(&self, card: &CardState) -> Result<(), Error> {
        self.functions(SdFunctionSet::BUS_WIDTH)?
            .set_bus_width(&self.host, card.bus_width)?;
        self.functions(SdFunctionSet::CLOCK_SPEED)?
            .set_clock_speed(&self.host, card.clock_speed)?;
        if let Ok(functions) = self.functions(SdFunctionSet::VOLTAGE) {
            match functions.set_voltage(&self.host, card.voltage) {
                Ok(()) | Err(Error::NotSupported) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// Reset the card and negotiate its operating conditions. Returns the operating condition
    /// register.
    fn wait_for_card_to_initialize(&self, card: &mut CardState) -> Result<u32, Error> {
        let spi = self.host.host_capabilities().contains(SdMode::SPI);
        self.send(&mut SdCommand::new(command::RESET, ResponseType::NONE, 0))?;
        self.host.stall(CARD_DELAY_US);
        if spi {
            self.send(&mut SdCommand::new(command::SPI_CRC_ON_OFF, ResponseType::R1, 1))?;
        }

        card.version = self.interface_condition();
        let mut requested = self.host.voltages().bits() & ocr::VOLTAGE_MASK;
        if card.version == CardVersion::Sd2 {
            requested |= ocr::HIGH_CAPACITY;
            if self.host.voltages().contains(Voltages::SWITCH_1V8) {
                requested |= ocr::SWITCH_1V8_REQUEST;
            }
        }

        let mut operating_condition = None;
        for attempt in 0..OPERATING_CONDITION_RETRIES {
            let mut acmd41 =
                SdCommand::new(command::SEND_SD_OPERATING_CONDITION, ResponseType::R3, requested);
            if let Err(error) = self.send_application(0, &mut acmd41) {
                if attempt == 0 {
                    debug!("SD: ACMD41 failed ({error}), trying MMC");
                    break;
                }
                return Err(error);
            }
            if spi || acmd41.response[0] & ocr::BUSY != 0 {
                operating_condition = Some(acmd41.response[0]);
                break;
            }
            self.host.stall(CARD_DELAY_US);
        }

        let operating_condition = match operating_condition {
            Some(value) => {
                if card.version != CardVersion::Sd2 {
                    card.version = CardVersion::Sd1p0;
                }
                value
            }
            None if card.version == CardVersion::Sd2 => return TimeoutSnafu.fail(),
            None => {
                card.version = CardVersion::Mmc1p2;
                self.wait_for_mmc_operating_condition()?
            }
        };

        if spi {
            let mut read_ocr =
                SdCommand::new(command::SPI_READ_OPERATING_CONDITION, ResponseType::R3, 0);
            self.send(&mut read_ocr)?;
            return Ok(read_ocr.response[0]);
        }
        Ok(operating_condition)
    }

    fn interface_condition(&self) -> CardVersion {
        for _ in 0..INTERFACE_CONDITION_RETRIES {
            let mut cmd8 = SdCommand::new(
                command::SEND_INTERFACE_CONDITION,
                ResponseType::R7,
                COMMAND8_ARGUMENT,
            );
            if self.send(&mut cmd8).is_ok() {
                if cmd8.response[0] & 0xFF == COMMAND8_ARGUMENT & 0xFF {
                    return CardVersion::Sd2;
                }
                warn!("SD: bad interface condition echo {:#x}", cmd8.response[0]);
            }
        }
        CardVersion::Unknown
    }

    fn wait_for_mmc_operating_condition(&self) -> Result<u32, Error> {
        self.send(&mut SdCommand::new(command::RESET, ResponseType::NONE, 0))?;
        self.host.stall(CARD_DELAY_US);
        let argument =
            (self.host.voltages().bits() & ocr::VOLTAGE_MASK) | ocr::HIGH_CAPACITY;
        let mut response = 0;
        let mut failure = None;
        let done = self.host.wait_for_milliseconds(CMD1_TIMEOUT_MS, || {
            let mut cmd1 = SdCommand::new(
                command::SEND_MMC_OPERATING_CONDITION,
                ResponseType::R3,
                argument,
            );
            match self.send(&mut cmd1) {
                Ok(()) => {
                    response = cmd1.response[0];
                    response & ocr::BUSY != 0
                }
                Err(error) => {
                    failure = Some(error);
                    true
                }
            }
        });
        if let Some(error) = failure {
            return Err(error);
        }
        done?;
        Ok(response)
    }

    fn switch_to_1v8(&self, card: &mut CardState) -> Result<(), Error> {
        self.send(&mut SdCommand::new(command::VOLTAGE_SWITCH, ResponseType::R1, 0))?;
        card.voltage = SdVoltage::V1_8;
        self.functions(SdFunctionSet::VOLTAGE)?
            .set_voltage(&self.host, SdVoltage::V1_8)
    }

    fn read_identification(&self, card: &mut CardState) -> Result<(), Error> {
        let mut cid = if self.host.host_capabilities().contains(SdMode::SPI) {
            SdCommand::new(command::SEND_CARD_IDENTIFICATION, ResponseType::R1, 0)
        } else {
            SdCommand::new(command::ALL_SEND_CARD_IDENTIFICATION, ResponseType::R2, 0)
        };
        self.send(&mut cid)?;
        card.identification = cid.response;
        Ok(())
    }

    fn set_card_address(&self, card: &mut CardState) -> Result<(), Error> {
        if self.host.host_capabilities().contains(SdMode::SPI) {
            return Ok(());
        }
        if card.version.is_sd() {
            let mut cmd3 = SdCommand::new(command::SET_RELATIVE_ADDRESS, ResponseType::R6, 0);
            self.send(&mut cmd3)?;
            card.card_address = (cmd3.response[0] >> 16) as u16;
        } else {
            card.card_address = 1;
            self.send(&mut SdCommand::new(
                command::SET_RELATIVE_ADDRESS,
                ResponseType::R1,
                u32::from(card.card_address) << 16,
            ))?;
        }
        Ok(())
    }

    fn read_card_specific_data(&self, card: &mut CardState) -> Result<(), Error> {
        let mut cmd9 = SdCommand::new(
            command::SEND_CARD_SPECIFIC_DATA,
            ResponseType::R2,
            u32::from(card.card_address) << 16,
        );
        self.send(&mut cmd9)?;
        card.card_specific_data = cmd9.response;
        if !card.version.is_sd() {
            card.version = CardVersion::from_mmc_csd(&cmd9.response);
        }
        let high_capacity = self.host.flags().contains(ControllerFlags::HIGH_CAPACITY);
        let geometry =
            CardGeometry::decode(&cmd9.response, high_capacity, card.version.is_sd());
        card.clock_speed = geometry.clock_speed;
        card.read_block_length = geometry.read_block_length;
        card.write_block_length = geometry.write_block_length;
        card.user_capacity = geometry.capacity;
        Ok(())
    }

    fn select_card(&self, card: &CardState) -> Result<(), Error> {
        if self.host.host_capabilities().contains(SdMode::SPI) {
            return Ok(());
        }
        self.send(&mut SdCommand::new(
            command::SELECT_CARD,
            ResponseType::R1,
            u32::from(card.card_address) << 16,
        ))?;
        self.wait_for_state_transition(card)
    }

    fn card_status(&self, card: &CardState) -> Result<u32, Error> {
        let mut cmd13 = SdCommand::new(
            command::SEND_STATUS,
            ResponseType::R1,
            u32::from(card.card_address) << 16,
        );
        self.send(&mut cmd13)?;
        Ok(cmd13.response[0])
    }

    /// Wait for the card to be ready for data in the transfer state.
    fn wait_for_state_transition(&self, card: &CardState) -> Result<(), Error> {
        if self.host.host_capabilities().contains(SdMode::SPI) {
            return Ok(());
        }
        let mut failure = None;
        let done = self.host.wait_for_milliseconds(STATUS_TIMEOUT_MS, || {
            match self.card_status(card) {
                Ok(status) if status & card_status::ERROR_MASK != 0 => {
                    failure = Some(Error::DeviceIoError { status });
                    true
                }
                Ok(status) => {
                    status & card_status::READY_FOR_DATA != 0
                        && status & card_status::STATE_MASK != card_status::STATE_PROGRAM
                }
                Err(error) => {
                    failure = Some(error);
                    true
                }
            }
        });
        if let Some(error) = failure {
            return Err(error);
        }
        done
    }

    /// Read the configuration register and switch status. Returns the modes the card supports.
    fn read_sd_capabilities(&self, card: &mut CardState) -> Result<SdMode, Error> {
        let mut configuration = None;
        let mut last_error = Error::Timeout;
        for _ in 0..SCR_RETRIES {
            let mut acmd51 =
                SdCommand::new(command::SEND_SD_CONFIGURATION_REGISTER, ResponseType::R1, 0)
                    .with_read(8);
            match self.send_application(card.card_address, &mut acmd51) {
                Ok(()) => {
                    configuration = Some(BigEndian::read_u32(&acmd51.buffer[0..4]));
                    break;
                }
                Err(error) => last_error = error,
            }
        }
        let Some(configuration) = configuration else {
            return Err(last_error);
        };

        card.version = match (configuration >> configuration_register::VERSION_SHIFT)
            & configuration_register::VERSION_MASK
        {
            0 => CardVersion::Sd1p0,
            1 => CardVersion::Sd1p10,
            _ if configuration & configuration_register::VERSION3 != 0 => CardVersion::Sd3,
            _ => CardVersion::Sd2,
        };
        let mut modes = SdMode::empty();
        if configuration & configuration_register::BUS_WIDTH_4 != 0 {
            modes |= SdMode::FOUR_BIT;
        }
        if configuration & configuration_register::CMD23 != 0 {
            modes |= SdMode::CMD23;
        }
        if card.version < CardVersion::Sd1p10 {
            return Ok(modes);
        }

        for _ in 0..SWITCH_RETRIES {
            let status = self.sd_switch(false, 0, 1)?;
            if status[7] & switch_status::GROUP0_BUSY == 0 {
                if status[3] & switch_status::HIGH_SPEED_SUPPORTED != 0 {
                    modes |= SdMode::HIGH_SPEED;
                }
                break;
            }
        }
        Ok(modes)
    }

    /// Query or set a switch function. Returns the switch status words.
    fn sd_switch(&self, set: bool, group: u32, value: u32) -> Result<[u32; 16], Error> {
        let mut argument = (u32::from(set) << 31) | 0x00FF_FFFF;
        argument &= !(0xF << (group * 4));
        argument |= value << (group * 4);
        let mut cmd6 = SdCommand::new(command::SWITCH, ResponseType::R1, argument)
            .with_read(switch_status::SIZE);
        self.send(&mut cmd6)?;
        let mut status = [0u32; 16];
        BigEndian::read_u32_into(&cmd6.buffer, &mut status);
        Ok(status)
    }

    fn apply_sd_bus_mode(&self, card: &mut CardState, modes: SdMode) -> Result<(), Error> {
        if modes.contains(SdMode::FOUR_BIT) {
            self.send_application(
                card.card_address,
                &mut SdCommand::new(command::SET_BUS_WIDTH, ResponseType::R1, 2),
            )?;
            card.bus_width = 4;
        }
        card.clock_speed = CLOCK_25MHZ;
        if modes.contains(SdMode::HIGH_SPEED) {
            let status = self.sd_switch(true, 0, 1)?;
            if status[4] & switch_status::GROUP0_RESULT_MASK
                == switch_status::GROUP0_RESULT_HIGH_SPEED
            {
                card.clock_speed = CLOCK_50MHZ;
            }
        }
        self.set_bus_parameters(card)
    }

    fn read_extended_csd(&self) -> Result<Vec<u8>, Error> {
        let mut cmd8 = SdCommand::new(
            command::MMC_SEND_EXTENDED_CARD_SPECIFIC_DATA,
            ResponseType::R1,
            0,
        )
        .with_read(extended_csd::SIZE);
        self.send(&mut cmd8)?;
        Ok(cmd8.buffer)
    }

    fn read_mmc_capabilities(&self, card: &CardState) -> Result<SdMode, Error> {
        let mut modes = SdMode::FOUR_BIT | SdMode::EIGHT_BIT;
        if card.version < CardVersion::Mmc4 {
            return Ok(SdMode::empty());
        }
        let card_type =
            self.read_extended_csd()?[extended_csd::CARD_TYPE] & extended_csd::CARD_TYPE_MASK;
        if card_type & extended_csd::CARD_TYPE_52MHZ != 0 {
            modes |= SdMode::HIGH_SPEED | SdMode::HIGH_SPEED_52MHZ;
        } else if card_type & extended_csd::CARD_TYPE_26MHZ != 0 {
            modes |= SdMode::HIGH_SPEED;
        }
        Ok(modes)
    }

    fn mmc_switch(&self, card: &CardState, index: u8, value: u8) -> Result<(), Error> {
        let argument = (extended_csd::ACCESS_WRITE_BYTE << 24)
            | (u32::from(index) << 16)
            | (u32::from(value) << 8);
        self.send(&mut SdCommand::new(
            command::SWITCH,
            ResponseType::R1B,
            argument,
        ))?;
        self.wait_for_state_transition(card)
    }

    fn apply_mmc_bus_mode(&self, card: &mut CardState, modes: SdMode) -> Result<(), Error> {
        let widths = [
            (SdMode::EIGHT_BIT, 8, extended_csd::WIDTH_8),
            (SdMode::FOUR_BIT, 4, extended_csd::WIDTH_4),
        ];
        for (mode, width, value) in widths {
            if !modes.contains(mode) {
                continue;
            }
            self.mmc_switch(card, extended_csd::BUS_WIDTH, value)?;
            card.bus_width = width;
            self.set_bus_parameters(card)?;
            match self.read_extended_csd() {
                Ok(extended) if extended[usize::from(extended_csd::BUS_WIDTH)] == value => break,
                _ => {
                    debug!("SD: MMC {width}-bit bus did not stick");
                    card.bus_width = 1;
                    self.mmc_switch(card, extended_csd::BUS_WIDTH, extended_csd::WIDTH_1)?;
                    self.set_bus_parameters(card)?;
                }
            }
        }

        if modes.contains(SdMode::HIGH_SPEED) {
            self.mmc_switch(card, extended_csd::HS_TIMING, 1)?;
            card.clock_speed = if modes.contains(SdMode::HIGH_SPEED_52MHZ) {
                CLOCK_52MHZ
            } else {
                CLOCK_26MHZ
            };
        }
        self.set_bus_parameters(card)
    }

    fn set_block_length(&self) -> Result<(), Error> {
        let mut result = Ok(());
        for _ in 0..SET_BLOCK_LENGTH_RETRIES {
            result = self.send(&mut SdCommand::new(
                command::SET_BLOCK_LENGTH,
                ResponseType::R1,
                SD_BLOCK_SIZE,
            ));
            if result.is_ok() {
                break;
            }
        }
        result
    }
}

impl SdController {
    /// Size of the initialized card.
    ///
    /// # Errors
    /// Returns [`Error::NoMedia`] or [`Error::MediaChanged`] if there is no usable card.
    pub fn media_parameters(&self) -> Result<MediaParameters, Error> {
        self.check_media()?;
        let card = self.card.lock();
        Ok(MediaParameters {
            block_count: card.user_capacity / u64::from(card.read_block_length.max(1)),
            block_size: card.read_block_length,
        })
    }

    fn check_media(&self) -> Result<(), Error> {
        let flags = self.host.flags();
        ensure!(!flags.contains(ControllerFlags::MEDIA_CHANGED), MediaChangedSnafu);
        ensure!(flags.contains(ControllerFlags::MEDIA_PRESENT), NoMediaSnafu);
        Ok(())
    }

    /// Whether the card is write protected. Hosts that cannot tell report it writable.
    ///
    /// # Errors
    /// Returns the host's error if the switch could not be read.
    pub fn write_protected(&self) -> Result<bool, Error> {
        match self.functions(SdFunctionSet::WRITE_PROTECT) {
            Ok(functions) => match functions.write_protect(&self.host) {
                Err(Error::NotSupported) => Ok(false),
                other => other,
            },
            Err(_) => Ok(false),
        }
    }

    fn block_argument(&self, block: u64) -> Result<u32, Error> {
        let address = if self.host.flags().contains(ControllerFlags::HIGH_CAPACITY) {
            block
        } else {
            block * u64::from(SD_BLOCK_SIZE)
        };
        u32::try_from(address).map_err(|_| Error::InvalidParameter {
            reason: "block beyond addressable range",
        })
    }

    fn transfer_polled(
        &self,
        card: &CardState,
        block_offset: u64,
        buffer: &mut [u8],
        write: bool,
    ) -> Result<(), Error> {
        let block_size = SD_BLOCK_SIZE as usize;
        ensure!(
            !buffer.is_empty() && buffer.len() % block_size == 0,
            InvalidParameterSnafu {
                reason: "buffer is not a whole number of blocks"
            }
        );
        let host_modes = self.host.host_capabilities();
        let chunk_size = card.max_blocks_per_transfer.max(1) as usize * block_size;
        let mut block = block_offset;
        for chunk in buffer.chunks_mut(chunk_size) {
            let count = chunk.len() / block_size;
            let argument = self.block_argument(block)?;
            let index = match (write, count > 1) {
                (false, false) => command::READ_SINGLE_BLOCK,
                (false, true) => command::READ_MULTIPLE_BLOCKS,
                (true, false) => command::WRITE_SINGLE_BLOCK,
                (true, true) => command::WRITE_MULTIPLE_BLOCKS,
            };
            let mut transfer = SdCommand::new(index, ResponseType::R1, argument);
            transfer = if write {
                transfer.with_write(chunk.to_vec())
            } else {
                transfer.with_read(chunk.len())
            };
            self.send(&mut transfer)?;
            if !write {
                chunk.copy_from_slice(&transfer.buffer);
            }
            if count > 1
                && !host_modes.contains(SdMode::AUTO_CMD12)
                && !(write && host_modes.contains(SdMode::SPI))
            {
                self.send_stop(true, false)?;
            }
            block += count as u64;
        }
        Ok(())
    }

    /// Read or write whole blocks with polled I/O. Recovery runs on failure but the I/O is not
    /// retried.
    ///
    /// # Errors
    /// Returns [`Error::MediaChanged`] or [`Error::NoMedia`] if the card is not usable, otherwise
    /// the error that ended the transfer.
    pub fn block_io_polled(
        &self,
        block_offset: u64,
        buffer: &mut [u8],
        write: bool,
    ) -> Result<(), Error> {
        self.check_media()?;
        let mut card = self.card.lock();
        match self.transfer_polled(&card, block_offset, buffer, write) {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!("SD: polled I/O at block {block_offset} failed: {error}");
                self.recover(&mut card)?;
                Err(error)
            }
        }
    }

    /// Polled I/O with recovery and retry. The count starts at zero for each call and the I/O
    /// fails for good once it reaches [`SD_MAX_IO_RETRIES`], or as soon as the card is gone.
    ///
    /// # Errors
    /// Returns [`Error::MediaChanged`] or [`Error::NoMedia`] when the card went away, otherwise
    /// the error of the last attempt.
    pub fn perform_io_with_retries(
        &self,
        block_offset: u64,
        buffer: &mut [u8],
        write: bool,
    ) -> Result<(), Error> {
        let mut card = self.card.lock();
        self.try_count.store(0, Ordering::Relaxed);
        loop {
            self.check_media()?;
            let Err(error) = self.transfer_polled(&card, block_offset, buffer, write) else {
                return Ok(());
            };
            let attempt = self.try_count.load(Ordering::Relaxed);
            warn!("SD: I/O at block {block_offset} failed on attempt {attempt}: {error}");
            let recovered = self.recover(&mut card);
            if attempt >= SD_MAX_IO_RETRIES || self.check_media().is_err() {
                self.check_media()?;
                recovered?;
                return Err(error);
            }
            self.try_count.store(attempt + 1, Ordering::Relaxed);
        }
    }

    /// Abort whatever the card is doing and put it back in the transfer state.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] if the card never got there, or [`Error::NoMedia`] if it left.
    pub fn abort_transaction(&self, busy: bool) -> Result<(), Error> {
        let card = self.card.lock();
        self.abort(&card, busy)
    }

    fn abort(&self, card: &CardState, busy: bool) -> Result<(), Error> {
        if let Ok(functions) = self.functions(SdFunctionSet::STOP_DATA_TRANSFER) {
            match functions.stop_data_transfer(&self.host) {
                Ok(()) | Err(Error::NotSupported) => {}
                Err(error) => debug!("SD: stop data transfer failed: {error}"),
            }
        }
        let deadline = self.host.query_time_counter().saturating_add(ticks_for_milliseconds(
            self.host.time.frequency(),
            STATUS_TIMEOUT_MS,
        ));
        loop {
            self.reset(ResetFlags::COMMAND_LINE | ResetFlags::DATA_LINE)?;
            if let Ok(status) = self.card_status(card) {
                if status & card_status::READY_FOR_DATA != 0
                    && status & card_status::STATE_MASK == card_status::STATE_TRANSFER
                {
                    return Ok(());
                }
            }
            if let Err(error) = self.send_stop(busy, false) {
                trace!("SD: stop during abort failed: {error}");
            }
            if !self.card_detected().unwrap_or(true) {
                self.host.remove_flags(ControllerFlags::MEDIA_PRESENT);
            }
            ensure!(
                self.host.flags().contains(ControllerFlags::MEDIA_PRESENT),
                NoMediaSnafu
            );
            if self.host.query_time_counter() > deadline {
                return TimeoutSnafu.fail();
            }
        }
    }

    /// Recover after a failed command or transfer: abort, then bring the card up again and check
    /// it is the same card.
    ///
    /// # Errors
    /// Returns [`Error::MediaChanged`] if a different card answered, or the error that prevented
    /// re-initialization.
    pub fn error_recovery(&self) -> Result<(), Error> {
        let mut card = self.card.lock();
        self.recover(&mut card)
    }

    fn recover(&self, card: &mut CardState) -> Result<(), Error> {
        if let Err(error) = self.abort(card, false) {
            debug!("SD: abort failed: {error}");
        }
        ensure!(
            !self.host.flags().contains(ControllerFlags::MEDIA_CHANGED),
            MediaChangedSnafu
        );
        let previous = card.card_specific_data;
        self.host.remove_flags(ControllerFlags::MEDIA_PRESENT);
        if let Err(error) = self.initialize_card(card, true) {
            warn!("SD: re-initialization failed: {error}");
            self.host.insert_flags(ControllerFlags::REMOVAL_PENDING);
            self.notify_media_change();
            return Err(error);
        }
        if card.card_specific_data != previous {
            info!("SD: a different card was inserted");
            self.host.insert_flags(
                ControllerFlags::MEDIA_CHANGED
                    | ControllerFlags::REMOVAL_PENDING
                    | ControllerFlags::INSERTION_PENDING,
            );
            self.host.remove_flags(ControllerFlags::MEDIA_PRESENT);
            self.notify_media_change();
            return MediaChangedSnafu.fail();
        }
        Ok(())
    }

    fn notify_media_change(&self) {
        let flags = self.host.flags();
        let removed = flags.contains(ControllerFlags::REMOVAL_PENDING);
        let inserted = flags.contains(ControllerFlags::INSERTION_PENDING);
        if !removed && !inserted {
            return;
        }
        if let Some(handler) = self.media_change.load_full() {
            handler.media_changed(removed, inserted);
            self.host.remove_flags(
                ControllerFlags::REMOVAL_PENDING | ControllerFlags::INSERTION_PENDING,
            );
        }
    }

    /// Tell the card how many blocks the next multiple block command moves.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if the card lacks SET_BLOCK_COUNT, or
    /// [`Error::InvalidParameter`] for a count it cannot hold.
    pub fn send_block_count(&self, count: u32, interrupt_completion: bool) -> Result<(), Error> {
        ensure!(
            self.host.card_capabilities().contains(SdMode::CMD23),
            NotSupportedSnafu
        );
        ensure!(
            count != 0 && count <= MAX_CMD23_BLOCKS,
            InvalidParameterSnafu {
                reason: "block count out of range"
            }
        );
        let mut cmd23 = SdCommand::new(command::SET_BLOCK_COUNT, ResponseType::R1, count);
        cmd23.dma = interrupt_completion;
        self.send(&mut cmd23)
    }

    /// Send STOP_TRANSMISSION.
    ///
    /// # Errors
    /// Returns the command's error.
    pub fn send_stop(&self, busy: bool, interrupt_completion: bool) -> Result<(), Error> {
        let response_type = if busy {
            ResponseType::R1B
        } else {
            ResponseType::R1
        };
        let mut cmd12 = SdCommand::new(command::STOP_TRANSMISSION, response_type, 0);
        cmd12.dma = interrupt_completion;
        self.send(&mut cmd12)
    }

    /// Set up DMA on a standard host.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] without standard registers or a DMA capable host.
    pub fn initialize_dma(&self) -> Result<(), Error> {
        match &self.standard {
            Some(standard) => standard.initialize_dma(&self.host),
            None => NotSupportedSnafu.fail(),
        }
    }

    /// Start a DMA transfer of up to `block_count` blocks between the card and `fragments`,
    /// beginning `buffer_offset` bytes into them. `completion` is always called exactly once,
    /// from [`Self::interrupt_service_dispatch`] or right away if the transfer could not start.
    /// The transfer may be shortened; the completion reports how many bytes moved.
    pub fn block_io_dma(
        &self,
        block_offset: u64,
        block_count: u32,
        fragments: &[DmaFragment],
        buffer_offset: u64,
        write: bool,
        completion: Arc<dyn IoCompletion + Send + Sync>,
    ) {
        if let Err(error) = self.start_dma(
            block_offset,
            block_count,
            fragments,
            buffer_offset,
            write,
            &completion,
        ) {
            warn!("SD: DMA at block {block_offset} failed to start: {error}");
            self.pending_io.store(None);
            completion.io_complete(0, Err(error));
        }
    }

    fn start_dma(
        &self,
        block_offset: u64,
        block_count: u32,
        fragments: &[DmaFragment],
        buffer_offset: u64,
        write: bool,
        completion: &Arc<dyn IoCompletion + Send + Sync>,
    ) -> Result<(), Error> {
        self.check_media()?;
        let standard = self.standard.as_ref().ok_or(Error::NotSupported)?;
        ensure!(
            self.host.flags().contains(ControllerFlags::DMA_ENABLED),
            NotReadySnafu
        );
        ensure!(
            block_count != 0,
            InvalidParameterSnafu {
                reason: "empty transfer"
            }
        );
        let card = self.card.lock();
        let mut count = block_count
            .min(card.max_blocks_per_transfer)
            .min(SD_MAX_BLOCK_COUNT);
        let host_modes = self.host.host_capabilities();
        let card_modes = self.host.card_capabilities();
        let use_block_count = count > 1
            && !host_modes.contains(SdMode::AUTO_CMD12)
            && card_modes.contains(SdMode::CMD23);
        if count > 1 && !host_modes.contains(SdMode::AUTO_CMD12) && !use_block_count {
            count = 1;
        }

        let size = standard.prepare_dma(&self.host, fragments, buffer_offset, count * SD_BLOCK_SIZE)?;
        let count = size / SD_BLOCK_SIZE;
        ensure!(
            count != 0,
            InvalidParameterSnafu {
                reason: "fragments shorter than one block"
            }
        );
        let argument = self.block_argument(block_offset)?;
        if use_block_count && count > 1 {
            self.send_block_count(count, false)?;
        }
        let index = match (write, count > 1) {
            (false, false) => command::READ_SINGLE_BLOCK,
            (false, true) => command::READ_MULTIPLE_BLOCKS,
            (true, false) => command::WRITE_SINGLE_BLOCK,
            (true, true) => command::WRITE_MULTIPLE_BLOCKS,
        };
        let size = count * SD_BLOCK_SIZE;
        self.pending_io.store(Some(Arc::new(PendingIo {
            completion: completion.clone(),
            size,
        })));
        standard.set_dma_interrupts(&self.host, true, size);
        let mut transfer =
            SdCommand::new(index, ResponseType::R1, argument).with_dma(size, write);
        let result = self.send(&mut transfer);
        if result.is_err() {
            standard.set_dma_interrupts(&self.host, false, 0);
        }
        drop(card);
        result
    }

    /// Fast interrupt service. Latches the host's interrupt status.
    pub fn interrupt_service(&self) -> InterruptStatus {
        match &self.standard {
            Some(standard) => standard.interrupt_service(),
            None => InterruptStatus::NotClaimed,
        }
    }

    /// Deferred interrupt work: finish the pending DMA transfer and report card insertion or
    /// removal.
    pub fn interrupt_service_dispatch(&self) -> InterruptStatus {
        let Some(standard) = &self.standard else {
            return InterruptStatus::NotClaimed;
        };
        let pending = standard.take_pending();
        if pending.is_empty() {
            return InterruptStatus::NotClaimed;
        }
        trace!("SD: dispatch {pending:?}");

        let mut result = None;
        if pending.intersects(InterruptBits::CARD_INSERTION | InterruptBits::CARD_REMOVAL) {
            if pending.contains(InterruptBits::CARD_REMOVAL) {
                self.host.remove_flags(ControllerFlags::MEDIA_PRESENT);
                self.host.insert_flags(ControllerFlags::REMOVAL_PENDING);
            }
            if pending.contains(InterruptBits::CARD_INSERTION) {
                self.host.insert_flags(ControllerFlags::INSERTION_PENDING);
            }
            result = Some(NoMediaSnafu.fail());
        } else if pending.intersects(InterruptBits::ERROR_MASK) {
            result = Some(Err(Error::DeviceIoError {
                status: pending.bits(),
            }));
        } else if pending
            .intersects(InterruptBits::TRANSFER_COMPLETE | InterruptBits::COMMAND_COMPLETE)
        {
            result = Some(Ok(()));
        }

        if let Some(result) = result {
            if let Some(io) = self.pending_io.swap(None) {
                standard.set_dma_interrupts(&self.host, false, 0);
                let bytes = if result.is_ok() { io.size } else { 0 };
                io.completion.io_complete(bytes, result);
            }
        }
        self.notify_media_change();
        InterruptStatus::Claimed
    }

    /// The interrupt connection for this slot.
    pub fn connection(self: &Arc<Self>) -> Connection {
        let service = self.clone();
        let worker = self.clone();
        Connection {
            service: Some(Arc::new(move || service.interrupt_service())),
            worker: Some(Arc::new(move || worker.interrupt_service_dispatch())),
        }
    }
}
