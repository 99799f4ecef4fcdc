//! Host functions for controllers that follow the SD host controller standard.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace, warn};
use snafu::ensure;
use spin::Mutex;

use super::{
    adma2::{DescriptorTable, DmaFragment},
    ControllerFlags, DeviceIoSnafu, Error, InitializePhase, InvalidConfigurationSnafu,
    InvalidParameterSnafu, NotSupportedSnafu, ResetFlags, ResponseType, SdCommand, SdFunctionSet,
    SdFunctions, SdHost, SdMode, SdVoltage, Voltages, SD_BLOCK_SIZE,
};
use crate::{
    interrupt::InterruptStatus,
    registers::{RegisterAccess, RegisterAccessExt},
};

#[allow(unused, missing_docs)]
pub(crate) mod regs {
    pub const SDMA_ADDRESS: usize = 0x00;
    pub const BLOCK_SIZE_COUNT: usize = 0x04;
    pub const ARGUMENT1: usize = 0x08;
    pub const COMMAND: usize = 0x0C;
    pub const RESPONSE10: usize = 0x10;
    pub const RESPONSE32: usize = 0x14;
    pub const RESPONSE54: usize = 0x18;
    pub const RESPONSE76: usize = 0x1C;
    pub const BUFFER_DATA_PORT: usize = 0x20;
    pub const PRESENT_STATE: usize = 0x24;
    pub const HOST_CONTROL: usize = 0x28;
    pub const CLOCK_CONTROL: usize = 0x2C;
    pub const INTERRUPT_STATUS: usize = 0x30;
    pub const INTERRUPT_STATUS_ENABLE: usize = 0x34;
    pub const INTERRUPT_SIGNAL_ENABLE: usize = 0x38;
    pub const CONTROL_STATUS2: usize = 0x3C;
    pub const CAPABILITIES: usize = 0x40;
    pub const CAPABILITIES2: usize = 0x44;
    pub const ADMA_ERROR_STATUS: usize = 0x54;
    pub const ADMA_ADDRESS_LOW: usize = 0x58;
    pub const ADMA_ADDRESS_HIGH: usize = 0x5C;
    pub const SLOT_STATUS_VERSION: usize = 0xFC;

    pub const COMMAND_DMA_ENABLE: u32 = 1 << 0;
    pub const COMMAND_BLOCK_COUNT_ENABLE: u32 = 1 << 1;
    pub const COMMAND_AUTO_CMD12: u32 = 1 << 2;
    pub const COMMAND_AUTO_CMD23: u32 = 2 << 2;
    pub const COMMAND_TRANSFER_READ: u32 = 1 << 4;
    pub const COMMAND_MULTIPLE_BLOCKS: u32 = 1 << 5;
    pub const COMMAND_RESPONSE_136: u32 = 1 << 16;
    pub const COMMAND_RESPONSE_48: u32 = 2 << 16;
    pub const COMMAND_RESPONSE_48_BUSY: u32 = 3 << 16;
    pub const COMMAND_CRC_CHECK: u32 = 1 << 19;
    pub const COMMAND_INDEX_CHECK: u32 = 1 << 20;
    pub const COMMAND_DATA_PRESENT: u32 = 1 << 21;
    pub const COMMAND_INDEX_SHIFT: u32 = 24;

    pub const BLOCK_COUNT_SHIFT: u32 = 16;
    pub const SDMA_BOUNDARY_512K: u32 = 7 << 12;
    pub const SDMA_BOUNDARY: u64 = 0x8_0000;

    pub const HOST_DATA_4BIT: u32 = 1 << 1;
    pub const HOST_DMA_MODE_MASK: u32 = 3 << 3;
    pub const HOST_DMA_SDMA: u32 = 0 << 3;
    pub const HOST_DMA_ADMA2_32: u32 = 2 << 3;
    pub const HOST_DATA_8BIT: u32 = 1 << 5;
    pub const HOST_POWER_ENABLE: u32 = 1 << 8;
    pub const HOST_POWER_1V8: u32 = 5 << 9;
    pub const HOST_POWER_3V0: u32 = 6 << 9;
    pub const HOST_POWER_3V3: u32 = 7 << 9;
    pub const HOST_POWER_MASK: u32 = 7 << 9;
    pub const HOST_STOP_AT_BLOCK_GAP: u32 = 1 << 16;

    pub const CONTROL2_SIGNALING_1V8: u32 = 1 << 19;

    pub const CLOCK_INTERNAL_ENABLE: u32 = 1 << 0;
    pub const CLOCK_STABLE: u32 = 1 << 1;
    pub const CLOCK_SD_ENABLE: u32 = 1 << 2;
    pub const CLOCK_DIVISOR_MASK: u32 = 0xFFC0;
    pub const CLOCK_TIMEOUT: u32 = 14 << 16;
    pub const CLOCK_RESET_ALL: u32 = 1 << 24;
    pub const CLOCK_RESET_COMMAND: u32 = 1 << 25;
    pub const CLOCK_RESET_DATA: u32 = 1 << 26;

    pub const CAPABILITY_BASE_CLOCK_SHIFT: u32 = 8;
    pub const CAPABILITY_V2_BASE_CLOCK_MASK: u32 = 0x3F;
    pub const CAPABILITY_V3_BASE_CLOCK_MASK: u32 = 0xFF;
    pub const CAPABILITY_8BIT: u32 = 1 << 18;
    pub const CAPABILITY_ADMA2: u32 = 1 << 19;
    pub const CAPABILITY_HIGH_SPEED: u32 = 1 << 21;
    pub const CAPABILITY_SDMA: u32 = 1 << 22;
    pub const CAPABILITY_VOLTAGE_3V3: u32 = 1 << 24;
    pub const CAPABILITY_VOLTAGE_3V0: u32 = 1 << 25;
    pub const CAPABILITY_VOLTAGE_1V8: u32 = 1 << 26;

    pub const VERSION_SHIFT: u32 = 16;
    pub const VERSION_MASK: u32 = 0xFF;
    pub const VERSION_3: u32 = 2;

    pub const V2_MAX_DIVISOR: u32 = 0x80;
    pub const V3_MAX_DIVISOR: u32 = 2046;
}

bitflags! {
    /// Normal and error interrupt status bits.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct InterruptBits: u32 {
        /// A command's response arrived.
        const COMMAND_COMPLETE = 1 << 0;
        /// A data transfer or busy signal finished.
        const TRANSFER_COMPLETE = 1 << 1;
        /// An SDMA transfer crossed a buffer boundary.
        const DMA = 1 << 3;
        /// The buffer can take a block.
        const BUFFER_WRITE_READY = 1 << 4;
        /// The buffer holds a block.
        const BUFFER_READ_READY = 1 << 5;
        /// A card was inserted.
        const CARD_INSERTION = 1 << 6;
        /// A card was removed.
        const CARD_REMOVAL = 1 << 7;
        /// Some error bit is set.
        const ERROR_INTERRUPT = 1 << 15;
        /// No command response.
        const COMMAND_TIMEOUT = 1 << 16;
        /// Bad command response CRC.
        const COMMAND_CRC = 1 << 17;
        /// Bad command response end bit.
        const COMMAND_END_BIT = 1 << 18;
        /// The response was for another command.
        const COMMAND_INDEX = 1 << 19;
        /// No data from the card.
        const DATA_TIMEOUT = 1 << 20;
        /// Bad data CRC.
        const DATA_CRC = 1 << 21;
        /// Bad data end bit.
        const DATA_END_BIT = 1 << 22;
        /// The card drew too much current.
        const CURRENT_LIMIT = 1 << 23;
        /// The automatic stop command failed.
        const AUTO_CMD12 = 1 << 24;
        /// The DMA engine failed.
        const ADMA = 1 << 25;
        /// Tuning failed.
        const TUNING = 1 << 26;
        /// Vendor specific errors.
        const VENDOR = 0xF << 28;
        /// Every bit that reports a failure.
        const ERROR_MASK = Self::COMMAND_TIMEOUT.bits()
            | Self::COMMAND_CRC.bits()
            | Self::COMMAND_END_BIT.bits()
            | Self::COMMAND_INDEX.bits()
            | Self::DATA_TIMEOUT.bits()
            | Self::DATA_CRC.bits()
            | Self::DATA_END_BIT.bits()
            | Self::CURRENT_LIMIT.bits()
            | Self::AUTO_CMD12.bits()
            | Self::ADMA.bits()
            | Self::VENDOR.bits();
    }

    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    struct PresentState: u32 {
        const COMMAND_INHIBIT = 1 << 0;
        const DATA_INHIBIT = 1 << 1;
        const CARD_INSERTED = 1 << 16;
        const WRITE_ENABLED = 1 << 19;
        const DATA_LINE_LEVEL = 0xF << 20;
    }
}

const STATUS_ENABLE_DEFAULT: InterruptBits = InterruptBits::ERROR_MASK
    .union(InterruptBits::CARD_INSERTION)
    .union(InterruptBits::CARD_REMOVAL)
    .union(InterruptBits::BUFFER_WRITE_READY)
    .union(InterruptBits::BUFFER_READ_READY)
    .union(InterruptBits::DMA)
    .union(InterruptBits::TRANSFER_COMPLETE)
    .union(InterruptBits::COMMAND_COMPLETE);

const SIGNAL_ENABLE_DEFAULT: InterruptBits =
    InterruptBits::CARD_INSERTION.union(InterruptBits::CARD_REMOVAL);

const VOLTAGE_SWITCH_DELAY_US: u32 = 5000;
const CLOCK_RESTART_DELAY_US: u32 = 1000;

/// The divisor register value that brings `fundamental` down to at most `target` Hz.
///
/// Hosts before version 3 divide by twice a power of two; version 3 hosts divide by any even
/// number.
#[must_use]
pub fn clock_divisor(version: u32, fundamental: u32, target: u32) -> u32 {
    if target == 0 || target >= fundamental {
        return 0;
    }
    if version >= regs::VERSION_3 {
        let divisor = fundamental.div_ceil(target);
        let divisor = (divisor + (divisor & 1)).min(regs::V3_MAX_DIVISOR);
        divisor / 2
    } else {
        let mut divisor = 1;
        while divisor < regs::V2_MAX_DIVISOR && fundamental / (divisor * 2) > target {
            divisor <<= 1;
        }
        divisor
    }
}

/// A host controller reached through its standard register window.
pub struct StandardHost {
    registers: Arc<dyn RegisterAccess + Send + Sync>,
    version: AtomicU32,
    signal_enable: AtomicU32,
    pending_status: AtomicU32,
    dma_table: Mutex<Option<DescriptorTable>>,
}

impl StandardHost {
    /// Wrap a register window. `dma_table` is needed for ADMA2.
    pub fn new(
        registers: Arc<dyn RegisterAccess + Send + Sync>,
        dma_table: Option<DescriptorTable>,
    ) -> Self {
        Self {
            registers,
            version: AtomicU32::new(0),
            signal_enable: AtomicU32::new(0),
            pending_status: AtomicU32::new(0),
            dma_table: Mutex::new(dma_table),
        }
    }

    fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    fn present_state(&self) -> PresentState {
        PresentState::from_bits_retain(self.registers.read32(regs::PRESENT_STATE))
    }

    fn status(&self) -> InterruptBits {
        InterruptBits::from_bits_retain(self.registers.read32(regs::INTERRUPT_STATUS))
    }

    fn acknowledge(&self, bits: InterruptBits) {
        self.registers.write32(regs::INTERRUPT_STATUS, bits.bits());
    }

    /// Wait for any of `bits` or an error. Errors reset `line` and are returned.
    fn wait_for_status(
        &self,
        host: &SdHost,
        bits: InterruptBits,
        line: ResetFlags,
    ) -> Result<InterruptBits, Error> {
        let mut status = InterruptBits::empty();
        let waited = host.wait_for(|| {
            status = self.status();
            status.intersects(bits | InterruptBits::ERROR_INTERRUPT | InterruptBits::ERROR_MASK)
        });
        if waited.is_err() {
            warn!("SD: timed out waiting for {bits:?}, status {status:?}");
            self.reset_controller(host, line)?;
            return Err(Error::Timeout);
        }
        if status.intersects(InterruptBits::ERROR_MASK | InterruptBits::ERROR_INTERRUPT) {
            debug!("SD: error status {status:?}");
            self.acknowledge(status & (InterruptBits::ERROR_MASK | InterruptBits::ERROR_INTERRUPT));
            self.reset_controller(host, line)?;
            if status.contains(InterruptBits::COMMAND_TIMEOUT) {
                return Err(Error::Timeout);
            }
            return Err(Error::DeviceIoError {
                status: status.bits(),
            });
        }
        Ok(status)
    }

    fn read_data(&self, host: &SdHost, command: &mut SdCommand) -> Result<(), Error> {
        let size = command.buffer_size as usize;
        ensure!(
            command.buffer.len() >= size,
            InvalidParameterSnafu {
                reason: "read buffer too small"
            }
        );
        let block_size = size.min(SD_BLOCK_SIZE as usize);
        for block in command.buffer[..size].chunks_mut(block_size) {
            self.wait_for_status(host, InterruptBits::BUFFER_READ_READY, ResetFlags::DATA_LINE)?;
            self.acknowledge(InterruptBits::BUFFER_READ_READY);
            for word in block.chunks_mut(4) {
                let value = self.registers.read32(regs::BUFFER_DATA_PORT);
                let mut bytes = [0u8; 4];
                LittleEndian::write_u32(&mut bytes, value);
                word.copy_from_slice(&bytes[..word.len()]);
            }
        }
        self.wait_for_status(host, InterruptBits::TRANSFER_COMPLETE, ResetFlags::DATA_LINE)?;
        self.acknowledge(InterruptBits::TRANSFER_COMPLETE);
        Ok(())
    }

    fn write_data(&self, host: &SdHost, command: &SdCommand) -> Result<(), Error> {
        let size = command.buffer_size as usize;
        ensure!(
            command.buffer.len() >= size,
            InvalidParameterSnafu {
                reason: "write buffer too small"
            }
        );
        let block_size = size.min(SD_BLOCK_SIZE as usize);
        for block in command.buffer[..size].chunks(block_size) {
            self.wait_for_status(host, InterruptBits::BUFFER_WRITE_READY, ResetFlags::DATA_LINE)?;
            self.acknowledge(InterruptBits::BUFFER_WRITE_READY);
            for word in block.chunks(4) {
                let mut bytes = [0u8; 4];
                bytes[..word.len()].copy_from_slice(word);
                self.registers
                    .write32(regs::BUFFER_DATA_PORT, LittleEndian::read_u32(&bytes));
            }
        }
        self.wait_for_status(host, InterruptBits::TRANSFER_COMPLETE, ResetFlags::DATA_LINE)?;
        self.acknowledge(InterruptBits::TRANSFER_COMPLETE);
        Ok(())
    }

    fn read_response(&self, host: &SdHost, command: &mut SdCommand) {
        if command.response_type.contains(ResponseType::LONG) {
            let mut response = [
                self.registers.read32(regs::RESPONSE76),
                self.registers.read32(regs::RESPONSE54),
                self.registers.read32(regs::RESPONSE32),
                self.registers.read32(regs::RESPONSE10),
            ];
            if host
                .host_capabilities()
                .contains(SdMode::RESPONSE136_SHIFTED)
            {
                for index in 0..3 {
                    response[index] = (response[index] << 8) | (response[index + 1] >> 24);
                }
                response[3] <<= 8;
            }
            command.response = response;
        } else if command.response_type.contains(ResponseType::PRESENT) {
            command.response[0] = self.registers.read32(regs::RESPONSE10);
        }
    }

    fn power_bits(voltages: Voltages) -> Result<u32, Error> {
        if voltages.intersects(Voltages::V32_33 | Voltages::V33_34) {
            Ok(regs::HOST_POWER_3V3)
        } else if voltages.intersects(Voltages::V29_30 | Voltages::V30_31) {
            Ok(regs::HOST_POWER_3V0)
        } else if voltages.contains(Voltages::V165_195) {
            Ok(regs::HOST_POWER_1V8)
        } else {
            InvalidConfigurationSnafu.fail()
        }
    }

    fn switch_signalling_to_1v8(&self, host: &SdHost) -> Result<(), Error> {
        ensure!(self.version() >= regs::VERSION_3, NotSupportedSnafu);
        self.registers
            .clear_bits32(regs::CLOCK_CONTROL, regs::CLOCK_SD_ENABLE);
        ensure!(
            !self.present_state().intersects(PresentState::DATA_LINE_LEVEL),
            DeviceIoSnafu {
                status: self.present_state().bits()
            }
        );
        self.registers
            .set_bits32(regs::CONTROL_STATUS2, regs::CONTROL2_SIGNALING_1V8);
        host.stall(VOLTAGE_SWITCH_DELAY_US);
        let control = self.registers.read32(regs::CONTROL_STATUS2);
        ensure!(
            control & regs::CONTROL2_SIGNALING_1V8 != 0,
            DeviceIoSnafu { status: control }
        );
        self.registers
            .set_bits32(regs::CLOCK_CONTROL, regs::CLOCK_SD_ENABLE);
        host.stall(CLOCK_RESTART_DELAY_US);
        let present = self.present_state();
        ensure!(
            present.contains(PresentState::DATA_LINE_LEVEL),
            DeviceIoSnafu {
                status: present.bits()
            }
        );
        Ok(())
    }

    /// Select the DMA mode the host supports best.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if the host has neither ADMA2 nor SDMA, or
    /// [`Error::InsufficientResources`] for ADMA2 without a descriptor table.
    pub fn initialize_dma(&self, host: &SdHost) -> Result<(), Error> {
        let modes = host.host_capabilities();
        if modes.contains(SdMode::ADMA2) {
            let table = self.dma_table.lock();
            let table = table.as_ref().ok_or(Error::InsufficientResources)?;
            self.registers.modify32(regs::HOST_CONTROL, |value| {
                (value & !regs::HOST_DMA_MODE_MASK) | regs::HOST_DMA_ADMA2_32
            });
            self.registers
                .write32(regs::ADMA_ADDRESS_LOW, table.physical_address());
            self.registers.write32(regs::ADMA_ADDRESS_HIGH, 0);
        } else if modes.contains(SdMode::SDMA) {
            self.registers.modify32(regs::HOST_CONTROL, |value| {
                (value & !regs::HOST_DMA_MODE_MASK) | regs::HOST_DMA_SDMA
            });
        } else {
            return NotSupportedSnafu.fail();
        }
        host.insert_flags(ControllerFlags::DMA_ENABLED | ControllerFlags::DMA_COMMAND_ENABLED);
        debug!("SD: DMA enabled, modes {modes:?}");
        Ok(())
    }

    /// Point the DMA engine at `size` bytes of `fragments`, starting `offset` bytes in. Returns
    /// the number of bytes the engine will move, which may be less than `size`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] for memory the engine cannot reach.
    pub fn prepare_dma(
        &self,
        host: &SdHost,
        fragments: &[DmaFragment],
        offset: u64,
        size: u32,
    ) -> Result<u32, Error> {
        let modes = host.host_capabilities();
        if modes.contains(SdMode::ADMA2) {
            let mut table = self.dma_table.lock();
            let table = table.as_mut().ok_or(Error::InsufficientResources)?;
            let described = table.build(fragments, offset, size)?;
            self.registers
                .write32(regs::ADMA_ADDRESS_LOW, table.physical_address());
            self.registers.write32(regs::ADMA_ADDRESS_HIGH, 0);
            return Ok(described - described % SD_BLOCK_SIZE);
        }
        ensure!(modes.contains(SdMode::SDMA), NotSupportedSnafu);

        let mut skip = offset;
        let fragment = fragments
            .iter()
            .find(|fragment| {
                if skip < u64::from(fragment.size) {
                    return true;
                }
                skip -= u64::from(fragment.size);
                false
            })
            .ok_or(Error::InvalidParameter {
                reason: "offset beyond fragments",
            })?;
        let address = fragment.physical_address + skip;
        let to_boundary = regs::SDMA_BOUNDARY - (address % regs::SDMA_BOUNDARY);
        let length = (u64::from(fragment.size) - skip)
            .min(to_boundary)
            .min(u64::from(size));
        let address = u32::try_from(address).map_err(|_| Error::InvalidParameter {
            reason: "DMA fragment above 4GB",
        })?;
        self.registers.write32(regs::SDMA_ADDRESS, address);
        // bounded by size above
        let length = length as u32;
        Ok(length - length % SD_BLOCK_SIZE)
    }

    /// Signal transfer completion and errors as interrupts while a DMA transfer runs.
    pub fn set_dma_interrupts(&self, host: &SdHost, enable: bool, size: u32) {
        let mut signal = SIGNAL_ENABLE_DEFAULT;
        if enable {
            signal |= InterruptBits::ERROR_MASK;
            signal |= if size == 0 {
                InterruptBits::COMMAND_COMPLETE
            } else {
                InterruptBits::TRANSFER_COMPLETE
            };
            host.insert_flags(ControllerFlags::DMA_INTERRUPTS_ENABLED);
        } else {
            host.remove_flags(ControllerFlags::DMA_INTERRUPTS_ENABLED);
        }
        self.signal_enable.store(signal.bits(), Ordering::Release);
        self.registers
            .write32(regs::INTERRUPT_SIGNAL_ENABLE, signal.bits());
    }

    /// Fast interrupt service: acknowledge and latch whatever enabled status is set.
    pub fn interrupt_service(&self) -> InterruptStatus {
        let enabled = InterruptBits::from_bits_retain(self.signal_enable.load(Ordering::Acquire));
        let status = self.status() & enabled;
        if status.is_empty() {
            return InterruptStatus::NotClaimed;
        }
        self.acknowledge(status);
        self.pending_status
            .fetch_or(status.bits(), Ordering::AcqRel);
        trace!("SD: interrupt {status:?}");
        InterruptStatus::Claimed
    }

    /// Take the status latched by [`Self::interrupt_service`].
    pub fn take_pending(&self) -> InterruptBits {
        InterruptBits::from_bits_retain(self.pending_status.swap(0, Ordering::AcqRel))
    }
}

impl SdFunctions for StandardHost {
    fn provides(&self) -> SdFunctionSet {
        SdFunctionSet::all()
    }

    fn initialize_controller(&self, host: &SdHost, phase: InitializePhase) -> Result<(), Error> {
        match phase {
            InitializePhase::Capabilities => {
                let version = (self.registers.read32(regs::SLOT_STATUS_VERSION)
                    >> regs::VERSION_SHIFT)
                    & regs::VERSION_MASK;
                self.version.store(version, Ordering::Relaxed);

                let capabilities = self.registers.read32(regs::CAPABILITIES);
                let mut modes = SdMode::FOUR_BIT | SdMode::AUTO_CMD12;
                for (bit, mode) in [
                    (regs::CAPABILITY_8BIT, SdMode::EIGHT_BIT),
                    (regs::CAPABILITY_ADMA2, SdMode::ADMA2),
                    (regs::CAPABILITY_HIGH_SPEED, SdMode::HIGH_SPEED),
                    (regs::CAPABILITY_SDMA, SdMode::SDMA),
                ] {
                    if capabilities & bit != 0 {
                        modes |= mode;
                    }
                }
                host.add_host_capabilities(modes);

                let mut voltages = Voltages::empty();
                if capabilities & regs::CAPABILITY_VOLTAGE_3V3 != 0 {
                    voltages |= Voltages::V32_33 | Voltages::V33_34;
                }
                if capabilities & regs::CAPABILITY_VOLTAGE_3V0 != 0 {
                    voltages |= Voltages::V29_30 | Voltages::V30_31;
                }
                if capabilities & regs::CAPABILITY_VOLTAGE_1V8 != 0 {
                    voltages |= Voltages::V165_195;
                }
                host.add_voltages(voltages);

                if host.fundamental_clock() == 0 {
                    let mask = if version >= regs::VERSION_3 {
                        regs::CAPABILITY_V3_BASE_CLOCK_MASK
                    } else {
                        regs::CAPABILITY_V2_BASE_CLOCK_MASK
                    };
                    let base = (capabilities >> regs::CAPABILITY_BASE_CLOCK_SHIFT) & mask;
                    ensure!(base != 0, InvalidConfigurationSnafu);
                    host.set_fundamental_clock(base * 1_000_000);
                }
                debug!(
                    "SD: host version {version}, capabilities {capabilities:#x}, modes {:?}",
                    host.host_capabilities()
                );
                Ok(())
            }
            InitializePhase::PowerOn => {
                let power = Self::power_bits(host.voltages())?;
                self.registers.modify32(regs::HOST_CONTROL, |value| {
                    (value & !regs::HOST_POWER_MASK) | power | regs::HOST_POWER_ENABLE
                });
                self.registers
                    .write32(regs::INTERRUPT_STATUS_ENABLE, STATUS_ENABLE_DEFAULT.bits());
                self.acknowledge(InterruptBits::all());
                self.signal_enable
                    .store(SIGNAL_ENABLE_DEFAULT.bits(), Ordering::Release);
                self.registers
                    .write32(regs::INTERRUPT_SIGNAL_ENABLE, SIGNAL_ENABLE_DEFAULT.bits());
                Ok(())
            }
        }
    }

    fn reset_controller(&self, host: &SdHost, flags: ResetFlags) -> Result<(), Error> {
        let mut bits = 0;
        if flags.contains(ResetFlags::ALL) {
            bits |= regs::CLOCK_RESET_ALL;
        }
        if flags.contains(ResetFlags::COMMAND_LINE) {
            bits |= regs::CLOCK_RESET_COMMAND;
        }
        if flags.contains(ResetFlags::DATA_LINE) {
            bits |= regs::CLOCK_RESET_DATA;
        }
        self.registers.set_bits32(regs::CLOCK_CONTROL, bits);
        host.wait_for(|| self.registers.read32(regs::CLOCK_CONTROL) & bits == 0)?;
        self.registers
            .write32(regs::INTERRUPT_STATUS_ENABLE, u32::MAX);
        self.acknowledge(InterruptBits::all());
        Ok(())
    }

    fn send_command(&self, host: &SdHost, command: &mut SdCommand) -> Result<(), Error> {
        let mut inhibit = PresentState::COMMAND_INHIBIT;
        if command.buffer_size != 0 || command.response_type.contains(ResponseType::BUSY) {
            inhibit |= PresentState::DATA_INHIBIT;
        }
        if host
            .wait_for(|| !self.present_state().intersects(inhibit))
            .is_err()
        {
            warn!("SD: CMD{} blocked by {:?}", command.index, self.present_state());
            self.reset_controller(host, ResetFlags::COMMAND_LINE)?;
            return Err(Error::Timeout);
        }

        let mut flags = u32::from(command.index) << regs::COMMAND_INDEX_SHIFT;
        if command.buffer_size != 0 {
            flags |= regs::COMMAND_DATA_PRESENT;
            let block_size = command.buffer_size.min(SD_BLOCK_SIZE);
            let block_count = command.buffer_size / block_size;
            self.registers.write32(
                regs::BLOCK_SIZE_COUNT,
                (block_count << regs::BLOCK_COUNT_SHIFT) | regs::SDMA_BOUNDARY_512K | block_size,
            );
            if block_count > 1 {
                flags |= regs::COMMAND_MULTIPLE_BLOCKS | regs::COMMAND_BLOCK_COUNT_ENABLE;
                if host.host_capabilities().contains(SdMode::AUTO_CMD12) {
                    flags |= regs::COMMAND_AUTO_CMD12;
                }
            }
            if !command.write {
                flags |= regs::COMMAND_TRANSFER_READ;
            }
            if command.dma && host.flags().contains(ControllerFlags::DMA_COMMAND_ENABLED) {
                flags |= regs::COMMAND_DMA_ENABLE;
            }
        }
        let response_type = command.response_type;
        if response_type.contains(ResponseType::PRESENT) {
            flags |= if response_type.contains(ResponseType::LONG) {
                regs::COMMAND_RESPONSE_136
            } else if response_type.contains(ResponseType::BUSY) {
                regs::COMMAND_RESPONSE_48_BUSY
            } else {
                regs::COMMAND_RESPONSE_48
            };
            if response_type.contains(ResponseType::CRC) {
                flags |= regs::COMMAND_CRC_CHECK;
            }
            if response_type.contains(ResponseType::OPCODE) {
                flags |= regs::COMMAND_INDEX_CHECK;
            }
        }

        self.acknowledge(InterruptBits::all());
        self.registers.write32(regs::ARGUMENT1, command.argument);
        self.registers.write32(regs::COMMAND, flags);
        if command.dma {
            return Ok(());
        }

        self.wait_for_status(host, InterruptBits::COMMAND_COMPLETE, ResetFlags::COMMAND_LINE)?;
        self.acknowledge(InterruptBits::COMMAND_COMPLETE);
        self.read_response(host, command);

        if command.buffer_size == 0 {
            if response_type.contains(ResponseType::BUSY) {
                self.wait_for_status(
                    host,
                    InterruptBits::TRANSFER_COMPLETE,
                    ResetFlags::DATA_LINE,
                )?;
                self.acknowledge(InterruptBits::TRANSFER_COMPLETE);
            }
            return Ok(());
        }
        if command.write {
            self.write_data(host, command)
        } else {
            self.read_data(host, command)
        }
    }

    fn bus_width(&self, _host: &SdHost) -> Result<u8, Error> {
        let control = self.registers.read32(regs::HOST_CONTROL);
        Ok(if control & regs::HOST_DATA_8BIT != 0 {
            8
        } else if control & regs::HOST_DATA_4BIT != 0 {
            4
        } else {
            1
        })
    }

    fn set_bus_width(&self, _host: &SdHost, width: u8) -> Result<(), Error> {
        let bits = match width {
            1 => 0,
            4 => regs::HOST_DATA_4BIT,
            8 => regs::HOST_DATA_8BIT,
            _ => {
                return InvalidParameterSnafu {
                    reason: "unsupported bus width",
                }
                .fail()
            }
        };
        self.registers.modify32(regs::HOST_CONTROL, |value| {
            (value & !(regs::HOST_DATA_4BIT | regs::HOST_DATA_8BIT)) | bits
        });
        Ok(())
    }

    fn clock_speed(&self, host: &SdHost) -> Result<u32, Error> {
        let control = self.registers.read32(regs::CLOCK_CONTROL);
        let mut divisor = (control >> 8) & 0xFF;
        if self.version() >= regs::VERSION_3 {
            divisor |= (control & 0xC0) << 2;
        }
        let fundamental = host.fundamental_clock();
        Ok(if divisor == 0 {
            fundamental
        } else {
            fundamental / (divisor * 2)
        })
    }

    fn set_clock_speed(&self, host: &SdHost, hz: u32) -> Result<(), Error> {
        let fundamental = host.fundamental_clock();
        ensure!(fundamental != 0, InvalidConfigurationSnafu);
        let divisor = clock_divisor(self.version(), fundamental, hz);
        let mut control = regs::CLOCK_TIMEOUT
            | ((divisor & 0xFF) << 8)
            | ((divisor & 0x300) >> 2);
        self.registers.write32(regs::CLOCK_CONTROL, regs::CLOCK_TIMEOUT);
        control |= regs::CLOCK_INTERNAL_ENABLE;
        self.registers.write32(regs::CLOCK_CONTROL, control);
        host.wait_for(|| self.registers.read32(regs::CLOCK_CONTROL) & regs::CLOCK_STABLE != 0)?;
        control |= regs::CLOCK_SD_ENABLE;
        self.registers.write32(regs::CLOCK_CONTROL, control);
        trace!("SD: clock {hz}Hz from {fundamental}Hz, divisor {divisor}");
        Ok(())
    }

    fn voltage(&self, _host: &SdHost) -> Result<SdVoltage, Error> {
        if self.registers.read32(regs::CONTROL_STATUS2) & regs::CONTROL2_SIGNALING_1V8 != 0 {
            return Ok(SdVoltage::V1_8);
        }
        let control = self.registers.read32(regs::HOST_CONTROL);
        Ok(if control & regs::HOST_POWER_ENABLE == 0 {
            SdVoltage::Off
        } else if control & regs::HOST_POWER_MASK == regs::HOST_POWER_3V0 {
            SdVoltage::V3_0
        } else {
            SdVoltage::V3_3
        })
    }

    fn set_voltage(&self, host: &SdHost, voltage: SdVoltage) -> Result<(), Error> {
        let power = match voltage {
            SdVoltage::Off => {
                self.registers
                    .clear_bits32(regs::HOST_CONTROL, regs::HOST_POWER_ENABLE);
                return Ok(());
            }
            SdVoltage::V1_8 => return self.switch_signalling_to_1v8(host),
            SdVoltage::V3_0 => regs::HOST_POWER_3V0,
            SdVoltage::V3_3 => regs::HOST_POWER_3V3,
        };
        if self.version() >= regs::VERSION_3 {
            self.registers
                .clear_bits32(regs::CONTROL_STATUS2, regs::CONTROL2_SIGNALING_1V8);
        }
        self.registers.modify32(regs::HOST_CONTROL, |value| {
            (value & !regs::HOST_POWER_MASK) | power | regs::HOST_POWER_ENABLE
        });
        Ok(())
    }

    fn stop_data_transfer(&self, host: &SdHost) -> Result<(), Error> {
        self.registers
            .set_bits32(regs::HOST_CONTROL, regs::HOST_STOP_AT_BLOCK_GAP);
        let stopped = host.wait_for(|| self.status().contains(InterruptBits::TRANSFER_COMPLETE));
        self.acknowledge(InterruptBits::TRANSFER_COMPLETE);
        self.registers
            .clear_bits32(regs::HOST_CONTROL, regs::HOST_STOP_AT_BLOCK_GAP);
        stopped
    }

    fn card_detect(&self, _host: &SdHost) -> Result<bool, Error> {
        Ok(self.present_state().contains(PresentState::CARD_INSERTED))
    }

    fn write_protect(&self, _host: &SdHost) -> Result<bool, Error> {
        Ok(!self.present_state().contains(PresentState::WRITE_ENABLED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{registers::fake::FakeRegisters, time::fake::StepClock};
    use std::{sync::Arc, vec::Vec};
    use test_case::test_case;

    fn setup(modes: SdMode) -> (Arc<FakeRegisters>, StandardHost, SdHost) {
        let registers = Arc::new(FakeRegisters::new());
        let standard = StandardHost::new(registers.clone(), Some(DescriptorTable::new(0x8000, 4)));
        let host = SdHost::new(Arc::new(StepClock::new()), modes, Voltages::empty(), 0);
        host.insert_flags(ControllerFlags::CRITICAL_MODE);
        (registers, standard, host)
    }

    fn version3(registers: &FakeRegisters, standard: &StandardHost, host: &SdHost) {
        registers.set(regs::SLOT_STATUS_VERSION, regs::VERSION_3 << regs::VERSION_SHIFT);
        registers.set(
            regs::CAPABILITIES,
            (100 << regs::CAPABILITY_BASE_CLOCK_SHIFT)
                | regs::CAPABILITY_ADMA2
                | regs::CAPABILITY_HIGH_SPEED
                | regs::CAPABILITY_VOLTAGE_3V3,
        );
        standard
            .initialize_controller(host, InitializePhase::Capabilities)
            .unwrap();
    }

    #[test_case(0, 100_000_000, 400_000 => 128; "v2 identification")]
    #[test_case(1, 100_000_000, 25_000_000 => 2; "v2 default speed")]
    #[test_case(1, 50_000_000, 50_000_000 => 0; "v2 undivided")]
    #[test_case(2, 100_000_000, 400_000 => 125; "v3 identification")]
    #[test_case(2, 100_000_000, 200_000_000 => 0; "v3 faster than base")]
    #[test_case(2, 100_000_000, 25_000_000 => 2; "v3 default speed")]
    #[test_case(2, 100_000_000, 30_000_000 => 2; "v3 rounds down the clock")]
    fn divisor(version: u32, fundamental: u32, target: u32) -> u32 {
        clock_divisor(version, fundamental, target)
    }

    #[test]
    fn capabilities_phase_reads_host_modes() {
        let (registers, standard, host) = setup(SdMode::empty());
        version3(&registers, &standard, &host);
        assert_eq!(host.fundamental_clock(), 100_000_000);
        assert_eq!(
            host.host_capabilities(),
            SdMode::FOUR_BIT | SdMode::AUTO_CMD12 | SdMode::ADMA2 | SdMode::HIGH_SPEED
        );
        assert_eq!(host.voltages(), Voltages::V32_33 | Voltages::V33_34);
        assert!(registers.writes().is_empty());
    }

    #[test]
    fn zero_base_clock_is_a_configuration_error() {
        let (_registers, standard, host) = setup(SdMode::empty());
        assert_eq!(
            standard.initialize_controller(&host, InitializePhase::Capabilities),
            Err(Error::InvalidConfiguration)
        );
    }

    #[test]
    fn clock_change_waits_for_stable_clock() {
        let (registers, standard, host) = setup(SdMode::empty());
        version3(&registers, &standard, &host);
        registers.script(regs::CLOCK_CONTROL, &[0xE0201, 0xE0203]);
        standard.set_clock_speed(&host, 25_000_000).unwrap();
        assert_eq!(
            registers.writes_to(regs::CLOCK_CONTROL),
            [0xE0000, 0xE0201, 0xE0205]
        );
        assert_eq!(standard.clock_speed(&host).unwrap(), 25_000_000);
    }

    #[test]
    fn long_response_shift_quirk() {
        let (registers, standard, host) = setup(SdMode::RESPONSE136_SHIFTED);
        registers.hold(regs::INTERRUPT_STATUS, InterruptBits::COMMAND_COMPLETE.bits());
        registers.set(regs::RESPONSE76, 0x0011_2233);
        registers.set(regs::RESPONSE54, 0x4455_6677);
        registers.set(regs::RESPONSE32, 0x8899_AABB);
        registers.set(regs::RESPONSE10, 0xCCDD_EEFF);
        let mut command = SdCommand::new(9, ResponseType::R2, 0x1234_0000);
        standard.send_command(&host, &mut command).unwrap();
        assert_eq!(
            command.response,
            [0x1122_3344, 0x5566_7788, 0x99AA_BBCC, 0xDDEE_FF00]
        );
        let written = registers.writes_to(regs::COMMAND);
        assert_eq!(
            written,
            [(9 << 24) | regs::COMMAND_RESPONSE_136 | regs::COMMAND_CRC_CHECK]
        );
        assert_eq!(registers.writes_to(regs::ARGUMENT1), [0x1234_0000]);
    }

    #[test]
    fn command_timeout_resets_command_line() {
        let (registers, standard, host) = setup(SdMode::empty());
        registers.hold(
            regs::INTERRUPT_STATUS,
            (InterruptBits::ERROR_INTERRUPT | InterruptBits::COMMAND_TIMEOUT).bits(),
        );
        registers.hold(regs::CLOCK_CONTROL, 0);
        let mut command = SdCommand::new(8, ResponseType::R7, 0x1AA);
        assert_eq!(standard.send_command(&host, &mut command), Err(Error::Timeout));
        assert!(registers
            .writes_to(regs::CLOCK_CONTROL)
            .iter()
            .any(|value| value & regs::CLOCK_RESET_COMMAND != 0));
    }

    #[test]
    fn crc_error_is_device_error() {
        let (registers, standard, host) = setup(SdMode::empty());
        let status = InterruptBits::ERROR_INTERRUPT | InterruptBits::COMMAND_CRC;
        registers.hold(regs::INTERRUPT_STATUS, status.bits());
        registers.hold(regs::CLOCK_CONTROL, 0);
        let mut command = SdCommand::new(13, ResponseType::R1, 0);
        assert_eq!(
            standard.send_command(&host, &mut command),
            Err(Error::DeviceIoError {
                status: status.bits()
            })
        );
    }

    #[test]
    fn signalling_switch_refused_while_data_lines_driven() {
        let (registers, standard, host) = setup(SdMode::empty());
        version3(&registers, &standard, &host);
        let driven = PresentState::DATA_LINE_LEVEL.bits();
        registers.hold(regs::PRESENT_STATE, driven);
        assert_eq!(
            standard.set_voltage(&host, SdVoltage::V1_8),
            Err(Error::DeviceIoError { status: driven })
        );
        assert!(registers.writes_to(regs::CONTROL_STATUS2).is_empty());
    }

    #[test]
    fn stop_without_busy_ignores_data_inhibit() {
        let (registers, standard, host) = setup(SdMode::empty());
        registers.hold(regs::PRESENT_STATE, PresentState::DATA_INHIBIT.bits());
        registers.hold(
            regs::INTERRUPT_STATUS,
            (InterruptBits::COMMAND_COMPLETE | InterruptBits::TRANSFER_COMPLETE).bits(),
        );
        registers.hold(regs::CLOCK_CONTROL, 0);

        let mut stop = SdCommand::new(12, ResponseType::R1, 0);
        standard.send_command(&host, &mut stop).unwrap();

        let mut stop_busy = SdCommand::new(12, ResponseType::R1B, 0);
        assert_eq!(
            standard.send_command(&host, &mut stop_busy),
            Err(Error::Timeout)
        );
        assert_eq!(registers.writes_to(regs::COMMAND).len(), 1);
    }

    #[test]
    fn polled_read_of_configuration_register() {
        let (registers, standard, host) = setup(SdMode::empty());
        registers.hold(
            regs::INTERRUPT_STATUS,
            (InterruptBits::COMMAND_COMPLETE
                | InterruptBits::BUFFER_READ_READY
                | InterruptBits::TRANSFER_COMPLETE)
                .bits(),
        );
        registers.script(regs::BUFFER_DATA_PORT, &[0x0000_0502, 0]);
        let mut command = SdCommand::new(51, ResponseType::R1, 0).with_read(8);
        standard.send_command(&host, &mut command).unwrap();

        assert_eq!(command.buffer, [0x02, 0x05, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            registers.writes_to(regs::BLOCK_SIZE_COUNT),
            [(1 << 16) | regs::SDMA_BOUNDARY_512K | 8]
        );
        assert_eq!(
            registers.writes_to(regs::COMMAND),
            [(51 << 24)
                | regs::COMMAND_DATA_PRESENT
                | regs::COMMAND_TRANSFER_READ
                | regs::COMMAND_RESPONSE_48
                | regs::COMMAND_CRC_CHECK
                | regs::COMMAND_INDEX_CHECK]
        );
        assert_eq!(registers.reads_of(regs::BUFFER_DATA_PORT), 2);
    }

    #[test]
    fn polled_multiple_block_write_uses_auto_stop() {
        let (registers, standard, host) = setup(SdMode::AUTO_CMD12);
        registers.hold(
            regs::INTERRUPT_STATUS,
            (InterruptBits::COMMAND_COMPLETE
                | InterruptBits::BUFFER_WRITE_READY
                | InterruptBits::TRANSFER_COMPLETE)
                .bits(),
        );
        let data: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        let mut command = SdCommand::new(25, ResponseType::R1, 0).with_write(data);
        standard.send_command(&host, &mut command).unwrap();

        let words = registers.writes_to(regs::BUFFER_DATA_PORT);
        assert_eq!(words.len(), 256);
        assert_eq!(words[0], 0x0302_0100);
        let flags = registers.writes_to(regs::COMMAND)[0];
        assert_ne!(flags & regs::COMMAND_MULTIPLE_BLOCKS, 0);
        assert_ne!(flags & regs::COMMAND_AUTO_CMD12, 0);
        assert_eq!(flags & regs::COMMAND_TRANSFER_READ, 0);
        assert_eq!(flags & regs::COMMAND_DMA_ENABLE, 0);
    }

    #[test]
    fn interrupt_service_latches_enabled_bits_only() {
        let (registers, standard, host) = setup(SdMode::empty());
        standard.set_dma_interrupts(&host, true, 0x1000);
        registers.set(
            regs::INTERRUPT_STATUS,
            (InterruptBits::TRANSFER_COMPLETE | InterruptBits::BUFFER_READ_READY).bits(),
        );
        assert_eq!(standard.interrupt_service(), InterruptStatus::Claimed);
        assert_eq!(
            registers.writes_to(regs::INTERRUPT_STATUS),
            [InterruptBits::TRANSFER_COMPLETE.bits()]
        );
        assert_eq!(standard.take_pending(), InterruptBits::TRANSFER_COMPLETE);
        assert_eq!(standard.take_pending(), InterruptBits::empty());

        registers.set(regs::INTERRUPT_STATUS, InterruptBits::BUFFER_READ_READY.bits());
        assert_eq!(standard.interrupt_service(), InterruptStatus::NotClaimed);
        assert!(host.flags().contains(ControllerFlags::DMA_INTERRUPTS_ENABLED));
    }

    #[test]
    fn adma2_initialization_programs_table_address() {
        let (registers, standard, host) = setup(SdMode::ADMA2);
        registers.set(regs::HOST_CONTROL, regs::HOST_DATA_4BIT | (3 << 3));
        standard.initialize_dma(&host).unwrap();
        assert_eq!(
            registers.get(regs::HOST_CONTROL),
            regs::HOST_DATA_4BIT | regs::HOST_DMA_ADMA2_32
        );
        assert_eq!(registers.get(regs::ADMA_ADDRESS_LOW), 0x8000);
        assert!(host
            .flags()
            .contains(ControllerFlags::DMA_ENABLED | ControllerFlags::DMA_COMMAND_ENABLED));
    }

    #[test]
    fn adma2_without_table_is_refused() {
        let registers = Arc::new(FakeRegisters::new());
        let standard = StandardHost::new(registers, None);
        let host = SdHost::new(Arc::new(StepClock::new()), SdMode::ADMA2, Voltages::empty(), 0);
        assert_eq!(
            standard.initialize_dma(&host),
            Err(Error::InsufficientResources)
        );
        assert!(!host.flags().contains(ControllerFlags::DMA_ENABLED));
    }

    #[test]
    fn dma_needs_a_dma_capable_host() {
        let (_registers, standard, host) = setup(SdMode::empty());
        assert_eq!(standard.initialize_dma(&host), Err(Error::NotSupported));
    }

    #[test]
    fn sdma_stops_at_buffer_boundary() {
        let (registers, standard, host) = setup(SdMode::SDMA);
        let fragments = [DmaFragment {
            physical_address: 0x7_F000,
            size: 0x4000,
        }];
        assert_eq!(
            standard.prepare_dma(&host, &fragments, 0x200, 0x4000).unwrap(),
            0xE00
        );
        assert_eq!(registers.writes_to(regs::SDMA_ADDRESS), [0x7_F200]);
    }

    #[test]
    fn power_on_enables_interrupt_status() {
        let (registers, standard, host) = setup(SdMode::empty());
        host.add_voltages(Voltages::V29_30 | Voltages::V30_31);
        standard
            .initialize_controller(&host, InitializePhase::PowerOn)
            .unwrap();
        assert_eq!(
            registers.get(regs::HOST_CONTROL),
            regs::HOST_POWER_3V0 | regs::HOST_POWER_ENABLE
        );
        assert_eq!(
            registers.get(regs::INTERRUPT_STATUS_ENABLE),
            STATUS_ENABLE_DEFAULT.bits()
        );
        assert_eq!(
            registers.get(regs::INTERRUPT_SIGNAL_ENABLE),
            SIGNAL_ENABLE_DEFAULT.bits()
        );
        assert_eq!(standard.voltage(&host).unwrap(), SdVoltage::V3_0);
    }

    #[test]
    fn card_detect_and_write_protect_follow_present_state() {
        let (registers, standard, host) = setup(SdMode::empty());
        assert!(!standard.card_detect(&host).unwrap());
        assert!(standard.write_protect(&host).unwrap());
        registers.set(
            regs::PRESENT_STATE,
            (PresentState::CARD_INSERTED | PresentState::WRITE_ENABLED).bits(),
        );
        assert!(standard.card_detect(&host).unwrap());
        assert!(!standard.write_protect(&host).unwrap());
    }

    #[test]
    fn bus_width_round_trip() {
        let (_registers, standard, host) = setup(SdMode::empty());
        standard.set_bus_width(&host, 4).unwrap();
        assert_eq!(standard.bus_width(&host).unwrap(), 4);
        standard.set_bus_width(&host, 8).unwrap();
        assert_eq!(standard.bus_width(&host).unwrap(), 8);
        assert!(matches!(
            standard.set_bus_width(&host, 2),
            Err(Error::InvalidParameter { .. })
        ));
    }
}
