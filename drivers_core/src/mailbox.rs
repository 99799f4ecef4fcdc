//! BCM2709 VideoCore mailbox and its property channel.
//!
//! Firmware services such as clock rates and device power are requested by handing the
//! VideoCore a [`PropertyMessage`] through the mailbox. The message is a little endian buffer:
//!
//! ```text
//! total size | request code | tag... | end tag | padding to 16 bytes
//! tag = id | value buffer size | request/response length | value buffer
//! ```
//!
//! The firmware overwrites the request code with a status and sets the high bit of each tag's
//! length word when it answers that tag.

use alloc::{sync::Arc, vec, vec::Vec};

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use snafu::{ensure, OptionExt, Snafu};

use crate::{
    registers::RegisterAccess,
    time::{ticks_for_milliseconds, TimeSource},
};

#[allow(unused, missing_docs)]
mod regs {
    pub const READ: usize = 0x00;
    pub const STATUS: usize = 0x18;
    pub const WRITE: usize = 0x20;

    pub const STATUS_READ_EMPTY: u32 = 0x4000_0000;
    pub const STATUS_WRITE_FULL: u32 = 0x8000_0000;

    pub const CHANNEL_MASK: u32 = 0xF;
}

/// Channel carrying property messages.
pub const PROPERTIES_CHANNEL: u32 = 8;

/// Required alignment of every buffer handed to the mailbox.
pub const DATA_ALIGNMENT: usize = 16;

const REQUEST: u32 = 0;
const STATUS_SUCCESS: u32 = 0x8000_0000;
const TAG_LENGTH_RESPONSE: u32 = 0x8000_0000;
const END_TAG: u32 = 0;
const HEADER_SIZE: usize = 8;
const TAG_HEADER_SIZE: usize = 12;
const MAILBOX_TIMEOUT_MS: u64 = 100;

/// Property tag identifiers.
#[allow(missing_docs)]
pub mod tag {
    pub const GET_BOARD_MODEL: u32 = 0x0001_0001;
    pub const GET_BOARD_REVISION: u32 = 0x0001_0002;
    pub const GET_BOARD_SERIAL: u32 = 0x0001_0004;
    pub const GET_ARM_CORE_MEMORY: u32 = 0x0001_0005;
    pub const GET_VIDEO_CORE_MEMORY: u32 = 0x0001_0006;
    pub const SET_POWER_STATE: u32 = 0x0002_8001;
    pub const GET_CLOCK_STATE: u32 = 0x0003_0001;
    pub const SET_CLOCK_STATE: u32 = 0x0003_8001;
    pub const GET_CLOCK_RATE: u32 = 0x0003_0002;
    pub const SET_CLOCK_RATE: u32 = 0x0003_8002;
    pub const GET_CLOCK_MAX_RATE: u32 = 0x0003_0004;
    pub const GET_CLOCK_MIN_RATE: u32 = 0x0003_0007;
}

/// Devices for [`tag::SET_POWER_STATE`].
#[allow(missing_docs)]
pub mod device {
    pub const SDHCI: u32 = 0;
    pub const USB: u32 = 3;

    pub const POWER_STATE_ON: u32 = 3;
}

/// Clocks for the clock tags.
#[allow(missing_docs)]
pub mod clock {
    pub const EMMC: u32 = 1;
    pub const UART: u32 = 2;
    pub const ARM: u32 = 3;
    pub const VIDEO: u32 = 4;
    pub const V3D: u32 = 5;
    pub const H264: u32 = 6;
    pub const ISP: u32 = 7;
    pub const SDRAM: u32 = 8;
    pub const PIXEL: u32 = 9;
    pub const PWM: u32 = 10;
}

/// Mailbox errors.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The firmware did not answer the message or tag.
    #[snafu(display("firmware did not answer (code {code:#x})"))]
    InvalidResponse {
        /// The status or length word found.
        code: u32,
    },
    /// A tag was answered with a different amount of data than expected.
    #[snafu(display("tag {tag:#x} answered {actual} bytes, expected {expected}"))]
    LengthMismatch {
        /// The tag.
        tag: u32,
        /// Bytes the caller expected.
        expected: u32,
        /// Bytes the firmware returned.
        actual: u32,
    },
    /// The tag is not part of this message.
    #[snafu(display("tag {tag:#x} not in message"))]
    UnknownTag {
        /// The tag.
        tag: u32,
    },
    /// The buffer address cannot be sent through the mailbox.
    #[snafu(display("mailbox data {data:#x} is not aligned"))]
    Misaligned {
        /// The address.
        data: u32,
    },
    /// The mailbox did not become ready in time.
    Timeout,
}

#[derive(Debug, Copy, Clone)]
struct TagSlot {
    id: u32,
    offset: usize,
    response_size: u32,
}

/// A property channel message under construction or holding the firmware's answer.
#[derive(Debug, Clone)]
pub struct PropertyMessage {
    buffer: Vec<u8>,
    tags: Vec<TagSlot>,
}

impl Default for PropertyMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyMessage {
    /// An empty request.
    #[must_use]
    pub fn new() -> Self {
        let mut message = Self {
            buffer: Vec::new(),
            tags: Vec::new(),
        };
        message.seal(HEADER_SIZE);
        message
    }

    /// Append a tag carrying `request` and expecting `response_words` words back.
    #[must_use]
    pub fn with_tag(mut self, id: u32, request: &[u32], response_words: usize) -> Self {
        let end = self.tags.last().map_or(HEADER_SIZE, |slot| {
            slot.offset + TAG_HEADER_SIZE + LittleEndian::read_u32(&self.buffer[slot.offset + 4..]) as usize
        });
        let value_size = request.len().max(response_words) * 4;
        self.buffer.truncate(end);
        self.buffer.resize(end + TAG_HEADER_SIZE + value_size, 0);
        let words = &mut self.buffer[end..];
        LittleEndian::write_u32(&mut words[0..], id);
        // sizes are a few words
        LittleEndian::write_u32(&mut words[4..], value_size as u32);
        LittleEndian::write_u32(&mut words[8..], (request.len() * 4) as u32);
        LittleEndian::write_u32_into(
            request,
            &mut words[TAG_HEADER_SIZE..TAG_HEADER_SIZE + request.len() * 4],
        );
        self.tags.push(TagSlot {
            id,
            offset: end,
            response_size: (response_words * 4) as u32,
        });
        self.seal(end + TAG_HEADER_SIZE + value_size);
        self
    }

    /// Terminate the tag list at `end`, pad, and record the total size.
    fn seal(&mut self, end: usize) {
        let total = (end + 4).next_multiple_of(DATA_ALIGNMENT);
        self.buffer.truncate(end);
        self.buffer.resize(total, 0);
        LittleEndian::write_u32(&mut self.buffer[end..], END_TAG);
        LittleEndian::write_u32(&mut self.buffer[0..], total as u32);
        LittleEndian::write_u32(&mut self.buffer[4..], REQUEST);
    }

    /// The message exactly as the firmware reads it.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// The message buffer, for copying the firmware's answer back in.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// The answer to tag `id`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidResponse`] if the firmware did not answer the message or the tag,
    /// [`Error::LengthMismatch`] if the answer has the wrong size, or [`Error::UnknownTag`].
    pub fn response(&self, id: u32) -> Result<Vec<u32>, Error> {
        let code = LittleEndian::read_u32(&self.buffer[4..]);
        ensure!(code == STATUS_SUCCESS, InvalidResponseSnafu { code });
        let slot = self
            .tags
            .iter()
            .find(|slot| slot.id == id)
            .context(UnknownTagSnafu { tag: id })?;
        let length = LittleEndian::read_u32(&self.buffer[slot.offset + 8..]);
        ensure!(
            length & TAG_LENGTH_RESPONSE != 0,
            InvalidResponseSnafu { code: length }
        );
        let actual = length & !TAG_LENGTH_RESPONSE;
        ensure!(
            actual == slot.response_size,
            LengthMismatchSnafu {
                tag: id,
                expected: slot.response_size,
                actual
            }
        );
        let start = slot.offset + TAG_HEADER_SIZE;
        let mut values = vec![0u32; actual as usize / 4];
        LittleEndian::read_u32_into(&self.buffer[start..start + actual as usize], &mut values);
        Ok(values)
    }
}

/// The mailbox register block.
pub struct Mailbox<R> {
    registers: R,
    time: Arc<dyn TimeSource + Send + Sync>,
}

impl<R: RegisterAccess> Mailbox<R> {
    /// Wrap the mailbox registers.
    pub fn new(registers: R, time: Arc<dyn TimeSource + Send + Sync>) -> Self {
        Self { registers, time }
    }

    /// Send `data` on `channel` and wait for the reply on the same channel. Replies for other
    /// channels are discarded.
    ///
    /// # Errors
    /// Returns [`Error::Misaligned`] if `data` uses the channel bits, or [`Error::Timeout`].
    pub fn call(&self, channel: u32, data: u32) -> Result<u32, Error> {
        ensure!(data & regs::CHANNEL_MASK == 0, MisalignedSnafu { data });
        // Runs before the clock interrupt exists, so poll the hardware counter.
        let deadline = self
            .time
            .query_counter()
            .saturating_add(ticks_for_milliseconds(self.time.frequency(), MAILBOX_TIMEOUT_MS));
        while self.registers.read32(regs::STATUS) & regs::STATUS_WRITE_FULL != 0 {
            ensure!(self.time.query_counter() <= deadline, TimeoutSnafu);
        }
        self.registers
            .write32(regs::WRITE, data | (channel & regs::CHANNEL_MASK));
        loop {
            while self.registers.read32(regs::STATUS) & regs::STATUS_READ_EMPTY != 0 {
                ensure!(self.time.query_counter() <= deadline, TimeoutSnafu);
            }
            let value = self.registers.read32(regs::READ);
            if value & regs::CHANNEL_MASK == channel {
                return Ok(value & !regs::CHANNEL_MASK);
            }
            trace!("mailbox: dropping reply {value:#x} for another channel");
        }
    }

    /// Hand `message`, already copied to `physical_address`, to the property channel.
    ///
    /// # Errors
    /// See [`Self::call`].
    pub fn send_properties(&self, physical_address: u32) -> Result<(), Error> {
        self.call(PROPERTIES_CHANNEL, physical_address).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{registers::fake::FakeRegisters, time::fake::StepClock};

    fn answer(message: &mut PropertyMessage, tag_offset: usize, values: &[u32]) {
        let bytes = message.as_bytes_mut();
        LittleEndian::write_u32(&mut bytes[4..], STATUS_SUCCESS);
        LittleEndian::write_u32(
            &mut bytes[tag_offset + 8..],
            TAG_LENGTH_RESPONSE | (values.len() * 4) as u32,
        );
        LittleEndian::write_u32_into(
            values,
            &mut bytes[tag_offset + TAG_HEADER_SIZE..tag_offset + TAG_HEADER_SIZE + values.len() * 4],
        );
    }

    #[test]
    fn clock_rate_request_layout() {
        let message = PropertyMessage::new().with_tag(tag::GET_CLOCK_RATE, &[clock::EMMC], 2);
        let mut words = [0u32; 8];
        LittleEndian::read_u32_into(message.as_bytes(), &mut words);
        assert_eq!(
            words,
            [32, REQUEST, tag::GET_CLOCK_RATE, 8, 4, clock::EMMC, 0, END_TAG]
        );
    }

    #[test]
    fn tags_follow_each_other() {
        let message = PropertyMessage::new()
            .with_tag(tag::SET_POWER_STATE, &[device::SDHCI, device::POWER_STATE_ON], 2)
            .with_tag(tag::GET_BOARD_REVISION, &[], 1);
        let bytes = message.as_bytes();
        assert_eq!(bytes.len() % DATA_ALIGNMENT, 0);
        assert_eq!(LittleEndian::read_u32(&bytes[0..]) as usize, bytes.len());
        assert_eq!(LittleEndian::read_u32(&bytes[28..]), tag::GET_BOARD_REVISION);
        assert_eq!(LittleEndian::read_u32(&bytes[32..]), 4);
        assert_eq!(LittleEndian::read_u32(&bytes[36..]), 0);
        assert_eq!(LittleEndian::read_u32(&bytes[44..]), END_TAG);
    }

    #[test]
    fn answered_tag_is_decoded() {
        let mut message = PropertyMessage::new().with_tag(tag::GET_CLOCK_RATE, &[clock::EMMC], 2);
        answer(&mut message, HEADER_SIZE, &[clock::EMMC, 250_000_000]);
        assert_eq!(
            message.response(tag::GET_CLOCK_RATE).unwrap(),
            [clock::EMMC, 250_000_000]
        );
        assert_eq!(
            message.response(tag::GET_BOARD_MODEL),
            Err(Error::UnknownTag {
                tag: tag::GET_BOARD_MODEL
            })
        );
    }

    #[test]
    fn unanswered_message_is_rejected() {
        let message = PropertyMessage::new().with_tag(tag::GET_CLOCK_RATE, &[clock::EMMC], 2);
        assert_eq!(
            message.response(tag::GET_CLOCK_RATE),
            Err(Error::InvalidResponse { code: REQUEST })
        );
    }

    #[test]
    fn unanswered_tag_is_rejected() {
        let mut message = PropertyMessage::new().with_tag(tag::GET_CLOCK_RATE, &[clock::EMMC], 2);
        LittleEndian::write_u32(&mut message.as_bytes_mut()[4..], STATUS_SUCCESS);
        assert_eq!(
            message.response(tag::GET_CLOCK_RATE),
            Err(Error::InvalidResponse { code: 4 })
        );
    }

    #[test]
    fn short_answer_is_rejected() {
        let mut message = PropertyMessage::new().with_tag(tag::GET_CLOCK_RATE, &[clock::EMMC], 2);
        answer(&mut message, HEADER_SIZE, &[clock::EMMC]);
        assert_eq!(
            message.response(tag::GET_CLOCK_RATE),
            Err(Error::LengthMismatch {
                tag: tag::GET_CLOCK_RATE,
                expected: 8,
                actual: 4
            })
        );
    }

    #[test]
    fn call_waits_for_its_channel() {
        let registers = FakeRegisters::new();
        registers.script(
            regs::STATUS,
            &[regs::STATUS_WRITE_FULL, 0, regs::STATUS_READ_EMPTY, 0, 0],
        );
        registers.script(regs::READ, &[0x5000_0001, 0x1000_0008]);
        let mailbox = Mailbox::new(&registers, Arc::new(StepClock::new()));
        assert_eq!(mailbox.call(PROPERTIES_CHANNEL, 0x1000_0000), Ok(0x1000_0000));
        assert_eq!(registers.writes_to(regs::WRITE), [0x1000_0008]);
        assert_eq!(registers.reads_of(regs::READ), 2);
    }

    #[test]
    fn call_times_out_when_full() {
        let registers = FakeRegisters::new();
        registers.hold(regs::STATUS, regs::STATUS_WRITE_FULL);
        let mailbox = Mailbox::new(&registers, Arc::new(StepClock::new()));
        assert_eq!(mailbox.send_properties(0x2000), Err(Error::Timeout));
        assert!(registers.writes_to(regs::WRITE).is_empty());
    }

    #[test]
    fn misaligned_data_is_rejected() {
        let registers = FakeRegisters::new();
        let mailbox = Mailbox::new(&registers, Arc::new(StepClock::new()));
        assert_eq!(
            mailbox.call(PROPERTIES_CHANNEL, 0x1004),
            Err(Error::Misaligned { data: 0x1004 })
        );
    }
}
