//! ADMA2 scatter-gather descriptor tables.
//!
//! Each descriptor moves at most [`MAX_TRANSFER_SIZE`] bytes from one physically contiguous run.
//! The controller walks the table until it finds a descriptor flagged [`attribute::END`].

use alloc::{boxed::Box, vec};

use bytemuck::{Pod, Zeroable};
use snafu::ensure;

use super::{Error, InvalidParameterSnafu};

/// Largest transfer a single descriptor describes. The length field is 16 bits, and a round
/// number of blocks keeps every descriptor block aligned.
pub const MAX_TRANSFER_SIZE: u32 = 0xF000;

/// Descriptor attribute bits.
#[allow(unused, missing_docs)]
pub mod attribute {
    pub const VALID: u32 = 1 << 0;
    pub const END: u32 = 1 << 1;
    pub const INTERRUPT: u32 = 1 << 2;
    pub const ACTION_NOP: u32 = 0 << 4;
    pub const ACTION_TRANSFER: u32 = 2 << 4;
    pub const ACTION_LINK: u32 = 3 << 4;
    pub const LENGTH_SHIFT: u32 = 16;
}

/// One 32-bit ADMA2 descriptor, as the controller reads it from memory.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct Descriptor {
    /// Attribute bits and the transfer length.
    pub attributes: u32,
    /// Physical address of the data.
    pub address: u32,
}

impl Descriptor {
    /// A valid transfer descriptor. A length of [`MAX_TRANSFER_SIZE`] or less is expected.
    #[must_use]
    pub fn transfer(address: u32, length: u32) -> Self {
        Self {
            attributes: attribute::VALID
                | attribute::ACTION_TRANSFER
                | (length << attribute::LENGTH_SHIFT),
            address,
        }
    }

    /// The number of bytes this descriptor moves.
    #[must_use]
    pub fn length(&self) -> u32 {
        self.attributes >> attribute::LENGTH_SHIFT
    }
}

/// One physically contiguous piece of an I/O buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaFragment {
    /// Physical address of the first byte.
    pub physical_address: u64,
    /// Length in bytes.
    pub size: u32,
}

/// A descriptor table in memory visible to the controller.
#[derive(Debug)]
pub struct DescriptorTable {
    entries: Box<[Descriptor]>,
    physical_address: u32,
}

impl DescriptorTable {
    /// Descriptors allocated when the caller does not say otherwise.
    pub const DEFAULT_COUNT: usize = 256;

    /// Wrap `count` descriptors located at `physical_address`.
    #[must_use]
    pub fn new(physical_address: u32, count: usize) -> Self {
        Self {
            entries: vec![Descriptor::default(); count].into_boxed_slice(),
            physical_address,
        }
    }

    /// Physical address programmed into the ADMA address register.
    #[must_use]
    pub fn physical_address(&self) -> u32 {
        self.physical_address
    }

    /// The table contents.
    #[must_use]
    pub fn entries(&self) -> &[Descriptor] {
        &self.entries
    }

    /// The table exactly as the controller will read it.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.entries)
    }

    /// Zero every descriptor.
    pub fn clear(&mut self) {
        bytemuck::fill_zeroes(&mut self.entries);
    }

    /// Describe `size` bytes starting `offset` bytes into `fragments`.
    ///
    /// One descriptor is held back so the table always ends with a terminated entry. If the
    /// table fills up first, the transfer is shortened and the returned size tells the caller how
    /// much was described.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if a fragment lies above 4GB or nothing could be
    /// described.
    pub fn build(
        &mut self,
        fragments: &[DmaFragment],
        mut offset: u64,
        size: u32,
    ) -> Result<u32, Error> {
        self.clear();
        let usable = self.entries.len().saturating_sub(1);
        let mut remaining = size;
        let mut used = 0;
        for fragment in fragments {
            if remaining == 0 || used == usable {
                break;
            }
            if offset >= u64::from(fragment.size) {
                offset -= u64::from(fragment.size);
                continue;
            }
            let mut address = fragment.physical_address + offset;
            // offset is below the fragment size here
            let mut available = fragment.size - offset as u32;
            offset = 0;
            while available != 0 && remaining != 0 && used != usable {
                let length = available.min(remaining).min(MAX_TRANSFER_SIZE);
                let end = address + u64::from(length);
                ensure!(
                    end <= 1 << 32,
                    InvalidParameterSnafu {
                        reason: "DMA fragment above 4GB"
                    }
                );
                // the check above keeps the address within 32 bits
                self.entries[used] = Descriptor::transfer(address as u32, length);
                used += 1;
                address = end;
                available -= length;
                remaining -= length;
            }
        }
        ensure!(
            used != 0,
            InvalidParameterSnafu {
                reason: "empty DMA transfer"
            }
        );
        self.entries[used - 1].attributes |= attribute::END | attribute::INTERRUPT;
        Ok(size - remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn lengths(table: &DescriptorTable) -> std::vec::Vec<u32> {
        table
            .entries()
            .iter()
            .take_while(|d| d.attributes & attribute::VALID != 0)
            .map(Descriptor::length)
            .collect()
    }

    #[test]
    fn large_fragment_splits_at_max_transfer() {
        let mut table = DescriptorTable::new(0x1000, 8);
        let fragments = [DmaFragment {
            physical_address: 0x10_0000,
            size: 0x18000,
        }];
        assert_eq!(table.build(&fragments, 0, 0x18000).unwrap(), 0x18000);
        assert_eq!(lengths(&table), [0xF000, 0x9000]);
        let entries = table.entries();
        assert_eq!(entries[0].address, 0x10_0000);
        assert_eq!(entries[1].address, 0x10_F000);
        assert_eq!(entries[0].attributes & attribute::END, 0);
        assert_ne!(entries[1].attributes & attribute::END, 0);
        assert_ne!(entries[1].attributes & attribute::INTERRUPT, 0);
    }

    #[test]
    fn offset_skips_into_later_fragments() {
        let mut table = DescriptorTable::new(0x1000, 8);
        let fragments = [
            DmaFragment {
                physical_address: 0x2000,
                size: 0x400,
            },
            DmaFragment {
                physical_address: 0x8000,
                size: 0x1000,
            },
            DmaFragment {
                physical_address: 0x20000,
                size: 0x1000,
            },
        ];
        assert_eq!(table.build(&fragments, 0x600, 0x1000).unwrap(), 0x1000);
        assert_eq!(lengths(&table), [0xE00, 0x200]);
        assert_eq!(table.entries()[0].address, 0x8200);
        assert_eq!(table.entries()[1].address, 0x20000);
    }

    #[test]
    fn full_table_shortens_transfer() {
        let mut table = DescriptorTable::new(0x1000, 3);
        let fragments = [DmaFragment {
            physical_address: 0,
            size: 0x30000,
        }];
        assert_eq!(table.build(&fragments, 0, 0x30000).unwrap(), 0x1E000);
        assert_eq!(lengths(&table), [0xF000, 0xF000]);
        assert_eq!(table.entries()[2], Descriptor::default());
    }

    #[test_case(0xFFFF_F000, 0x2000; "straddles 4GB")]
    #[test_case(0x1_0000_0000, 0x200; "entirely above 4GB")]
    fn high_fragments_rejected(physical_address: u64, size: u32) {
        let mut table = DescriptorTable::new(0x1000, 8);
        let fragments = [DmaFragment {
            physical_address,
            size,
        }];
        assert!(matches!(
            table.build(&fragments, 0, size),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn table_bytes_match_descriptor_layout() {
        let mut table = DescriptorTable::new(0x1000, 2);
        let fragments = [DmaFragment {
            physical_address: 0x1234_5678,
            size: 0x200,
        }];
        table.build(&fragments, 0, 0x200).unwrap();
        let bytes = table.as_bytes();
        assert_eq!(bytes.len(), 16);
        let attributes = u32::from_ne_bytes(bytes[0..4].try_into().unwrap());
        let address = u32::from_ne_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(attributes, 0x0200_0027);
        assert_eq!(address, 0x1234_5678);
    }
}
