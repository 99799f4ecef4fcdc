//! Resources handed to a device at start: register windows and interrupt line/vector pairs.
//!
//! Both requirement and allocation lists are walked linearly. An interrupt vector always refers
//! back to the interrupt line it serves by index into the same list.

use alloc::vec::Vec;

use itertools::Itertools;
use snafu::{OptionExt, Snafu};

use crate::{
    interrupt::{Line, Polarity, TriggerMode},
    run_level::RunLevel,
};

/// Errors from walking resource lists.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The list has no register window.
    MissingRegisterWindow,
    /// The list has no interrupt line with a vector allocated for it.
    MissingInterrupt,
}

/// A resource a device asks for before it is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// A window of device registers of at least `size` bytes.
    PhysicalAddressSpace {
        /// Size of the window in bytes.
        size: u64,
    },
    /// An interrupt line described by firmware.
    InterruptLine {
        /// Controller-local line number.
        line: Line,
        /// Trigger mode of the line.
        mode: TriggerMode,
        /// Active polarity of the line.
        polarity: Polarity,
    },
    /// A processor vector to deliver an interrupt line on.
    InterruptVector {
        /// Index of the [`Requirement::InterruptLine`] this vector serves.
        owning_line: usize,
    },
}

/// A resource granted to a device at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    /// A window of device registers.
    PhysicalAddressSpace {
        /// Physical base address.
        base: u64,
        /// Size of the window in bytes.
        size: u64,
    },
    /// An interrupt line.
    InterruptLine {
        /// Controller-local line number.
        line: Line,
        /// Trigger mode of the line.
        mode: TriggerMode,
        /// Active polarity of the line.
        polarity: Polarity,
    },
    /// A vector through which an interrupt line is delivered.
    InterruptVector {
        /// Vector number.
        vector: u32,
        /// Run level the vector is delivered at.
        run_level: RunLevel,
        /// Index of the [`Allocation::InterruptLine`] this vector serves.
        owning_line: usize,
    },
}

/// The interrupt resources of a device, resolved from its allocations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InterruptResources {
    /// Controller-local line number.
    pub line: Line,
    /// Trigger mode of the line.
    pub mode: TriggerMode,
    /// Active polarity of the line.
    pub polarity: Polarity,
    /// Vector number.
    pub vector: u32,
    /// Run level the vector is delivered at.
    pub run_level: RunLevel,
}

/// The allocations a device was started with.
#[derive(Debug, Clone, Default)]
pub struct ResourceList {
    allocations: Vec<Allocation>,
}

impl ResourceList {
    /// Wrap a list of allocations.
    pub fn new(allocations: Vec<Allocation>) -> Self {
        Self { allocations }
    }

    /// Iterate over every allocation in order.
    pub fn iter(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.iter()
    }

    /// The first register window, as `(base, size)`.
    ///
    /// # Errors
    /// Returns [`Error::MissingRegisterWindow`] if there is none.
    pub fn register_window(&self) -> Result<(u64, u64), Error> {
        self.allocations
            .iter()
            .find_map(|a| match a {
                Allocation::PhysicalAddressSpace { base, size } => Some((*base, *size)),
                _ => None,
            })
            .context(MissingRegisterWindowSnafu)
    }

    /// The first interrupt vector and the line it serves.
    ///
    /// # Errors
    /// Returns [`Error::MissingInterrupt`] if no vector refers to a valid line.
    pub fn interrupt(&self) -> Result<InterruptResources, Error> {
        self.allocations
            .iter()
            .find_map(|a| {
                let Allocation::InterruptVector {
                    vector,
                    run_level,
                    owning_line,
                } = a
                else {
                    return None;
                };
                match self.allocations.get(*owning_line)? {
                    Allocation::InterruptLine {
                        line,
                        mode,
                        polarity,
                    } => Some(InterruptResources {
                        line: *line,
                        mode: *mode,
                        polarity: *polarity,
                        vector: *vector,
                        run_level: *run_level,
                    }),
                    _ => None,
                }
            })
            .context(MissingInterruptSnafu)
    }
}

/// Add an interrupt vector requirement for every interrupt line requirement in `requirements`.
///
/// Lines that already have a vector are left alone. Returns the number of vectors added.
pub fn query_interrupt_requirements(requirements: &mut Vec<Requirement>) -> usize {
    let served: Vec<usize> = requirements
        .iter()
        .filter_map(|r| match r {
            Requirement::InterruptVector { owning_line } => Some(*owning_line),
            _ => None,
        })
        .collect();
    let lines: Vec<usize> = requirements
        .iter()
        .positions(|r| matches!(r, Requirement::InterruptLine { .. }))
        .filter(|i| !served.contains(i))
        .collect();
    for &owning_line in &lines {
        requirements.push(Requirement::InterruptVector { owning_line });
    }
    lines.len()
}
