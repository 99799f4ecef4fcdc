//! Interrupt sources and the contract every interrupt controller implements.
//!
//! A controller, whether it is the processor's primary interrupt controller or a GPIO block that
//! multiplexes pins onto a single parent line, reports which of its lines fired with
//! [`InterruptSource::begin`] and is told the interrupt is finished with
//! [`InterruptSource::end_of_interrupt`]. The value handed from one to the other is a typed token
//! private to the controller, so that nested interrupts can restore exactly the state they
//! interrupted.

use snafu::Snafu;

mod dispatch;
pub use dispatch::{Connection, Dispatcher, Error as DispatchError, InterruptHandle, ServiceRoutine};

pub mod priority;

/// A line number, local to the controller that owns it.
pub type Line = u32;

/// Trigger mode for an interrupt line.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum TriggerMode {
    /// Use level triggering.
    #[default]
    Level,
    /// Use edge triggering.
    Edge,
}

/// Which signal state or transition is considered active.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Polarity {
    /// Active high, or rising edge.
    #[default]
    High,
    /// Active low, or falling edge.
    Low,
    /// Both edges. Only meaningful for edge triggered lines.
    Both,
}

/// The desired state of an interrupt line.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct LineState {
    /// Whether the line can raise interrupts at all.
    pub enabled: bool,
    /// Triggering mode for the line.
    pub mode: TriggerMode,
    /// Active polarity.
    pub polarity: Polarity,
    /// Hardware priority; lower values are more urgent.
    pub priority: u8,
    /// The line should be able to wake the system.
    pub wake: bool,
    /// Debounce the input, if the controller supports it.
    pub debounce: bool,
}

/// The result of asking a controller which line fired.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterruptCause<T> {
    /// Nothing is pending on this controller. Expected on shared lines.
    NoInterruptHere,
    /// A line fired. `token` must be handed back to [`InterruptSource::end_of_interrupt`].
    LineFired {
        /// The line that fired.
        line: Line,
        /// Controller private continuation state.
        token: T,
    },
    /// The controller signalled but no line could be identified.
    Spurious,
}

/// Whether a service routine recognized the interrupt as its own.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterruptStatus {
    /// The interrupt belonged to this routine and has been dealt with or deferred.
    Claimed,
    /// The interrupt was raised by someone else sharing the line.
    NotClaimed,
}

/// Errors from interrupt controller operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The line does not exist on this controller.
    #[snafu(display("Invalid interrupt line {line}"))]
    InvalidLine {
        /// The offending line.
        line: Line,
    },
    /// The requested priority is outside the controller's range.
    #[snafu(display("Invalid interrupt priority {priority}"))]
    InvalidPriority {
        /// The offending priority.
        priority: u8,
    },
    /// The controller cannot perform this operation.
    NotSupported,
    /// A GPIO controller rejected the line configuration.
    Gpio {
        /// Underlying error.
        source: crate::gpio::Error,
    },
}

/// The contract implemented by every interrupt controller.
#[cfg_attr(test, mockall::automock(type Token = u32;))]
pub trait InterruptSource {
    /// State carried from [`Self::begin`] to the matching [`Self::end_of_interrupt`].
    type Token: Copy + core::fmt::Debug;

    /// Bring the controller to a known state with every line disabled.
    ///
    /// # Errors
    /// Returns an error if the hardware could not be initialized.
    fn initialize_io_unit(&self) -> Result<(), Error>;

    /// Configure a line and enable or disable it.
    ///
    /// # Errors
    /// - [`Error::InvalidLine`] if the line does not exist.
    /// - [`Error::InvalidPriority`] if the priority is out of range.
    fn set_line_state(&self, line: Line, state: &LineState) -> Result<(), Error>;

    /// Temporarily mask (`enable == false`) or unmask a line without changing its configuration.
    fn mask_line(&self, line: Line, enable: bool);

    /// Determine the source of an interrupt and raise the controller's masking to suit it.
    fn begin(&self) -> InterruptCause<Self::Token>;

    /// Finish an interrupt begun with [`Self::begin`].
    fn end_of_interrupt(&self, token: Self::Token);

    /// Raise a software interrupt on `line`.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] unless the controller supports software interrupts.
    fn request_interrupt(&self, line: Line) -> Result<(), Error> {
        let _ = line;
        NotSupportedSnafu.fail()
    }
}
