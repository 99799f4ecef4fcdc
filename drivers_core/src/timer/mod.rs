//! Hardware timers: free-running counters and interrupt-generating timers.

use bitflags::bitflags;
use snafu::Snafu;

use crate::interrupt::Line;

/// Generate tests checking that a [`HardwareTimer`] behaves as the features it reports promise.
///
/// `$timer_name` names the timer and `$setup` is an expression that evaluates to a fresh timer.
#[cfg(test)]
macro_rules! test_hardware_timer {
    ($timer_name:ident, $setup:expr) => {
        paste::paste! {
            mod [<$timer_name:snake _implements_hardware_timer>] {
                use super::*;
                use crate::timer::{HardwareTimer, TimerFeatures, TimerMode};

                #[test]
                fn counter_is_described() {
                    let timer = $setup;
                    timer.initialize().unwrap();
                    assert!(timer.counter_frequency() > 0);
                    assert!(matches!(timer.counter_bit_width(), 32 | 64));
                    assert!(timer.features().contains(TimerFeatures::READABLE));
                }

                #[test]
                fn arming_follows_features() {
                    let timer = $setup;
                    timer.initialize().unwrap();
                    let features = timer.features();
                    for (mode, feature) in [
                        (TimerMode::Periodic, TimerFeatures::PERIODIC),
                        (TimerMode::OneShot, TimerFeatures::ONE_SHOT),
                    ] {
                        assert_eq!(timer.arm(mode, 1000).is_ok(), features.contains(feature));
                        timer.disarm();
                    }
                }

                #[test]
                fn only_interrupting_timers_have_a_line() {
                    let timer = $setup;
                    let interrupts = timer
                        .features()
                        .intersects(TimerFeatures::PERIODIC | TimerFeatures::ONE_SHOT);
                    assert_eq!(timer.interrupt_line().is_some(), interrupts);
                }
            }
        }
    };
}

pub mod bcm2709;

/// How the tick count passed to [`HardwareTimer::arm`] is interpreted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerMode {
    /// Fire every `ticks` ticks until disarmed.
    Periodic,
    /// Fire once, `ticks` ticks from now.
    OneShot,
}

bitflags! {
    /// Capabilities of a hardware timer.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct TimerFeatures: u32 {
        /// The counter can be read.
        const READABLE = 1 << 0;
        /// The timer can fire periodically.
        const PERIODIC = 1 << 1;
        /// The timer can fire once.
        const ONE_SHOT = 1 << 2;
        /// The counter frequency changes with processor performance states.
        const P_STATE_VARIANT = 1 << 3;
    }
}

/// Errors from timer operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The timer does not support the request, for example arming a pure counter.
    InvalidParameter,
}

/// A hardware timer or counter.
#[cfg_attr(test, mockall::automock)]
pub trait HardwareTimer {
    /// Put the timer in a known state. Interrupts stay disabled until [`Self::arm`].
    ///
    /// # Errors
    /// Returns an error if the hardware could not be initialized.
    fn initialize(&self) -> Result<(), Error>;

    /// Read the counter.
    fn read_counter(&self) -> u64;

    /// Arm the timer to interrupt after `ticks` ticks.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if the timer cannot generate interrupts.
    fn arm(&self, mode: TimerMode, ticks: u64) -> Result<(), Error>;

    /// Stop the timer from generating further interrupts.
    fn disarm(&self);

    /// Acknowledge a fired interrupt, re-arming the next period if needed.
    fn acknowledge_interrupt(&self);

    /// What the timer can do.
    fn features(&self) -> TimerFeatures;

    /// Ticks per second.
    fn counter_frequency(&self) -> u64;

    /// Number of significant bits in [`Self::read_counter`].
    fn counter_bit_width(&self) -> u32;

    /// The interrupt line the timer raises, if any.
    fn interrupt_line(&self) -> Option<Line>;
}
