//! Run levels: the priority at which the current processor executes.
//!
//! Code running at or above a device's interrupt run level cannot be preempted by that device's
//! interrupt. Fast interrupt service routines run at the raised level and must not block; deferred
//! workers run at [`RunLevel::LOW`] and may take blocking locks.

/// A processor run level. Higher values mask more interrupts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RunLevel(pub u8);

impl RunLevel {
    /// Normal execution; everything can preempt.
    pub const LOW: RunLevel = RunLevel(0);
    /// Scheduler dispatch level.
    pub const DISPATCH: RunLevel = RunLevel(2);
    /// The highest level assigned to device interrupts.
    pub const MAX_DEVICE: RunLevel = RunLevel(11);
    /// The clock interrupt's level.
    pub const CLOCK: RunLevel = RunLevel(13);
    /// Everything is masked.
    pub const HIGH: RunLevel = RunLevel(15);
}

/// Mechanism for changing the current processor's run level.
#[cfg_attr(test, mockall::automock)]
pub trait RunLevelControl {
    /// The run level of the current processor.
    fn current(&self) -> RunLevel;

    /// Raise the run level to `level`, returning the previous one. A `level` below the current
    /// one leaves the run level unchanged. Above [`RunLevel::DISPATCH`], the device interrupts at
    /// or below `level` must not be delivered to this processor until it lowers again.
    fn raise(&self, level: RunLevel) -> RunLevel;

    /// Return to a previously saved run level.
    fn lower(&self, level: RunLevel);
}

#[cfg(test)]
pub(crate) mod fake {
    use super::{RunLevel, RunLevelControl};
    use core::sync::atomic::{AtomicU8, Ordering};

    /// Tracks a single processor's run level in memory.
    #[derive(Default)]
    pub struct TrackedRunLevel(AtomicU8);

    impl RunLevelControl for TrackedRunLevel {
        fn current(&self) -> RunLevel {
            RunLevel(self.0.load(Ordering::SeqCst))
        }

        fn raise(&self, level: RunLevel) -> RunLevel {
            RunLevel(self.0.fetch_max(level.0, Ordering::SeqCst))
        }

        fn lower(&self, level: RunLevel) {
            self.0.store(level.0, Ordering::SeqCst);
        }
    }
}
