//! Time sources used for timeouts and calibrated delays.

/// A source of time for drivers.
///
/// Two counters are exposed. The recent counter is maintained by the clock interrupt and is cheap
/// to read, but it stops advancing whenever interrupts are not being delivered. The queried
/// counter goes straight to hardware and always advances.
#[cfg_attr(test, mockall::automock)]
pub trait TimeSource {
    /// The time counter as last recorded by the clock interrupt.
    fn recent_counter(&self) -> u64;

    /// The time counter read directly from the hardware.
    fn query_counter(&self) -> u64;

    /// Ticks per second of both counters.
    fn frequency(&self) -> u64;

    /// Busy-wait for at least `microseconds`.
    fn stall(&self, microseconds: u32);
}

impl<T: TimeSource + ?Sized> TimeSource for alloc::sync::Arc<T> {
    fn recent_counter(&self) -> u64 {
        (**self).recent_counter()
    }

    fn query_counter(&self) -> u64 {
        (**self).query_counter()
    }

    fn frequency(&self) -> u64 {
        (**self).frequency()
    }

    fn stall(&self, microseconds: u32) {
        (**self).stall(microseconds);
    }
}

/// Convert a duration in milliseconds to ticks of a counter running at `frequency`.
#[must_use]
pub fn ticks_for_milliseconds(frequency: u64, milliseconds: u64) -> u64 {
    frequency.saturating_mul(milliseconds) / 1000
}

#[cfg(test)]
pub(crate) mod fake {
    use super::TimeSource;
    use core::sync::atomic::{AtomicU64, Ordering};

    /// A clock that advances by one tick on every read and records stalls.
    #[derive(Default)]
    pub struct StepClock {
        counter: AtomicU64,
        recent: AtomicU64,
        pub stalled: AtomicU64,
    }

    impl StepClock {
        pub fn new() -> Self {
            Self::default()
        }

        /// Freeze the interrupt-maintained counter, as happens with interrupts disabled.
        pub fn freeze_recent(&self, value: u64) {
            self.recent.store(value, Ordering::SeqCst);
        }
    }

    impl TimeSource for StepClock {
        fn recent_counter(&self) -> u64 {
            self.recent.load(Ordering::SeqCst)
        }

        fn query_counter(&self) -> u64 {
            self.counter.fetch_add(1, Ordering::SeqCst)
        }

        fn frequency(&self) -> u64 {
            1000
        }

        fn stall(&self, microseconds: u32) {
            self.stalled
                .fetch_add(u64::from(microseconds), Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ticks_for_milliseconds;
    use test_case::test_case;

    #[test_case(1_000_000, 1 => 1000)]
    #[test_case(1000, 250 => 250)]
    #[test_case(u64::MAX, 2 => u64::MAX / 1000)]
    fn millisecond_conversion(frequency: u64, ms: u64) -> u64 {
        ticks_for_milliseconds(frequency, ms)
    }
}
