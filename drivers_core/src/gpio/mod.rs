//! Generic GPIO controller library.
//!
//! A SoC backend implements [`GpioFunctions`] over its registers. [`GpioController`] wraps one
//! backend instance per GPIO block: it serializes every backend call under a single lock taken at
//! the controller's interrupt run level, tracks which pins are open, and acts as a secondary
//! interrupt controller so that consumers can connect handlers to individual pins.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

use bitflags::bitflags;
use log::{debug, trace, warn};
use snafu::{ensure, ResultExt, Snafu};
use spin::{Mutex, MutexGuard};

use crate::{
    interrupt::{
        self, Connection, DispatchError, Dispatcher, InterruptCause, InterruptHandle,
        InterruptSource, InterruptStatus, Line, LineState, Polarity, TriggerMode,
    },
    run_level::{RunLevel, RunLevelControl},
};

pub mod bcm2709;

/// Upper bound on the number of lines a single controller may have.
pub const GPIO_MAX_LINES: u32 = 1024;

bitflags! {
    /// Pin configuration flags.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct GpioFlags: u32 {
        /// Drive the pin as an output.
        const OUTPUT = 1 << 0;
        /// Initial output level is high.
        const OUTPUT_HIGH = 1 << 1;
        /// The pin is an interrupt source.
        const INTERRUPT = 1 << 2;
        /// Edge rather than level triggered.
        const INTERRUPT_EDGE_TRIGGERED = 1 << 3;
        /// Trigger on the rising edge, or while high for level interrupts.
        const INTERRUPT_RISING_EDGE = 1 << 4;
        /// Trigger on the falling edge, or while low for level interrupts.
        const INTERRUPT_FALLING_EDGE = 1 << 5;
        /// Level triggered, active high.
        const INTERRUPT_ACTIVE_HIGH = Self::INTERRUPT_RISING_EDGE.bits();
        /// Level triggered, active low.
        const INTERRUPT_ACTIVE_LOW = Self::INTERRUPT_FALLING_EDGE.bits();
        /// The interrupt can wake the system.
        const INTERRUPT_WAKE = 1 << 6;
        /// Debounce the input.
        const ENABLE_DEBOUNCE = 1 << 7;
        /// Enable the pull-up resistor.
        const PULL_UP = 1 << 8;
        /// Enable the pull-down resistor.
        const PULL_DOWN = 1 << 9;
        /// Explicitly disable both resistors.
        const PULL_NONE = Self::PULL_UP.bits() | Self::PULL_DOWN.bits();
    }
}

bitflags! {
    /// Host-side bookkeeping for a pin.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct PinState: u32 {
        /// A handle to the pin is open.
        const ACQUIRED = 1 << 0;
        /// The backend accepted the last configuration.
        const CONFIGURED = 1 << 1;
    }
}

bitflags! {
    /// Capabilities of a GPIO block.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct GpioFeatures: u32 {
        /// Pins can generate interrupts.
        const INTERRUPTS = 1 << 0;
        /// Registers can only be touched at low run level, for example behind a slow bus.
        const LOW_RUN_LEVEL = 1 << 1;
    }
}

/// Complete configuration of one pin.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PinConfiguration {
    /// Direction, interrupt and pull settings.
    pub flags: GpioFlags,
    /// Output drive strength in microamps, zero for the default.
    pub output_drive_strength: u32,
    /// Debounce timeout in microseconds, zero for the default.
    pub debounce_timeout: u32,
}

/// Pull resistor selection from firmware GPIO resource data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResourcePull {
    /// Use the pin's default.
    Default,
    /// Pull up.
    Up,
    /// Pull down.
    Down,
    /// No pull.
    None,
}

/// Firmware data accompanying a GPIO interrupt resource.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GpioResourceData {
    /// Requested pull resistor.
    pub pull: ResourcePull,
    /// Output drive strength in microamps.
    pub output_drive_strength: u32,
    /// Debounce timeout in microseconds.
    pub debounce_timeout: u32,
}

/// Errors from GPIO operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The pin number is out of range for the controller.
    #[snafu(display("Invalid GPIO pin {pin}"))]
    InvalidPin {
        /// The offending pin.
        pin: u32,
    },
    /// The pin is already open.
    #[snafu(display("GPIO pin {pin} already in use"))]
    PinInUse {
        /// The pin.
        pin: u32,
    },
    /// The registration was rejected.
    #[snafu(display("Invalid GPIO controller registration: {reason}"))]
    InvalidRegistration {
        /// What was wrong.
        reason: &'static str,
    },
    /// The controller has not been started.
    NotStarted,
    /// The backend cannot perform this operation.
    NotSupported,
    /// A pin-level interrupt connection failed.
    Connect {
        /// Underlying error.
        source: DispatchError,
    },
}

/// Operations a SoC GPIO backend provides. Every call is made with the controller lock held.
#[cfg_attr(test, mockall::automock)]
pub trait GpioFunctions {
    /// Apply a complete configuration to `pin`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidPin`] for out-of-range pins.
    fn set_configuration(&mut self, pin: u32, configuration: &PinConfiguration)
        -> Result<(), Error>;

    /// Set only the direction of `pin`. Only [`GpioFlags::OUTPUT`] and
    /// [`GpioFlags::OUTPUT_HIGH`] are observed.
    ///
    /// # Errors
    /// Returns [`Error::InvalidPin`] for out-of-range pins.
    fn set_direction(&mut self, pin: u32, flags: GpioFlags) -> Result<(), Error>;

    /// Drive an output pin.
    fn set_value(&mut self, pin: u32, value: bool);

    /// Sample a pin. Returns `None` for out-of-range pins.
    fn get_value(&mut self, pin: u32) -> Option<bool>;

    /// Mask every pin interrupt and clear pending events.
    ///
    /// # Errors
    /// Returns an error if the hardware could not be prepared.
    fn prepare_for_interrupts(&mut self) -> Result<(), Error>;

    /// Mask or unmask the interrupt of `pin` using its cached interrupt configuration.
    fn mask_interrupt_line(&mut self, pin: u32, enable: bool);

    /// Find the pin that raised the interrupt.
    fn begin_interrupt(&mut self) -> InterruptCause<u32>;

    /// Acknowledge the pin reported by [`Self::begin_interrupt`].
    fn end_of_interrupt(&mut self, pin: u32);

    /// Raise a software interrupt on `pin`.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] unless the hardware can do this.
    fn request_interrupt(&mut self, pin: u32) -> Result<(), Error> {
        let _ = pin;
        NotSupportedSnafu.fail()
    }
}

/// Everything needed to create a [`GpioController`].
pub struct GpioRegistration {
    /// The backend.
    pub functions: Box<dyn GpioFunctions + Send>,
    /// Number of pins.
    pub line_count: u32,
    /// What the block supports.
    pub features: GpioFeatures,
}

struct Inner {
    functions: Box<dyn GpioFunctions + Send>,
    pins: Vec<(PinState, PinConfiguration)>,
}

/// One GPIO block.
pub struct GpioController {
    inner: Mutex<Inner>,
    line_count: u32,
    features: GpioFeatures,
    /// Backend calls may not raise the run level.
    queued: bool,
    run_level: AtomicU8,
    run_levels: Arc<dyn RunLevelControl + Send + Sync>,
    started: AtomicBool,
    interrupt_line: Mutex<Option<Line>>,
    pin_interrupts: Dispatcher,
}

/// Holds the controller lock and the run level it was taken at.
///
/// Dereferences to the backend so that drivers can run multi-register sequences atomically.
pub struct GpioLockGuard<'a> {
    // released before the run level is restored
    inner: MutexGuard<'a, Inner>,
    restore: RestoreRunLevel<'a>,
}

struct RestoreRunLevel<'a> {
    controller: &'a GpioController,
    old: RunLevel,
}

impl Drop for RestoreRunLevel<'_> {
    fn drop(&mut self) {
        if !self.controller.queued {
            self.controller.run_levels.lower(self.old);
        }
    }
}

impl GpioLockGuard<'_> {
    /// The run level that will be restored when the guard is dropped.
    pub fn old_run_level(&self) -> RunLevel {
        self.restore.old
    }

    fn inner(&mut self) -> &mut Inner {
        &mut self.inner
    }
}

impl Deref for GpioLockGuard<'_> {
    type Target = dyn GpioFunctions + Send;

    fn deref(&self) -> &Self::Target {
        self.inner.functions.as_ref()
    }
}

impl DerefMut for GpioLockGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.functions.as_mut()
    }
}

/// An open pin. Obtained from [`GpioController::open_pin`] and returned with
/// [`GpioController::close_pin`].
#[derive(Debug, PartialEq, Eq)]
pub struct PinHandle {
    pin: u32,
}

impl PinHandle {
    /// The pin number.
    pub fn pin(&self) -> u32 {
        self.pin
    }
}

impl GpioController {
    /// Wrap a backend. Hardware is not touched.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRegistration`] if the line count is zero or above
    /// [`GPIO_MAX_LINES`], or if [`GpioFeatures::LOW_RUN_LEVEL`] is set without
    /// [`GpioFeatures::INTERRUPTS`].
    pub fn new(
        registration: GpioRegistration,
        run_levels: Arc<dyn RunLevelControl + Send + Sync>,
    ) -> Result<Self, Error> {
        let GpioRegistration {
            functions,
            line_count,
            features,
        } = registration;
        ensure!(
            line_count != 0 && line_count <= GPIO_MAX_LINES,
            InvalidRegistrationSnafu {
                reason: "line count out of range"
            }
        );
        ensure!(
            !features.contains(GpioFeatures::LOW_RUN_LEVEL)
                || features.contains(GpioFeatures::INTERRUPTS),
            InvalidRegistrationSnafu {
                reason: "low run level controllers must support interrupts"
            }
        );

        let queued = !features.contains(GpioFeatures::INTERRUPTS)
            || features.contains(GpioFeatures::LOW_RUN_LEVEL);
        let run_level = if queued {
            RunLevel::LOW
        } else {
            RunLevel::MAX_DEVICE
        };
        Ok(Self {
            inner: Mutex::new(Inner {
                functions,
                pins: alloc::vec![Default::default(); line_count as usize],
            }),
            line_count,
            features,
            queued,
            run_level: AtomicU8::new(run_level.0),
            run_levels,
            started: AtomicBool::new(false),
            interrupt_line: Mutex::new(None),
            pin_interrupts: Dispatcher::new(),
        })
    }

    /// Number of pins on the controller.
    pub fn line_count(&self) -> u32 {
        self.line_count
    }

    /// What the controller supports.
    pub fn features(&self) -> GpioFeatures {
        self.features
    }

    /// The run level the controller lock is taken at.
    pub fn interrupt_run_level(&self) -> RunLevel {
        RunLevel(self.run_level.load(Ordering::Acquire))
    }

    /// The parent interrupt line given to [`Self::start`], if any.
    pub fn interrupt_line(&self) -> Option<Line> {
        *self.interrupt_line.lock()
    }

    /// Start the controller, optionally wired to a parent interrupt line.
    ///
    /// Must be serialized externally against [`Self::stop`]; the controller lock is not taken
    /// here except to prepare the backend for interrupts.
    ///
    /// # Errors
    /// Returns the backend's error if it fails to prepare for interrupts.
    pub fn start(&self, parent_line: Option<Line>) -> Result<(), Error> {
        *self.interrupt_line.lock() = parent_line;
        if self.features.contains(GpioFeatures::INTERRUPTS) && parent_line.is_some() {
            self.lock().prepare_for_interrupts()?;
        }
        self.started.store(true, Ordering::Release);
        debug!(
            "GPIO controller started with {} lines, parent line {:?}",
            self.line_count, parent_line
        );
        Ok(())
    }

    /// Stop the controller. Must be serialized externally against [`Self::start`].
    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
        let open = self
            .inner
            .lock()
            .pins
            .iter()
            .filter(|(state, _)| state.contains(PinState::ACQUIRED))
            .count();
        if open != 0 {
            warn!("GPIO controller stopped with {open} pins still open");
        }
    }

    /// Lower the run level the controller lock is taken at, once the parent interrupt's run
    /// level is known.
    pub fn set_interrupt_run_level(&self, level: RunLevel) {
        debug_assert!(self.interrupt_run_level() >= level);
        self.run_level.store(level.0, Ordering::Release);
    }

    /// Acquire the controller lock, raising the run level first unless the controller only runs
    /// at low run level.
    pub fn lock(&self) -> GpioLockGuard<'_> {
        let old = if self.queued {
            debug_assert_eq!(self.run_levels.current(), RunLevel::LOW);
            RunLevel::LOW
        } else {
            self.run_levels.raise(self.interrupt_run_level())
        };
        let restore = RestoreRunLevel {
            controller: self,
            old,
        };
        GpioLockGuard {
            inner: self.inner.lock(),
            restore,
        }
    }

    fn check_pin(&self, pin: u32) -> Result<(), Error> {
        ensure!(pin < self.line_count, InvalidPinSnafu { pin });
        Ok(())
    }

    /// Open a pin for exclusive use.
    ///
    /// # Errors
    /// - [`Error::NotStarted`] if the controller is not running.
    /// - [`Error::InvalidPin`] for out-of-range pins.
    /// - [`Error::PinInUse`] if the pin is already open.
    pub fn open_pin(&self, pin: u32) -> Result<PinHandle, Error> {
        ensure!(self.started.load(Ordering::Acquire), NotStartedSnafu);
        self.check_pin(pin)?;
        let mut guard = self.lock();
        let (state, _) = &mut guard.inner().pins[pin as usize];
        ensure!(!state.contains(PinState::ACQUIRED), PinInUseSnafu { pin });
        state.insert(PinState::ACQUIRED);
        trace!("opened GPIO pin {pin}");
        Ok(PinHandle { pin })
    }

    /// Close a pin opened with [`Self::open_pin`].
    pub fn close_pin(&self, handle: PinHandle) {
        let mut guard = self.lock();
        if let Some((state, _)) = guard.inner().pins.get_mut(handle.pin as usize) {
            state.remove(PinState::ACQUIRED);
        }
    }

    /// The host's record of a pin.
    pub fn pin_state(&self, pin: u32) -> Option<(PinState, PinConfiguration)> {
        self.inner.lock().pins.get(pin as usize).copied()
    }

    /// Apply a complete configuration to an open pin.
    ///
    /// # Errors
    /// Returns the backend's error, in which case the recorded configuration is unchanged.
    pub fn set_configuration(
        &self,
        handle: &PinHandle,
        configuration: &PinConfiguration,
    ) -> Result<(), Error> {
        let mut guard = self.lock();
        let inner = guard.inner();
        inner
            .functions
            .set_configuration(handle.pin, configuration)?;
        inner.pins[handle.pin as usize] = (
            PinState::ACQUIRED | PinState::CONFIGURED,
            *configuration,
        );
        Ok(())
    }

    /// Set the direction of an open pin.
    ///
    /// # Errors
    /// Returns the backend's error.
    pub fn set_direction(&self, handle: &PinHandle, flags: GpioFlags) -> Result<(), Error> {
        self.lock().set_direction(handle.pin, flags)
    }

    /// Drive an open output pin.
    pub fn set_value(&self, handle: &PinHandle, value: bool) {
        self.lock().set_value(handle.pin, value);
    }

    /// Sample an open pin. `None` if the backend could not read it.
    pub fn get_value(&self, handle: &PinHandle) -> Option<bool> {
        self.lock().get_value(handle.pin)
    }

    /// Configure `line` as an interrupt source from a line state and optional firmware data.
    ///
    /// # Errors
    /// Returns the backend's error, in which case the pin is no longer marked configured.
    pub fn configure_interrupt_line(
        &self,
        line: Line,
        state: &LineState,
        resource: Option<&GpioResourceData>,
    ) -> Result<(), Error> {
        self.check_pin(line)?;
        let mut configuration = PinConfiguration::default();
        if state.enabled {
            let mut flags = GpioFlags::INTERRUPT;
            if state.mode == TriggerMode::Edge {
                flags |= GpioFlags::INTERRUPT_EDGE_TRIGGERED;
            }
            flags |= match state.polarity {
                Polarity::High => GpioFlags::INTERRUPT_RISING_EDGE,
                Polarity::Low => GpioFlags::INTERRUPT_FALLING_EDGE,
                Polarity::Both => {
                    GpioFlags::INTERRUPT_RISING_EDGE | GpioFlags::INTERRUPT_FALLING_EDGE
                }
            };
            if state.debounce {
                flags |= GpioFlags::ENABLE_DEBOUNCE;
            }
            if state.wake {
                flags |= GpioFlags::INTERRUPT_WAKE;
            }
            if let Some(data) = resource {
                flags |= match data.pull {
                    ResourcePull::None => GpioFlags::PULL_NONE,
                    ResourcePull::Up => GpioFlags::PULL_UP,
                    ResourcePull::Down => GpioFlags::PULL_DOWN,
                    ResourcePull::Default => GpioFlags::empty(),
                };
                configuration.output_drive_strength = data.output_drive_strength;
                configuration.debounce_timeout = data.debounce_timeout;
            }
            configuration.flags = flags;
        }

        let mut guard = self.lock();
        let inner = guard.inner();
        inner.pins[line as usize] = (PinState::ACQUIRED | PinState::CONFIGURED, configuration);
        let result = inner.functions.set_configuration(line, &configuration);
        if result.is_err() {
            inner.pins[line as usize].0.remove(PinState::CONFIGURED);
        }
        result
    }

    /// Connect routines to a pin's interrupt.
    ///
    /// # Errors
    /// - [`Error::InvalidPin`] for out-of-range pins.
    /// - [`Error::Connect`] if the connection is empty.
    pub fn connect_pin_interrupt(
        &self,
        pin: u32,
        connection: Connection,
    ) -> Result<InterruptHandle, Error> {
        self.check_pin(pin)?;
        self.pin_interrupts
            .connect(pin, connection)
            .context(ConnectSnafu)
    }

    /// Remove a pin interrupt connection.
    ///
    /// # Errors
    /// Returns [`Error::Connect`] if the handle is stale.
    pub fn disconnect_pin_interrupt(&self, handle: InterruptHandle) -> Result<(), Error> {
        self.pin_interrupts.disconnect(handle).context(ConnectSnafu)
    }

    /// The service routine connected to the parent interrupt line.
    ///
    /// Finds the pin that fired, runs its routines without the controller lock held, and
    /// acknowledges it.
    pub fn interrupt_service(&self) -> InterruptStatus {
        match self.pin_interrupts.dispatch(self) {
            Ok(status) => status,
            Err(e) => {
                // the event was acknowledged; the pin just has nobody listening
                warn!("GPIO: {e}");
                InterruptStatus::Claimed
            }
        }
    }

    /// Run deferred pin interrupt workers. Must be called at low run level.
    pub fn run_deferred(&self) -> usize {
        self.pin_interrupts.run_deferred()
    }
}

impl InterruptSource for GpioController {
    type Token = u32;

    fn initialize_io_unit(&self) -> Result<(), interrupt::Error> {
        self.lock()
            .prepare_for_interrupts()
            .context(interrupt::GpioSnafu)
    }

    fn set_line_state(&self, line: Line, state: &LineState) -> Result<(), interrupt::Error> {
        ensure!(line < self.line_count, interrupt::InvalidLineSnafu { line });
        self.configure_interrupt_line(line, state, None)
            .context(interrupt::GpioSnafu)
    }

    fn mask_line(&self, line: Line, enable: bool) {
        if line < self.line_count {
            self.lock().mask_interrupt_line(line, enable);
        }
    }

    fn begin(&self) -> InterruptCause<u32> {
        self.lock().begin_interrupt()
    }

    fn end_of_interrupt(&self, token: u32) {
        self.lock().end_of_interrupt(token);
    }

    fn request_interrupt(&self, line: Line) -> Result<(), interrupt::Error> {
        ensure!(line < self.line_count, interrupt::InvalidLineSnafu { line });
        self.lock()
            .request_interrupt(line)
            .context(interrupt::GpioSnafu)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use mockall::predicate::{always, eq, function};

    use super::*;
    use crate::run_level::{fake::TrackedRunLevel, MockRunLevelControl};

    fn registration(functions: MockGpioFunctions, features: GpioFeatures) -> GpioRegistration {
        GpioRegistration {
            functions: Box::new(functions),
            line_count: 8,
            features,
        }
    }

    fn started(functions: MockGpioFunctions) -> GpioController {
        let c = GpioController::new(
            registration(functions, GpioFeatures::empty()),
            Arc::new(TrackedRunLevel::default()),
        )
        .unwrap();
        c.start(None).unwrap();
        c
    }

    #[test]
    fn registration_checks() {
        let levels = Arc::new(TrackedRunLevel::default());
        let mut r = registration(MockGpioFunctions::new(), GpioFeatures::empty());
        r.line_count = 0;
        assert!(matches!(
            GpioController::new(r, levels.clone()),
            Err(Error::InvalidRegistration { .. })
        ));
        let mut r = registration(MockGpioFunctions::new(), GpioFeatures::empty());
        r.line_count = GPIO_MAX_LINES + 1;
        assert!(GpioController::new(r, levels.clone()).is_err());
        let r = registration(MockGpioFunctions::new(), GpioFeatures::LOW_RUN_LEVEL);
        assert!(GpioController::new(r, levels.clone()).is_err());
        let mut r = registration(MockGpioFunctions::new(), GpioFeatures::INTERRUPTS);
        r.line_count = GPIO_MAX_LINES;
        let c = GpioController::new(r, levels).unwrap();
        assert_eq!(c.interrupt_run_level(), RunLevel::MAX_DEVICE);
    }

    #[test]
    fn open_close_pin() {
        let c = started(MockGpioFunctions::new());
        assert!(matches!(c.open_pin(8), Err(Error::InvalidPin { pin: 8 })));
        let h = c.open_pin(3).unwrap();
        assert!(matches!(c.open_pin(3), Err(Error::PinInUse { pin: 3 })));
        c.close_pin(h);
        let h = c.open_pin(3).unwrap();
        assert_eq!(h.pin(), 3);
    }

    #[test]
    fn open_requires_start() {
        let c = GpioController::new(
            registration(MockGpioFunctions::new(), GpioFeatures::empty()),
            Arc::new(TrackedRunLevel::default()),
        )
        .unwrap();
        assert!(matches!(c.open_pin(0), Err(Error::NotStarted)));
    }

    #[test]
    fn configuration_recorded_only_on_success() {
        let mut f = MockGpioFunctions::new();
        f.expect_set_configuration()
            .with(eq(2), always())
            .once()
            .returning(|_, _| Ok(()));
        f.expect_set_configuration()
            .with(eq(4), always())
            .once()
            .returning(|pin, _| InvalidPinSnafu { pin }.fail());
        let c = started(f);
        let config = PinConfiguration {
            flags: GpioFlags::OUTPUT,
            ..Default::default()
        };

        let h2 = c.open_pin(2).unwrap();
        c.set_configuration(&h2, &config).unwrap();
        assert_eq!(
            c.pin_state(2),
            Some((PinState::ACQUIRED | PinState::CONFIGURED, config))
        );

        let h4 = c.open_pin(4).unwrap();
        assert!(c.set_configuration(&h4, &config).is_err());
        assert_eq!(
            c.pin_state(4),
            Some((PinState::ACQUIRED, PinConfiguration::default()))
        );
    }

    #[test]
    fn spin_lock_raises_and_restores_run_level() {
        let mut levels = MockRunLevelControl::new();
        levels
            .expect_raise()
            .with(eq(RunLevel(7)))
            .once()
            .return_const(RunLevel::LOW);
        levels
            .expect_lower()
            .with(eq(RunLevel::LOW))
            .once()
            .return_const(());
        let mut f = MockGpioFunctions::new();
        f.expect_set_value()
            .with(eq(1), eq(true))
            .once()
            .return_const(());
        let c = GpioController::new(
            registration(f, GpioFeatures::INTERRUPTS),
            Arc::new(levels),
        )
        .unwrap();
        c.set_interrupt_run_level(RunLevel(7));
        c.set_value(&PinHandle { pin: 1 }, true);
    }

    #[test]
    fn start_keeps_parent_run_level() {
        let mut f = MockGpioFunctions::new();
        f.expect_prepare_for_interrupts()
            .once()
            .returning(|| Ok(()));
        let levels = Arc::new(TrackedRunLevel::default());
        let c = GpioController::new(registration(f, GpioFeatures::INTERRUPTS), levels.clone())
            .unwrap();
        c.set_interrupt_run_level(RunLevel(5));
        c.start(Some(49)).unwrap();
        assert_eq!(c.interrupt_run_level(), RunLevel(5));
        assert_eq!(c.interrupt_line(), Some(49));
        assert_eq!(levels.current(), RunLevel::LOW);
        let guard = c.lock();
        assert_eq!(levels.current(), RunLevel(5));
        drop(guard);
        assert_eq!(levels.current(), RunLevel::LOW);
    }

    #[test]
    fn interrupt_line_state_maps_to_flags() {
        let mut f = MockGpioFunctions::new();
        f.expect_set_configuration()
            .with(
                eq(5),
                function(|c: &PinConfiguration| {
                    c.flags
                        == GpioFlags::INTERRUPT
                            | GpioFlags::INTERRUPT_EDGE_TRIGGERED
                            | GpioFlags::INTERRUPT_RISING_EDGE
                            | GpioFlags::INTERRUPT_FALLING_EDGE
                            | GpioFlags::PULL_UP
                        && c.debounce_timeout == 30
                }),
            )
            .once()
            .returning(|_, _| Ok(()));
        let c = started(f);
        c.configure_interrupt_line(
            5,
            &LineState {
                enabled: true,
                mode: TriggerMode::Edge,
                polarity: Polarity::Both,
                ..Default::default()
            },
            Some(&GpioResourceData {
                pull: ResourcePull::Up,
                output_drive_strength: 0,
                debounce_timeout: 30,
            }),
        )
        .unwrap();
        assert!(c.pin_state(5).unwrap().0.contains(PinState::CONFIGURED));
    }

    #[test]
    fn failed_line_state_clears_configured() {
        let mut f = MockGpioFunctions::new();
        f.expect_set_configuration()
            .returning(|_, _| NotSupportedSnafu.fail());
        let c = started(f);
        let res = c.set_line_state(1, &LineState::default());
        assert!(matches!(res, Err(interrupt::Error::Gpio { .. })));
        assert_eq!(c.pin_state(1).unwrap().0, PinState::ACQUIRED);
        assert!(matches!(
            c.set_line_state(9, &LineState::default()),
            Err(interrupt::Error::InvalidLine { line: 9 })
        ));
    }

    #[test]
    fn service_dispatches_pin_handler() {
        let mut f = MockGpioFunctions::new();
        f.expect_begin_interrupt()
            .once()
            .return_const(InterruptCause::LineFired { line: 6, token: 6 });
        f.expect_end_of_interrupt()
            .with(eq(6))
            .once()
            .return_const(());
        let c = started(f);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        c.connect_pin_interrupt(
            6,
            Connection {
                service: Some(Arc::new(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                    InterruptStatus::Claimed
                })),
                worker: None,
            },
        )
        .unwrap();
        assert_eq!(c.interrupt_service(), InterruptStatus::Claimed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn service_on_quiet_controller_is_not_claimed() {
        let mut f = MockGpioFunctions::new();
        f.expect_begin_interrupt()
            .once()
            .return_const(InterruptCause::NoInterruptHere);
        f.expect_end_of_interrupt().never();
        let c = started(f);
        assert_eq!(c.interrupt_service(), InterruptStatus::NotClaimed);
    }

    #[test]
    fn start_with_interrupts_prepares_backend() {
        let mut f = MockGpioFunctions::new();
        f.expect_prepare_for_interrupts()
            .once()
            .returning(|| Ok(()));
        let c = GpioController::new(
            registration(f, GpioFeatures::INTERRUPTS),
            Arc::new(TrackedRunLevel::default()),
        )
        .unwrap();
        c.start(Some(49)).unwrap();
        assert_eq!(c.interrupt_line(), Some(49));
    }
}
