//! The BCM2709 (Raspberry Pi 2/3) device set.
//!
//! Every device is started from the resources allocated to it: its register window and, where it
//! interrupts, the line and vector it was given. The firmware is asked through the mailbox to
//! power the SD host and for its base clock.

use alloc::{boxed::Box, sync::Arc};

use log::{debug, info, warn};
use snafu::{OptionExt, ResultExt, Snafu};

use drivers_core::{
    gpio::{self, bcm2709::Bcm2709Gpio, GpioController, GpioFeatures, GpioRegistration},
    interrupt::{
        self, Connection, DispatchError, Dispatcher, InterruptHandle, InterruptSource,
        InterruptStatus, Line, LineState,
    },
    mailbox::{self, clock, device, tag, Mailbox, PropertyMessage},
    resources::{self, InterruptResources, ResourceList},
    run_level::{RunLevel, RunLevelControl},
    sd::{self, SdController, SdParameters, Voltages},
    spb::{bcm2709_i2c::Bcm2709I2c, SpbController},
    timer::{
        self,
        bcm2709::{Bcm2709TimerConfig, Bcm2709Timers},
        HardwareTimer, TimerMode,
    },
};

use crate::{
    arch::{self, ProcessorRunLevel, SystemTime, SYSTEM_TIMER_FREQUENCY},
    mmio::Mmio,
};

/// Frequency of the APB clock feeding the ARM timer.
pub const APB_CLOCK_FREQUENCY: u64 = 250_000_000;

/// Rate of the clock interrupt.
pub const CLOCK_RATE_HZ: u64 = 100;

/// Interrupt line of system timer compare channel 0.
pub const SYSTEM_TIMER_LINE_BASE: Line = 0;

/// Interrupt line of the ARM timer.
pub const ARM_TIMER_LINE: Line = 64;

const PROPERTY_BUFFER_SIZE: usize = 256;

/// Errors from starting the board.
#[derive(Debug, Snafu)]
pub enum Error {
    /// A device's resource list is incomplete.
    #[snafu(display("{device}: {source}"))]
    Resources {
        /// The device.
        device: &'static str,
        /// Underlying error.
        source: resources::Error,
    },
    /// A register window could not be mapped.
    #[snafu(display("cannot map {size:#x} bytes at {base:#x}"))]
    Unmapped {
        /// Physical base.
        base: u64,
        /// Size in bytes.
        size: u64,
    },
    /// The firmware property buffer has no bus address or is too small.
    FirmwareBuffer,
    /// The firmware refused a request.
    Firmware {
        /// Underlying error.
        source: mailbox::Error,
    },
    /// The GPIO block failed to start.
    Gpio {
        /// Underlying error.
        source: gpio::Error,
    },
    /// The clock timer has no interrupt line.
    NoClockLine,
    /// The clock timer failed to start.
    Timer {
        /// Underlying error.
        source: timer::Error,
    },
    /// The SD host failed to start.
    Sd {
        /// Underlying error.
        source: sd::Error,
    },
    /// An interrupt line could not be enabled.
    Interrupt {
        /// Underlying error.
        source: interrupt::Error,
    },
    /// A service routine could not be connected.
    Connect {
        /// Underlying error.
        source: DispatchError,
    },
}

/// How the board reaches physical memory.
pub trait AddressSpace {
    /// Map `size` bytes of device registers at physical `base`, returning the virtual address.
    fn map_registers(&self, base: u64, size: u64) -> Option<usize>;

    /// The VideoCore bus address of memory at `virtual_address`.
    fn bus_address(&self, virtual_address: usize) -> Option<u32>;
}

/// Resources allocated to each device.
#[derive(Debug, Clone, Default)]
pub struct DeviceResources {
    /// ARM timer block.
    pub arm_timer: ResourceList,
    /// System timer block.
    pub system_timer: ResourceList,
    /// VideoCore mailbox.
    pub mailbox: ResourceList,
    /// GPIO block and its parent interrupt.
    pub gpio: ResourceList,
    /// BSC1 I2C controller and its interrupt.
    pub i2c: ResourceList,
    /// Arasan SD host and its interrupt.
    pub sd: ResourceList,
}

#[repr(C, align(16))]
struct PropertyBuffer([u8; PROPERTY_BUFFER_SIZE]);

/// The started devices.
pub struct Board {
    /// Both timer blocks.
    pub timers: Arc<Bcm2709Timers<Arc<Mmio>>>,
    /// The GPIO block.
    pub gpio: Arc<GpioController>,
    /// The I2C bus.
    pub i2c: Arc<SpbController>,
    /// The SD slot.
    pub sd: Arc<SdController>,
    dispatcher: Dispatcher,
    lines: [InterruptResources; 3],
    clock_line: Line,
}

/// Map the first register window of `list`.
///
/// # Safety
/// The allocation must describe device registers that nothing else maps as memory.
unsafe fn map_window(
    space: &dyn AddressSpace,
    list: &ResourceList,
    device: &'static str,
) -> Result<Mmio, Error> {
    let (base, size) = list.register_window().context(ResourcesSnafu { device })?;
    let virtual_address = space
        .map_registers(base, size)
        .context(UnmappedSnafu { base, size })?;
    // SAFETY: the window was just mapped for this device.
    unsafe { Mmio::new(virtual_address, size as usize) }.context(UnmappedSnafu { base, size })
}

/// Send `message` to the firmware and return its answer.
fn firmware_request(
    mailbox: &Mailbox<Mmio>,
    space: &dyn AddressSpace,
    message: PropertyMessage,
) -> Result<PropertyMessage, Error> {
    let request = message.as_bytes();
    snafu::ensure!(request.len() <= PROPERTY_BUFFER_SIZE, FirmwareBufferSnafu);
    let mut buffer = Box::new(PropertyBuffer([0; PROPERTY_BUFFER_SIZE]));
    buffer.0[..request.len()].copy_from_slice(request);
    let address = space
        .bus_address(buffer.0.as_ptr() as usize)
        .context(FirmwareBufferSnafu)?;
    mailbox.send_properties(address).context(FirmwareSnafu)?;
    // SAFETY: the buffer is owned here; the firmware wrote it behind the compiler's back.
    let answer = unsafe { core::ptr::read_volatile(&buffer.0) };
    let mut message = message;
    let length = message.as_bytes().len();
    message.as_bytes_mut().copy_from_slice(&answer[..length]);
    Ok(message)
}

/// Power the SD host and return its base clock.
fn prepare_sd_host(mailbox: &Mailbox<Mmio>, space: &dyn AddressSpace) -> Result<u32, Error> {
    let message = PropertyMessage::new()
        .with_tag(
            tag::SET_POWER_STATE,
            &[device::SDHCI, device::POWER_STATE_ON],
            2,
        )
        .with_tag(tag::GET_CLOCK_RATE, &[clock::EMMC], 2);
    let answer = firmware_request(mailbox, space, message)?;
    let power = answer.response(tag::SET_POWER_STATE).context(FirmwareSnafu)?;
    if power[1] & 1 == 0 {
        warn!("firmware left the SD host off ({:#x})", power[1]);
    }
    let rate = answer.response(tag::GET_CLOCK_RATE).context(FirmwareSnafu)?;
    debug!("EMMC clock {}Hz", rate[1]);
    Ok(rate[1])
}

/// Start the GPIO block on the parent line it was given. The controller's lock level is set from
/// the line before the controller starts, so interrupt preparation already runs at it.
fn start_gpio(
    registers: Arc<Mmio>,
    line: &InterruptResources,
) -> Result<GpioController, Error> {
    let gpio = GpioController::new(
        GpioRegistration {
            functions: Box::new(Bcm2709Gpio::new(registers)),
            line_count: gpio::bcm2709::LINE_COUNT,
            features: GpioFeatures::INTERRUPTS,
        },
        Arc::new(ProcessorRunLevel),
    )
    .context(GpioSnafu)?;
    gpio.set_interrupt_run_level(line.run_level);
    gpio.start(Some(line.line)).context(GpioSnafu)?;
    Ok(gpio)
}

fn gpio_connection(gpio: &Arc<GpioController>) -> Connection {
    let service = gpio.clone();
    let worker = gpio.clone();
    Connection {
        service: Some(Arc::new(move || service.interrupt_service())),
        worker: Some(Arc::new(move || {
            worker.run_deferred();
            InterruptStatus::Claimed
        })),
    }
}

/// Dispatch one interrupt with every device masked. Locks taken by service routines then return
/// to this level rather than unmasking the processor mid-interrupt.
fn dispatch_at_device_level<S: InterruptSource + ?Sized>(
    dispatcher: &Dispatcher,
    controller: &S,
) -> InterruptStatus {
    let old = ProcessorRunLevel.raise(RunLevel::MAX_DEVICE);
    let status = match dispatcher.dispatch(controller) {
        Ok(status) => status,
        Err(error) => {
            warn!("{error}");
            InterruptStatus::NotClaimed
        }
    };
    ProcessorRunLevel.lower(old);
    status
}

impl Board {
    /// Start every device.
    ///
    /// # Safety
    /// Each resource list must describe the hardware it is named for, and the address space must
    /// map device memory uncached.
    pub unsafe fn start(resources: &DeviceResources, space: &dyn AddressSpace) -> Result<Self, Error> {
        // SAFETY for every map_window below: guaranteed by the caller.
        let system_block = Arc::new(unsafe { map_window(space, &resources.system_timer, "system timer")? });
        let arm_block = Arc::new(unsafe { map_window(space, &resources.arm_timer, "ARM timer")? });
        arch::init_time(unsafe { map_window(space, &resources.system_timer, "system timer")? });
        let timers = Arc::new(Bcm2709Timers::new(
            arm_block,
            system_block,
            &Bcm2709TimerConfig {
                apb_clock_frequency: APB_CLOCK_FREQUENCY,
                system_timer_frequency: SYSTEM_TIMER_FREQUENCY,
                arm_timer_line: ARM_TIMER_LINE,
                system_timer_line_base: SYSTEM_TIMER_LINE_BASE,
            },
        ));
        timers.system_periodic1.initialize().context(TimerSnafu)?;
        let clock_line = timers
            .system_periodic1
            .interrupt_line()
            .context(NoClockLineSnafu)?;

        let mailbox = Mailbox::new(
            unsafe { map_window(space, &resources.mailbox, "mailbox")? },
            Arc::new(SystemTime),
        );

        let gpio_line = resources
            .gpio
            .interrupt()
            .context(ResourcesSnafu { device: "GPIO" })?;
        let gpio = start_gpio(
            Arc::new(unsafe { map_window(space, &resources.gpio, "GPIO")? }),
            &gpio_line,
        )?;

        let i2c_line = resources
            .i2c
            .interrupt()
            .context(ResourcesSnafu { device: "I2C" })?;
        let i2c = Bcm2709I2c::new(
            Arc::new(unsafe { map_window(space, &resources.i2c, "I2C")? }),
            SystemTime,
        );
        i2c.initialize();
        let i2c = Arc::new(SpbController::new(Box::new(i2c)));

        let sd_line = resources
            .sd
            .interrupt()
            .context(ResourcesSnafu { device: "SD" })?;
        let mut parameters = SdParameters::new(Arc::new(SystemTime));
        parameters.standard_registers =
            Some(Arc::new(unsafe { map_window(space, &resources.sd, "SD")? }));
        parameters.fundamental_clock = prepare_sd_host(&mailbox, space)?;
        parameters.voltages = Voltages::V32_33 | Voltages::V33_34;
        let sd = Arc::new(SdController::new(parameters).context(SdSnafu)?);
        match sd.initialize(true) {
            Ok(()) => {}
            Err(sd::Error::NoMedia) => info!("SD slot empty"),
            Err(error) => warn!("SD card failed to start: {error}"),
        }

        let board = Self {
            timers,
            gpio: Arc::new(gpio),
            i2c,
            sd,
            dispatcher: Dispatcher::new(),
            lines: [gpio_line, i2c_line, sd_line],
            clock_line,
        };
        board.connect_all()?;
        Ok(board)
    }

    fn connect_all(&self) -> Result<(), Error> {
        let timers = self.timers.clone();
        let clock = Connection {
            service: Some(Arc::new(move || {
                timers.system_periodic1.acknowledge_interrupt();
                arch::clock_tick();
                InterruptStatus::Claimed
            })),
            worker: None,
        };
        let gpio = gpio_connection(&self.gpio);
        let [gpio_line, i2c_line, sd_line] = self.lines;
        let connections = [
            (self.clock_line, clock),
            (gpio_line.line, gpio),
            (i2c_line.line, self.i2c.connection()),
            (sd_line.line, self.sd.connection()),
        ];
        for (line, connection) in connections {
            // Devices live as long as the board, so nothing is ever disconnected.
            let _: InterruptHandle = self
                .dispatcher
                .connect(line, connection)
                .context(ConnectSnafu)?;
        }
        Ok(())
    }

    /// Enable every device line on `controller` and start the clock interrupt.
    ///
    /// # Errors
    /// Returns the controller's error for a line it rejects, or the timer's if it cannot be
    /// armed.
    pub fn enable_interrupts<S: InterruptSource + ?Sized>(&self, controller: &S) -> Result<(), Error> {
        let enabled = |resources: &InterruptResources| LineState {
            enabled: true,
            mode: resources.mode,
            polarity: resources.polarity,
            ..LineState::default()
        };
        controller
            .set_line_state(
                self.clock_line,
                &LineState {
                    enabled: true,
                    ..LineState::default()
                },
            )
            .context(InterruptSnafu)?;
        for line in &self.lines {
            controller
                .set_line_state(line.line, &enabled(line))
                .context(InterruptSnafu)?;
        }
        self.timers
            .system_periodic1
            .arm(TimerMode::Periodic, SYSTEM_TIMER_FREQUENCY / CLOCK_RATE_HZ)
            .context(TimerSnafu)?;
        info!("board interrupts enabled, clock at {CLOCK_RATE_HZ}Hz");
        Ok(())
    }

    /// Handle one interrupt from `controller`, then run deferred work if it is safe to.
    pub fn handle_interrupt<S: InterruptSource + ?Sized>(&self, controller: &S) -> InterruptStatus {
        dispatch_at_device_level(&self.dispatcher, controller)
    }

    /// Run deferred interrupt work. Must be called at low run level.
    pub fn run_deferred(&self) -> usize {
        self.dispatcher.run_deferred()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, Ordering};
    use drivers_core::{
        interrupt::{InterruptCause, Polarity, TriggerMode},
        resources::Allocation,
    };
    use std::vec;

    use crate::arch::{interrupts_masked, RUN_LEVEL_TESTS};

    const GPIO_WORDS: usize = 64;

    fn gpio_line() -> InterruptResources {
        InterruptResources {
            line: 49,
            mode: TriggerMode::Level,
            polarity: Polarity::High,
            vector: 0x31,
            run_level: RunLevel(5),
        }
    }

    /// A GPIO block backed by ordinary memory, with its event status cleared after start.
    fn quiet_gpio(words: &mut [u32; GPIO_WORDS]) -> GpioController {
        let base = words.as_mut_ptr() as usize;
        let registers = unsafe { Mmio::new(base, GPIO_WORDS * 4) }.unwrap();
        let gpio = start_gpio(Arc::new(registers), &gpio_line()).unwrap();
        // SAFETY: the buffer outlives the controller and is only touched through `base`.
        unsafe { core::ptr::write_bytes(base as *mut u32, 0, GPIO_WORDS) };
        gpio
    }

    /// A top-level controller with one line permanently firing.
    struct OneLine {
        line: Line,
        masked_at_end: AtomicBool,
    }

    impl InterruptSource for OneLine {
        type Token = ();

        fn initialize_io_unit(&self) -> Result<(), interrupt::Error> {
            Ok(())
        }

        fn set_line_state(&self, _line: Line, _state: &LineState) -> Result<(), interrupt::Error> {
            Ok(())
        }

        fn mask_line(&self, _line: Line, _enable: bool) {}

        fn begin(&self) -> InterruptCause<()> {
            InterruptCause::LineFired {
                line: self.line,
                token: (),
            }
        }

        fn end_of_interrupt(&self, _token: ()) {
            self.masked_at_end.store(interrupts_masked(), Ordering::SeqCst);
        }
    }

    /// An address space where nothing can be mapped.
    struct NoMappings;

    impl AddressSpace for NoMappings {
        fn map_registers(&self, _base: u64, _size: u64) -> Option<usize> {
            None
        }

        fn bus_address(&self, _virtual_address: usize) -> Option<u32> {
            None
        }
    }

    #[test]
    fn missing_window_names_the_device() {
        let result = unsafe { Board::start(&DeviceResources::default(), &NoMappings) };
        match result {
            Err(Error::Resources { device, .. }) => assert_eq!(device, "system timer"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("started without resources"),
        }
    }

    #[test]
    fn unmappable_window_is_reported() {
        let resources = DeviceResources {
            system_timer: ResourceList::new(vec![Allocation::PhysicalAddressSpace {
                base: 0x3F00_3000,
                size: 0x1000,
            }]),
            ..DeviceResources::default()
        };
        let result = unsafe { Board::start(&resources, &NoMappings) };
        assert!(matches!(
            result,
            Err(Error::Unmapped {
                base: 0x3F00_3000,
                size: 0x1000
            })
        ));
    }

    #[test]
    fn gpio_runs_at_its_line_level() {
        let _serial = RUN_LEVEL_TESTS.lock();
        let mut words = Box::new([0u32; GPIO_WORDS]);
        let gpio = quiet_gpio(&mut words);
        assert_eq!(gpio.interrupt_run_level(), RunLevel(5));
        assert_eq!(gpio.interrupt_line(), Some(49));
        assert_eq!(ProcessorRunLevel.current(), RunLevel::LOW);
        assert!(!interrupts_masked());
    }

    #[test]
    fn gpio_lock_keeps_its_interrupt_out() {
        let _serial = RUN_LEVEL_TESTS.lock();
        let mut words = Box::new([0u32; GPIO_WORDS]);
        let gpio = quiet_gpio(&mut words);
        let guard = gpio.lock();
        assert_eq!(ProcessorRunLevel.current(), RunLevel(5));
        assert!(interrupts_masked());
        drop(guard);
        assert_eq!(ProcessorRunLevel.current(), RunLevel::LOW);
        assert!(!interrupts_masked());
    }

    #[test]
    fn gpio_service_stays_masked_until_dispatch_ends() {
        let _serial = RUN_LEVEL_TESTS.lock();
        let mut words = Box::new([0u32; GPIO_WORDS]);
        let gpio = Arc::new(quiet_gpio(&mut words));
        let dispatcher = Dispatcher::new();
        let _ = dispatcher.connect(49, gpio_connection(&gpio)).unwrap();
        let controller = OneLine {
            line: 49,
            masked_at_end: AtomicBool::new(false),
        };
        assert_eq!(
            dispatch_at_device_level(&dispatcher, &controller),
            InterruptStatus::NotClaimed
        );
        assert!(controller.masked_at_end.load(Ordering::SeqCst));
        assert!(!dispatcher.has_deferred_work());
        assert_eq!(ProcessorRunLevel.current(), RunLevel::LOW);
        assert!(!interrupts_masked());
    }
}
