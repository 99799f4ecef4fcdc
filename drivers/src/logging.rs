//! Global logger installation.
use log::{debug, info, LevelFilter, SetLoggerError};
use spin::once::Once;

use drivers_core::{
    logger::{LogStamp, Logger, Stamp, DEFAULT_CHUNK_COUNT},
    run_level::RunLevelControl,
};

use crate::{
    arch::{self, ProcessorRunLevel},
    mmio::Mmio,
    uart,
};

/// Stamps records with the system counter and the current run level.
struct BoardStamp;

impl LogStamp for BoardStamp {
    fn stamp() -> Stamp {
        Stamp {
            counter: arch::read_counter(),
            run_level: ProcessorRunLevel.current(),
        }
    }
}

/// The global logger instance.
static LOGGER: Once<Logger<uart::PL011<Mmio>, BoardStamp>> = Once::new();

/// Install the global logger writing to `uart`.
///
/// # Errors
/// Returns an error if a logger was already installed.
pub fn init_logging(uart: uart::PL011<Mmio>, level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(LOGGER.call_once(|| Logger::new(uart, level, DEFAULT_CHUNK_COUNT)) as _)?;
    log::set_max_level(level);

    info!(
        "\x1b[1mBCM2709 drivers\x1b[0m v{} (git: {}@{})",
        env!("CARGO_PKG_VERSION"),
        env!("VERGEN_GIT_BRANCH"),
        env!("VERGEN_GIT_SHA"),
    );
    debug!("Build timestamp: {}", env!("VERGEN_BUILD_TIMESTAMP"));
    Ok(())
}
