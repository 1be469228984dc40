use std::error::Error;

use log::LevelFilter;
use simple_logger::SimpleLogger;

/// Installs the global logger.
///
/// Only `txstorm` records pass; HTTP and runtime internals stay silent.
pub fn init(verbosity: usize) -> Result<(), Box<dyn Error>> {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    SimpleLogger::new()
        .with_level(LevelFilter::Off)
        .with_module_level("txstorm", level)
        .with_utc_timestamps()
        .init()?;

    Ok(())
}
