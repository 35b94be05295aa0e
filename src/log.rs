//! Logging setup.
//!
//! A single `fern` dispatch is built once at startup from [`Config`] and
//! installed as the global `log` backend. Everything past that point logs
//! through the ordinary `log::{error,warn,info,debug}!` macros.

use log::LevelFilter;

use crate::config::Config;
use crate::error::ExitError;

/// Initializes the global logger.
///
/// Verbosity is controlled by `-v`/`-vv` on the command line: the default
/// is `warn`, one `-v` raises it to `info`, two or more to `debug`.
pub fn init(config: &Config) -> Result<(), ExitError> {
    let level = match config.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Utc::now().to_rfc3339(),
                record.level(),
                record.target(),
                message,
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Some(path) = &config.log_file {
        let file = fern::log_file(path).map_err(|err| {
            log::error!("Fatal: failed to open log file '{}': {}", path.display(), err);
            ExitError::Generic
        })?;
        dispatch = dispatch.chain(file);
    }

    dispatch.apply().map_err(|err| {
        eprintln!("Fatal: failed to initialize logging: {}", err);
        ExitError::Generic
    })
}
