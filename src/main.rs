use std::process::exit;

use rtrd::config::Config;
use rtrd::error::ExitError;
use rtrd::{log, process};

fn main() {
    exit(match _main() {
        Ok(()) => 0,
        Err(err) => err.exit_code(),
    });
}

fn _main() -> Result<(), ExitError> {
    let config = Config::from_args()?;
    log::init(&config)?;

    let runtime = tokio::runtime::Runtime::new().map_err(|err| {
        eprintln!("Fatal: failed to start the async runtime: {}", err);
        ExitError::Generic
    })?;
    runtime.block_on(process::run(config))
}
