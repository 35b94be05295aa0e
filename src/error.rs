//! Error types used by multiple modules.
//!
//! There are two error types used widely across the crate.
//!
//! [`Failed`] indicates that an operation — a refresh cycle, a client
//! session — had to be abandoned for some reason and the caller can
//! assume all diagnostic information has already been logged; it need
//! not do anything further than give up on that one operation.
//!
//! [`ExitError`] is used when the whole process should terminate. It
//! carries enough information to pick the process exit code.

use log::error;


//------------ Failed ---------------------------------------------------------

/// An operation has failed to complete.
#[derive(Clone, Copy, Debug)]
pub struct Failed;


//------------ ExitError -------------------------------------------------------

/// A fatal startup error that should lead to terminating the process.
#[derive(Clone, Copy, Debug)]
pub enum ExitError {
    /// A runtime error — can't bind a listener, can't read a required
    /// file, etc. Exit status 1.
    Generic,

    /// The command line or config file was malformed. Exit status 2.
    BadArgs,
}

impl ExitError {
    pub fn exit_code(self) -> i32 {
        match self {
            ExitError::Generic => 1,
            ExitError::BadArgs => 2,
        }
    }
}

impl From<Failed> for ExitError {
    fn from(_: Failed) -> ExitError {
        error!("Fatal error. Exiting.");
        ExitError::Generic
    }
}
