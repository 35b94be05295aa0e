//! VRP payload storage: snapshots ([`VrpSet`]), the differences between
//! consecutive snapshots ([`Delta`]), and the retained run of both that the
//! RTR session layer serves to clients ([`History`] / [`SharedHistory`]).

pub use self::delta::{Action, Delta};
pub use self::history::{shared, DiffResult, History, SharedHistory};
pub use self::snapshot::VrpSet;

mod delta;
mod history;
mod snapshot;

