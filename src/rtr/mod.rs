//! The RPKI-to-Router protocol: wire codec, serial arithmetic, per-client
//! session state machine, and the listeners that accept connections over
//! TCP, TLS and SSH.

pub use self::notify::{channel, Listener, Notifier};
pub use self::pdu::{Pdu, PduError, Timing};
pub use self::serial::Serial;
pub use self::server::rtr_listener;

pub mod notify;
pub mod pdu;
pub mod serial;
pub mod server;
pub mod session;
mod ssh;
