//! The metrics/export HTTP server.
//!
//! The module provides all functionality exposed over HTTP: the
//! Prometheus metrics endpoint and the VRP JSON export. The only public
//! item, [`http_listener`], creates all necessary listeners based on the
//! current configuration and returns a future that drives them.

pub use self::listener::http_listener;
pub use self::response::ContentType;

mod dispatch;
mod export;
mod listener;
mod metrics;
mod response;

