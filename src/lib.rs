//! A server for the RPKI-to-Router protocol.
//!
//! This crate fetches a validated ROA payload (VRP) set from an upstream
//! JSON source, optionally overlays a local SLURM (RFC 8416) exceptions
//! file, and serves the result to routers speaking RTR (RFC 6810/8210)
//! over plain TCP, TLS, or SSH. Clients that stay connected receive
//! incremental updates as the upstream set changes; clients that fall too
//! far behind (or connect for the first time) get a full Cache Reset.
//!
//! The main entry point for running the server is [`process::run`].

pub mod config;
pub mod error;
pub mod fetch;
pub mod http;
pub mod log;
pub mod metrics;
pub mod payload;
pub mod process;
pub mod refresh;
pub mod rtr;
pub mod slurm;
pub mod tls;
pub mod vrp;
