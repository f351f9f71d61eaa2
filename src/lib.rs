//! sourcelens: command-line front end for the symbol lookup daemon.
//!
//! The heavy lifting lives in the `lens_daemon` crate; this crate holds the
//! CLI definition, the socket client with auto-start, and the command handlers.

pub mod cli;
pub mod client;
pub mod commands;

pub use client::{ClientConfig, ClientError, DaemonClient};
