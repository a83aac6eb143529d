//! Wiring Common
//!
//! Shared utilities for the wiring crates.
//!
//! This crate provides:
//! - Component-based structured logging with node ID context
//! - `log_*!` macros that forward to [`Logger`] without allocating
//! - Small collection helpers used by configuration code

pub mod logging;
#[macro_use]
mod macros;

pub use logging::{Component, LogLevel, Logger, LoggingConfig};
