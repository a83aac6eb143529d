//! Wiring CLI Library
//!
//! Commands for running a wiring node from the shell: `serve` exports an echo
//! endpoint and waits, `send` delivers one message to a remote endpoint, and
//! `demo` runs two nodes in one process over an in-memory directory.

pub mod demo;
pub mod echo;
pub mod options;
pub mod send;
pub mod serve;

pub use demo::DemoCommand;
pub use echo::EchoService;
pub use options::NodeArgs;
pub use send::SendCommand;
pub use serve::ServeCommand;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
