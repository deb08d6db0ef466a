//! Common infrastructure for the peerlink stack.
//!
//! Everything here is ambient: error types shared by the binaries, tracing
//! setup, layered configuration loading and tracked task spawning with
//! cooperative cancellation.

pub mod config;
pub mod errors;
pub mod logging;
pub mod tasks;

pub use errors::{Error, ErrorContext, ErrorExt, Result};
pub use logging::{setup_logging, LogContext, LoggingConfig};
pub use tasks::{TaskManager, TaskStats};
