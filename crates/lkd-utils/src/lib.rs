//! # lkd Utilities
//!
//! Shared utilities for the lkd workspace: logging initialisation built on
//! `tracing`, and re-exports of the `tracing` macros.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{init_logging, init_logging_for_shell, init_logging_with_level, LogFormat, LogLevel, LoggingError};
pub use tracing::{debug, error, info, trace, warn};
