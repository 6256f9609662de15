//! # Error Types
//!
//! General error handling for the kernel debugging session.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.

use thiserror::Error;

use crate::engine::HResult;

/// Main error type for session operations
///
/// This enum represents all the ways a symbol, type, or memory operation can
/// fail. Each variant corresponds to a specific error condition the caller may
/// want to tell apart.
///
/// ## Error Categories
///
/// 1. **Resolution errors**: UnknownSymbol, UnknownType
/// 2. **Engine errors**: EngineCallFailed (raw status of a failed engine call)
/// 3. **Transfer errors**: ShortTransfer (fixed-width helpers only)
/// 4. **Capability errors**: NotImplemented, Unsupported
/// 5. **Argument errors**: InvalidArgument
/// 6. **I/O errors**: Io (for file operations, etc.)
#[derive(Error, Debug)]
pub enum LkdError
{
    /// A symbol name did not resolve to an address
    ///
    /// Raised by every operation that accepts a symbol reference when the
    /// engine has no match for the name. Unresolved names never default to
    /// address zero.
    #[error("Unknown symbol <{0}>")]
    UnknownSymbol(String),

    /// The module resolved but the type name is not valid inside it
    ///
    /// Kept distinct from `UnknownSymbol` so callers can tell "no such
    /// module" from "module found, no such type".
    #[error("Unknown type <{module}!{type_name}>")]
    UnknownType
    {
        /// Module reference as supplied by the caller
        module: String,
        /// Type name that failed to resolve
        type_name: String,
    },

    /// A call into the debugging engine returned a failure status
    ///
    /// The operation name identifies the session-level operation that issued
    /// the call (e.g. `read_virtual`), the status is the raw engine code.
    #[error("{operation} failed: {status}")]
    EngineCallFailed
    {
        /// Operation that issued the failing engine call
        operation: &'static str,
        /// Raw status returned by the engine
        status: HResult,
    },

    /// A transfer moved fewer bytes than an exact-width helper requires
    ///
    /// The raw `read_*`/`write_*` operations report the transferred length
    /// instead; only helpers that decode or encode a fixed width raise this.
    #[error("{operation}: short transfer ({actual} of {expected} bytes)")]
    ShortTransfer
    {
        /// Operation that observed the short transfer
        operation: &'static str,
        /// Number of bytes required
        expected: usize,
        /// Number of bytes actually transferred
        actual: usize,
    },

    /// The operation exists but has no implementation for this configuration
    ///
    /// Examples:
    /// - Pointer helpers on a bitness strategy that does not declare a width
    /// - Type-info selectors that require a caller-built output buffer
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Invalid argument passed to a session function
    ///
    /// Examples:
    /// - An I/O access width other than 1, 2 or 4
    /// - An address string that is neither a number nor a symbol
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The debugging engine is not available on this platform
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// I/O error (for file operations, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LkdError
{
    /// Wrap a failed engine status with the name of the operation that issued it.
    pub fn engine(operation: &'static str, status: HResult) -> Self
    {
        LkdError::EngineCallFailed { operation, status }
    }

    /// Raw engine status if this error came from a failed engine call.
    #[must_use]
    pub fn status(&self) -> Option<HResult>
    {
        match self {
            LkdError::EngineCallFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Convenience type alias for `Result<T, LkdError>`
///
/// ```rust
/// use lkd_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, LkdError>;

/// Extension used at every engine call site to tag failures with an operation name.
pub(crate) trait EngineResultExt<T>
{
    fn op(self, operation: &'static str) -> Result<T>;
}

impl<T> EngineResultExt<T> for std::result::Result<T, HResult>
{
    fn op(self, operation: &'static str) -> Result<T>
    {
        self.map_err(|status| LkdError::engine(operation, status))
    }
}
