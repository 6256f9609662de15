//! # Platform-Specific Implementations
//!
//! Bootstrap of a session against the host's native debugging engine.
//!
//! - **Windows**: the DbgEng COM engine attached to the local kernel
//!   - See: [Debugger Engine Reference](https://learn.microsoft.com/en-us/windows-hardware/drivers/debugger/debugger-engine-reference)
//! - **Everything else**: no native engine; [`connect_local_kernel`] fails with
//!   `Unsupported` and only [`FixtureEngine`](crate::engine::FixtureEngine) is
//!   available.

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "windows")]
pub use self::windows::DbgEngEngine;

use tracing::info;

use crate::bitness::PointerWidth;
use crate::config::SessionConfig;
use crate::engine::DebugEngine;
use crate::error::Result;
use crate::session::KernelSession;

/// Attach to the local kernel and return a ready session.
///
/// The width is detected from the engine unless given. After attaching,
/// every loaded module's symbols are reloaded once.
///
/// ## Errors
///
/// - `Unsupported`: the host has no native debugging engine
/// - `EngineCallFailed`: the engine could not be created or attached
#[cfg(target_os = "windows")]
pub fn connect_local_kernel(
    config: SessionConfig,
    width: Option<PointerWidth>,
) -> Result<KernelSession<impl DebugEngine>>
{
    let engine = DbgEngEngine::attach_local_kernel()?;
    let mut session = match width {
        Some(width) => KernelSession::new(engine, width, config)?,
        None => KernelSession::detect(engine, config)?,
    };
    let reloaded = session.load_module_symbols()?;
    info!("Attached to local kernel ({} target, {} modules)", session.width(), reloaded);
    Ok(session)
}

/// Attach to the local kernel and return a ready session.
///
/// ## Errors
///
/// - `Unsupported`: always; the native engine only exists on Windows
#[cfg(not(target_os = "windows"))]
pub fn connect_local_kernel(
    config: SessionConfig,
    width: Option<PointerWidth>,
) -> Result<KernelSession<impl DebugEngine>>
{
    use crate::engine::FixtureEngine;
    use crate::error::LkdError;

    info!(
        "Local kernel requested ({:?}, width {:?}) on a host without DbgEng",
        config.symbol_path, width
    );
    Err::<KernelSession<FixtureEngine>, _>(LkdError::Unsupported(format!(
        "local kernel debugging requires the Windows debugging engine (host: {})",
        std::env::consts::OS
    )))
}
