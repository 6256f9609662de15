//! # Output Callbacks
//!
//! Sinks for the text the engine produces while running commands.
//!
//! The engine holds a reference to the active sink until it is replaced, so
//! sinks are shared as `Arc<dyn OutputCallbacks>`.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use tracing::warn;

/// Receiver of engine output text
pub trait OutputCallbacks: Send + Sync
{
    /// Called by the engine for every chunk of output. `mask` is the engine's
    /// `DEBUG_OUTPUT_*` category.
    fn output(&self, mask: u32, text: &str);
}

/// Default sink: writes engine output to stdout unless quiet.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardOutput
{
    quiet: bool,
}

impl StandardOutput
{
    pub fn new(quiet: bool) -> Self
    {
        Self { quiet }
    }

    pub fn is_quiet(&self) -> bool
    {
        self.quiet
    }
}

impl OutputCallbacks for StandardOutput
{
    fn output(&self, _mask: u32, text: &str)
    {
        if self.quiet {
            return;
        }
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(text.as_bytes()).and_then(|()| stdout.flush()) {
            warn!("Failed to forward engine output: {}", e);
        }
    }
}

/// Sink that accumulates engine output in memory.
///
/// Installed temporarily by `execute(.., capture_output = true)`.
#[derive(Debug, Default)]
pub struct CapturedOutput
{
    buffer: Mutex<String>,
}

impl CapturedOutput
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Take the accumulated text, leaving the buffer empty.
    pub fn take(&self) -> String
    {
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl OutputCallbacks for CapturedOutput
{
    fn output(&self, _mask: u32, text: &str)
    {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
    }
}
