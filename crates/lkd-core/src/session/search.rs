//! Wildcard symbol search.
//!
//! A search is an engine-held cursor. [`SymbolMatches`] wraps it in a small
//! state machine (open, exhausted, closed) and guarantees the cursor is ended
//! exactly once: on exhaustion, on an explicit [`SymbolMatches::close`], on
//! an engine error, or when the iterator is dropped early.

use tracing::{debug, trace, warn};

use super::{decode_name, KernelSession, NAME_BUFFER_SIZE};
use crate::engine::{DebugEngine, HResult, SearchHandle};
use crate::error::{EngineResultExt, LkdError, Result};
use crate::types::Address;

/// Upper bound of the match buffer; a name longer than this is an engine fault.
const MAX_MATCH_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor
{
    Open(SearchHandle),
    Exhausted,
    Closed,
}

impl<E: DebugEngine> KernelSession<E>
{
    /// Enumerate symbols matching a wildcard pattern (`nt!Create*`, `*!KeBugCheck*`).
    ///
    /// Matches come back in engine order as `(name, address)`. When a name
    /// does not fit the match buffer the buffer doubles and the same step is
    /// retried; nothing is yielded twice.
    ///
    /// ## Errors
    ///
    /// - `EngineCallFailed`: the engine refused to open the search
    ///
    /// ## Example
    ///
    /// ```rust
    /// use lkd_core::bitness::PointerWidth;
    /// use lkd_core::config::SessionConfig;
    /// use lkd_core::engine::FixtureEngine;
    /// use lkd_core::session::KernelSession;
    ///
    /// let engine = FixtureEngine::new()
    ///     .with_symbol("nt!NtCreateFile", 0x1000)
    ///     .with_symbol("nt!NtClose", 0x2000);
    /// let session = KernelSession::new(engine, PointerWidth::Bits64, SessionConfig::default())?;
    /// for hit in session.symbol_match("nt!NtCreate*")? {
    ///     let (name, address) = hit?;
    ///     println!("{name} at {address}");
    /// }
    /// # Ok::<(), lkd_core::error::LkdError>(())
    /// ```
    pub fn symbol_match(&self, pattern: &str) -> Result<SymbolMatches<'_, E>>
    {
        let handle = self
            .engine
            .start_symbol_match(pattern)
            .op("start_symbol_match")?;
        debug!("Opened symbol search {:?} for {:?}", handle, pattern);
        Ok(SymbolMatches {
            session: self,
            cursor: Cursor::Open(handle),
            buffer: vec![0u8; NAME_BUFFER_SIZE],
        })
    }
}

/// Iterator over `(name, address)` symbol matches
///
/// Created by [`KernelSession::symbol_match`].
pub struct SymbolMatches<'a, E: DebugEngine>
{
    session: &'a KernelSession<E>,
    cursor: Cursor,
    buffer: Vec<u8>,
}

impl<E: DebugEngine> SymbolMatches<'_, E>
{
    /// End the search before it is exhausted.
    ///
    /// Closing an exhausted or closed search does nothing.
    pub fn close(&mut self) -> Result<()>
    {
        match self.cursor {
            Cursor::Open(handle) => {
                self.cursor = Cursor::Closed;
                debug!("Closing symbol search {:?}", handle);
                self.session
                    .engine
                    .end_symbol_match(handle)
                    .op("end_symbol_match")
            }
            Cursor::Exhausted | Cursor::Closed => Ok(()),
        }
    }

    /// Whether the engine cursor is still open.
    pub fn is_open(&self) -> bool
    {
        matches!(self.cursor, Cursor::Open(_))
    }

    /// End the cursor after the sequence finished or failed.
    fn finish(&mut self, handle: SearchHandle, next: Cursor) -> Result<()>
    {
        self.cursor = next;
        self.session
            .engine
            .end_symbol_match(handle)
            .op("end_symbol_match")
    }
}

impl<E: DebugEngine> Iterator for SymbolMatches<'_, E>
{
    type Item = Result<(String, Address)>;

    fn next(&mut self) -> Option<Self::Item>
    {
        let Cursor::Open(handle) = self.cursor else {
            return None;
        };
        loop {
            match self
                .session
                .engine
                .get_next_symbol_match(handle, &mut self.buffer)
            {
                Ok((size, raw)) => {
                    let name = decode_name("symbol_match", &self.buffer, size);
                    let address = self.session.trim(raw);
                    trace!("Symbol match {} at {}", name, address);
                    return Some(Ok((name, address)));
                }
                Err(HResult::S_FALSE) => {
                    let grown = self.buffer.len() * 2;
                    if grown > MAX_MATCH_BUFFER {
                        let error = LkdError::ShortTransfer {
                            operation: "symbol_match",
                            expected: grown,
                            actual: self.buffer.len(),
                        };
                        if let Err(e) = self.finish(handle, Cursor::Closed) {
                            warn!("Failed to end symbol search: {}", e);
                        }
                        return Some(Err(error));
                    }
                    debug!("Symbol match buffer too small, growing to {} bytes", grown);
                    self.buffer.resize(grown, 0);
                }
                Err(HResult::E_NOINTERFACE) => {
                    debug!("Symbol search {:?} exhausted", handle);
                    return self.finish(handle, Cursor::Exhausted).err().map(Err);
                }
                Err(status) => {
                    if let Err(e) = self.finish(handle, Cursor::Closed) {
                        warn!("Failed to end symbol search: {}", e);
                    }
                    return Some(Err(LkdError::engine("symbol_match", status)));
                }
            }
        }
    }
}

impl<E: DebugEngine> Drop for SymbolMatches<'_, E>
{
    fn drop(&mut self)
    {
        if let Err(e) = self.close() {
            warn!("Failed to end abandoned symbol search: {}", e);
        }
    }
}
