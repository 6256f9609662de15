//! # Windows Debugging Engine
//!
//! [`DbgEngEngine`] drives the DbgEng COM engine (`dbgeng.dll`) attached to
//! the local kernel.
//!
//! ## Dependencies
//!
//! - **windows crate**: COM bindings for `IDebugClient`, `IDebugControl`,
//!   `IDebugDataSpaces2`, `IDebugSymbols3` and the output callback interface
//! - **extern "system"**: `SymGetTypeInfo` and the few kernel32 helpers it
//!   needs, declared in `ffi`
//!
//! Local kernel debugging needs an elevated process and a host booted with
//! `bcdedit /debug on`.

mod engine;
mod ffi;
mod output;

pub use engine::DbgEngEngine;
