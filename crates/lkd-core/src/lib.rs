//! # lkd-core
//!
//! Host-side controller core for live kernel debugging.
//!
//! The crate sits on top of a vendor debugging engine attached to a kernel
//! and offers a flat, procedural API for:
//! - Symbol and type resolution (name to address, type name to type id)
//! - Virtual, physical, I/O port, PCI configuration and MSR access
//! - Type layout introspection (field names, offsets, children)
//! - Wildcard symbol search
//! - Command pass-through and disassembly
//!
//! Every target address crosses a bitness adapter on its way into and out of
//! the engine, so 32-bit and 64-bit targets share one code path.
//!
//! ## Platform Support
//!
//! - **Windows**: DbgEng attached to the local kernel ([`platform::connect_local_kernel`])
//! - **Everywhere**: [`engine::FixtureEngine`], a deterministic in-memory engine
//!
//! ## Why unsafe code is needed
//!
//! The Windows engine is a COM object and the type-info query is a dbghelp
//! export. Both are reached through FFI; everything else is safe Rust.

#![allow(unsafe_code)] // Required for the DbgEng COM and dbghelp bindings

pub mod bitness;
pub mod config;
pub mod engine;
pub mod error;
pub mod output;
pub mod platform;
pub mod prelude;
pub mod session;
pub mod types;

pub use bitness::{Bitness, PointerWidth};
pub use config::SessionConfig;
pub use engine::{DebugEngine, FixtureEngine, HResult};
// Re-export commonly used types
pub use error::{LkdError, Result};
pub use platform::connect_local_kernel;
pub use session::KernelSession;
pub use types::{Address, CanonicalAddress, SymbolRef, TypeId, TypeRef};
