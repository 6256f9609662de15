//! Common module for library exports

pub use crate::bitness::{Bitness, PointerWidth};
pub use crate::config::{SessionConfig, SymbolOptions};
pub use crate::engine::{BusSlot, DebugEngine, FixtureEngine, HResult};
pub use crate::error::{LkdError, Result};
pub use crate::output::{CapturedOutput, OutputCallbacks, StandardOutput};
pub use crate::platform::connect_local_kernel;
pub use crate::session::{KernelSession, SymbolMatches, WideText};
pub use crate::types::{Address, FieldDescriptor, ModuleRecord, ProcessorData, ProcessorDataKind, SymbolRef, TypeId, TypeRef};
