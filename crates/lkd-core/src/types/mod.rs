//! # Types
//!
//! Engine-agnostic types used throughout the session.
//!
//! These types keep target addresses, engine addresses, symbol references and
//! type references apart, so the rest of the crate never has to guess which
//! form a bare `u64` is in.

pub mod address;
pub mod processor;
pub mod symbols;
pub mod typeinfo;

// Re-export all public types
pub use address::{Address, CanonicalAddress};
pub use processor::{FixedLayout, ListEntry32, ListEntry64, ProcessorData, ProcessorDataKind};
pub use symbols::{FieldDescriptor, ModuleRecord, SymbolHit, SymbolRef, TypeId, TypeRef};
pub use typeinfo::{ChildTypes, TypeInfo, TypeInfoOut, TypeInfoSelector, TypeInfoShape};
