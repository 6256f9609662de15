//! # Engine Interfaces
//!
//! The boundary between the session and the vendor debugging engine.
//!
//! The engine exposes four COM-style sub-interfaces: data-space access, symbol
//! and type management, execution control, and client control. Each one is a
//! trait here, and [`DebugEngine`] is their union. The session is generic over
//! `DebugEngine`, so the same code runs against the real engine on Windows
//! and against [`FixtureEngine`] everywhere else.
//!
//! ## Conventions
//!
//! - Every call returns `Result<T, HResult>`: the raw engine status is kept,
//!   the session tags it with an operation name.
//! - Address parameters are [`CanonicalAddress`]; addresses coming back are
//!   raw engine-width `u64` values the session trims.
//! - Name-returning calls write into a caller-owned buffer and report the size
//!   the engine wanted to write (terminating NUL included), the way the COM
//!   interfaces do. Buffer sizing is the caller's business.
//! - All methods take `&self`. The engine owns its own state, as a COM object
//!   does; implementations use interior mutability where they need it.

pub mod fixture;

use std::sync::Arc;

use thiserror::Error;

use crate::output::OutputCallbacks;
use crate::types::{CanonicalAddress, ProcessorDataKind, TypeId, TypeInfoOut, TypeInfoSelector};

pub use fixture::FixtureEngine;

/// Raw 32-bit engine status code
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[error("HRESULT 0x{0:08x}")]
pub struct HResult(pub u32);

impl HResult
{
    pub const S_OK: HResult = HResult(0);
    /// Also used by the engine as "buffer too small"
    pub const S_FALSE: HResult = HResult(1);
    pub const E_NOTIMPL: HResult = HResult(0x8000_4001);
    /// Also used by the engine as "no more results"
    pub const E_NOINTERFACE: HResult = HResult(0x8000_4002);
    pub const E_FAIL: HResult = HResult(0x8000_4005);
    pub const E_INVALIDARG: HResult = HResult(0x8007_0057);

    /// Whether the status has the severity bit set.
    pub const fn is_failure(self) -> bool
    {
        self.0 & 0x8000_0000 != 0
    }

    /// Symbolic name of well-known codes.
    pub fn name(self) -> Option<&'static str>
    {
        match self {
            HResult::S_OK => Some("S_OK"),
            HResult::S_FALSE => Some("S_FALSE"),
            HResult::E_NOTIMPL => Some("E_NOTIMPL"),
            HResult::E_NOINTERFACE => Some("E_NOINTERFACE"),
            HResult::E_FAIL => Some("E_FAIL"),
            HResult::E_INVALIDARG => Some("E_INVALIDARG"),
            _ => None,
        }
    }
}

impl From<i32> for HResult
{
    fn from(value: i32) -> Self
    {
        HResult(value as u32)
    }
}

/// Result of a raw engine call
pub type EngineResult<T> = std::result::Result<T, HResult>;

/// Opaque engine-held symbol search cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SearchHandle(pub u64);

/// Port I/O location: interface type, bus number and address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoLocation
{
    pub interface_type: u32,
    pub bus_number: u32,
    pub address_space: u32,
}

impl IoLocation
{
    /// ISA bus 0, I/O address space: plain `in`/`out` ports.
    pub const ISA_PORTS: IoLocation = IoLocation {
        interface_type: 1,
        bus_number: 0,
        address_space: 1,
    };
}

/// Bus-configuration slot addressed by `ReadBusData`/`WriteBusData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusSlot
{
    /// Bus data type (`PCIConfiguration` = 4)
    pub data_type: u32,
    pub bus_number: u32,
    pub slot: u32,
}

impl BusSlot
{
    /// `BUS_DATA_TYPE::PCIConfiguration`
    pub const PCI_CONFIGURATION: u32 = 4;

    /// PCI configuration space of `bus`/`slot`.
    pub const fn pci(bus_number: u32, slot: u32) -> Self
    {
        Self {
            data_type: Self::PCI_CONFIGURATION,
            bus_number,
            slot,
        }
    }
}

/// Reported sizes of the three names returned by `GetModuleNames`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleNameSizes
{
    pub image: usize,
    pub module: usize,
    pub loaded_image: usize,
}

/// Data-space access (`IDebugDataSpaces2`)
pub trait DataSpaces
{
    /// Read virtual memory, returning the number of bytes read.
    fn read_virtual(&self, offset: CanonicalAddress, buf: &mut [u8]) -> EngineResult<usize>;

    /// Write virtual memory, returning the number of bytes written.
    fn write_virtual(&self, offset: CanonicalAddress, data: &[u8]) -> EngineResult<usize>;

    fn read_physical(&self, offset: u64, buf: &mut [u8]) -> EngineResult<usize>;

    fn write_physical(&self, offset: u64, data: &[u8]) -> EngineResult<usize>;

    fn read_io(&self, location: IoLocation, port: u64, buf: &mut [u8]) -> EngineResult<usize>;

    fn write_io(&self, location: IoLocation, port: u64, data: &[u8]) -> EngineResult<usize>;

    fn read_bus_data(&self, slot: BusSlot, offset: u32, buf: &mut [u8]) -> EngineResult<usize>;

    fn write_bus_data(&self, slot: BusSlot, offset: u32, data: &[u8]) -> EngineResult<usize>;

    fn read_msr(&self, msr: u32) -> EngineResult<u64>;

    fn write_msr(&self, msr: u32, value: u64) -> EngineResult<()>;

    /// Translate a virtual address; fails if the address is not mapped.
    fn virtual_to_physical(&self, offset: CanonicalAddress) -> EngineResult<u64>;

    /// Read processor system data into `buf`, returning the size written.
    fn read_processor_system_data(&self, processor: u32, kind: ProcessorDataKind, buf: &mut [u8])
        -> EngineResult<usize>;
}

/// Symbol and type management (`IDebugSymbols3`, plus the dbghelp type query)
pub trait Symbols
{
    fn get_offset_by_name(&self, name: &str) -> EngineResult<u64>;

    /// Reverse lookup: `(reported name size, displacement)`.
    ///
    /// `E_FAIL` means no symbol covers the address.
    fn get_name_by_offset(&self, offset: CanonicalAddress, buf: &mut [u8]) -> EngineResult<(usize, u64)>;

    fn get_type_id(&self, module: CanonicalAddress, name: &str) -> EngineResult<TypeId>;

    /// `(type id, module base)` of a symbol.
    fn get_symbol_type_id(&self, symbol: &str) -> EngineResult<(TypeId, u64)>;

    fn get_type_name(&self, module: CanonicalAddress, type_id: TypeId, buf: &mut [u8]) -> EngineResult<usize>;

    fn get_type_size(&self, module: CanonicalAddress, type_id: TypeId) -> EngineResult<u32>;

    fn get_field_offset(&self, module: CanonicalAddress, type_id: TypeId, field: &str) -> EngineResult<u32>;

    /// Name of the field at `index`; fails past the last field.
    fn get_field_name(&self, module: CanonicalAddress, type_id: TypeId, index: u32, buf: &mut [u8])
        -> EngineResult<usize>;

    fn get_field_type_and_offset(&self, module: CanonicalAddress, type_id: TypeId, field: &str)
        -> EngineResult<(TypeId, u32)>;

    /// `(loaded, unloaded)` module counts.
    fn get_number_modules(&self) -> EngineResult<(u32, u32)>;

    fn get_module_by_index(&self, index: u32) -> EngineResult<u64>;

    fn get_module_names(
        &self,
        index: u32,
        base: CanonicalAddress,
        image: &mut [u8],
        module: &mut [u8],
        loaded_image: &mut [u8],
    ) -> EngineResult<ModuleNameSizes>;

    /// Reload symbols of `module`; an empty string reloads everything.
    fn reload(&self, module: &str) -> EngineResult<()>;

    fn start_symbol_match(&self, pattern: &str) -> EngineResult<SearchHandle>;

    /// Next match as `(reported name size, address)`.
    ///
    /// `Err(S_FALSE)` when the name does not fit `buf` (the cursor does not
    /// advance), `Err(E_NOINTERFACE)` once the matches are exhausted.
    fn get_next_symbol_match(&self, handle: SearchHandle, buf: &mut [u8]) -> EngineResult<(usize, u64)>;

    fn end_symbol_match(&self, handle: SearchHandle) -> EngineResult<()>;

    fn set_symbol_path(&self, path: &str) -> EngineResult<()>;

    fn set_symbol_options(&self, options: u32) -> EngineResult<()>;

    /// Low-level `SymGetTypeInfo` against the dbghelp session `process`.
    fn sym_get_type_info(
        &self,
        process: u64,
        module: CanonicalAddress,
        type_id: TypeId,
        selector: TypeInfoSelector,
        out: TypeInfoOut<'_>,
    ) -> EngineResult<()>;
}

/// Execution control (`IDebugControl`)
pub trait Control
{
    /// Run a command through the engine's command interpreter.
    fn execute(&self, command: &str) -> EngineResult<()>;

    /// Disassemble one instruction: `(reported text size, next offset)`.
    fn disassemble(&self, offset: CanonicalAddress, buf: &mut [u8]) -> EngineResult<(usize, u64)>;

    fn wait_for_event(&self, timeout_ms: u32) -> EngineResult<()>;

    fn is_pointer_64bit(&self) -> EngineResult<bool>;
}

/// Client control (`IDebugClient`)
pub trait Client
{
    /// Replace the engine's output callbacks.
    ///
    /// The engine holds `callbacks` until the next call.
    fn set_output_callbacks(&self, callbacks: Arc<dyn OutputCallbacks>) -> EngineResult<()>;
}

/// A complete debugging engine: every sub-interface of one attached session.
pub trait DebugEngine: DataSpaces + Symbols + Control + Client {}

impl<T: DataSpaces + Symbols + Control + Client> DebugEngine for T {}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_hresult_names_and_severity()
    {
        assert_eq!(HResult::E_FAIL.name(), Some("E_FAIL"));
        assert_eq!(HResult(0x1234).name(), None);
        assert!(HResult::E_NOINTERFACE.is_failure());
        assert!(!HResult::S_FALSE.is_failure());
        assert_eq!(HResult::from(-2_147_467_259i32), HResult::E_FAIL);
    }

    #[test]
    fn test_hresult_display()
    {
        assert_eq!(HResult::E_FAIL.to_string(), "HRESULT 0x80004005");
    }
}
