//! # Fixture Engine
//!
//! A deterministic in-memory [`DebugEngine`](super::DebugEngine).
//!
//! It answers every engine call from tables filled in with the `with_*`
//! builder methods, and counts calls so tests can assert how many round trips
//! an operation made.
//!
//! Virtual memory is backed by physical memory through a 4 KiB page table, so
//! translation, `write_pfv` and ordinary reads all agree with each other.
//! Reading an unmapped page stops the transfer; a transfer that moves nothing
//! fails with `E_FAIL`, the way the real engine reports inaccessible memory.
//!
//! ## Example
//!
//! ```rust
//! use lkd_core::bitness::PointerWidth;
//! use lkd_core::config::SessionConfig;
//! use lkd_core::engine::FixtureEngine;
//! use lkd_core::session::KernelSession;
//!
//! let engine = FixtureEngine::new()
//!     .with_symbol("nt!KeNumberProcessors", 0xffff_f800_0000_1000)
//!     .with_virtual(0xffff_f800_0000_1000, &4u32.to_le_bytes());
//! let session = KernelSession::new(engine, PointerWidth::Bits64, SessionConfig::default())?;
//! assert_eq!(session.read_dword("nt!KeNumberProcessors")?, 4);
//! # Ok::<(), lkd_core::error::LkdError>(())
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{
    BusSlot, Client, Control, DataSpaces, EngineResult, HResult, IoLocation, ModuleNameSizes, SearchHandle, Symbols,
};
use crate::config::DBGENG_TYPE_INFO_HANDLE;
use crate::output::OutputCallbacks;
use crate::types::{CanonicalAddress, ProcessorDataKind, TypeId, TypeInfoOut, TypeInfoSelector};

const PAGE_SIZE: u64 = 0x1000;
const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// First physical page handed out by [`FixtureEngine::with_virtual`]
const FIRST_BACKING_PAGE: u64 = 0x0010_0000;

/// Size of one PCI configuration space
const BUS_SPACE_SIZE: usize = 256;

/// `DEBUG_OUTPUT_NORMAL`
const OUTPUT_NORMAL: u32 = 1;

#[derive(Debug, Clone)]
struct FixtureModule
{
    base: u64,
    module_name: String,
    image_name: String,
    loaded_image_name: String,
}

#[derive(Debug, Clone)]
struct FixtureField
{
    name: String,
    type_id: TypeId,
    offset: u32,
}

#[derive(Debug, Clone, Default)]
struct FixtureType
{
    name: String,
    size: u32,
    fields: Vec<FixtureField>,
    children: Vec<TypeId>,
}

#[derive(Debug)]
struct SymbolSearch
{
    matches: Vec<(String, u64)>,
    position: usize,
}

/// In-memory debugging engine used by the test-suite.
pub struct FixtureEngine
{
    pointer_64bit: bool,
    type_info_handle: u64,

    page_table: RefCell<BTreeMap<u64, u64>>,
    physical: RefCell<BTreeMap<u64, u8>>,
    next_backing_page: Cell<u64>,
    io_ports: RefCell<HashMap<u64, u8>>,
    bus: RefCell<HashMap<BusSlot, Vec<u8>>>,
    msrs: RefCell<HashMap<u32, u64>>,
    processor_data: HashMap<(u32, ProcessorDataKind), Vec<u8>>,

    symbols: Vec<(String, u64)>,
    modules: Vec<FixtureModule>,
    type_names: HashMap<(u64, String), TypeId>,
    types: HashMap<(u64, TypeId), FixtureType>,
    symbol_types: HashMap<String, (TypeId, u64)>,

    searches: RefCell<HashMap<u64, SymbolSearch>>,
    next_search: Cell<u64>,

    commands: HashMap<String, String>,
    instructions: BTreeMap<u64, (String, u64)>,

    symbol_path: RefCell<String>,
    symbol_options: Cell<u32>,
    output: RefCell<Option<Arc<dyn OutputCallbacks>>>,
    executed: RefCell<Vec<String>>,
    reloads: RefCell<Vec<String>>,
    calls: RefCell<HashMap<&'static str, usize>>,
}

impl Default for FixtureEngine
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl std::fmt::Debug for FixtureEngine
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("FixtureEngine")
            .field("pointer_64bit", &self.pointer_64bit)
            .field("symbols", &self.symbols.len())
            .field("modules", &self.modules.len())
            .field("types", &self.types.len())
            .finish_non_exhaustive()
    }
}

impl FixtureEngine
{
    /// An empty 64-bit engine.
    pub fn new() -> Self
    {
        Self {
            pointer_64bit: true,
            type_info_handle: DBGENG_TYPE_INFO_HANDLE,
            page_table: RefCell::new(BTreeMap::new()),
            physical: RefCell::new(BTreeMap::new()),
            next_backing_page: Cell::new(FIRST_BACKING_PAGE),
            io_ports: RefCell::new(HashMap::new()),
            bus: RefCell::new(HashMap::new()),
            msrs: RefCell::new(HashMap::new()),
            processor_data: HashMap::new(),
            symbols: Vec::new(),
            modules: Vec::new(),
            type_names: HashMap::new(),
            types: HashMap::new(),
            symbol_types: HashMap::new(),
            searches: RefCell::new(HashMap::new()),
            next_search: Cell::new(1),
            commands: HashMap::new(),
            instructions: BTreeMap::new(),
            symbol_path: RefCell::new(String::new()),
            symbol_options: Cell::new(0),
            output: RefCell::new(None),
            executed: RefCell::new(Vec::new()),
            reloads: RefCell::new(Vec::new()),
            calls: RefCell::new(HashMap::new()),
        }
    }

    /// An empty engine attached to a 32-bit kernel.
    pub fn new_32bit() -> Self
    {
        Self {
            pointer_64bit: false,
            ..Self::new()
        }
    }

    // ---- builders -------------------------------------------------------

    /// Map the virtual page containing `virt` onto the physical page containing `phys`.
    #[must_use]
    pub fn with_mapping(self, virt: u64, phys: u64) -> Self
    {
        self.page_table.borrow_mut().insert(virt & PAGE_MASK, phys & PAGE_MASK);
        self
    }

    /// Place `bytes` at canonical virtual address `virt`, mapping fresh pages as needed.
    #[must_use]
    pub fn with_virtual(self, virt: u64, bytes: &[u8]) -> Self
    {
        for (i, byte) in bytes.iter().enumerate() {
            let addr = virt.wrapping_add(i as u64);
            let phys = match self.translate(addr) {
                Some(phys) => phys,
                None => {
                    let page = self.next_backing_page.get();
                    self.next_backing_page.set(page + PAGE_SIZE);
                    self.page_table.borrow_mut().insert(addr & PAGE_MASK, page);
                    page | (addr & !PAGE_MASK)
                }
            };
            self.physical.borrow_mut().insert(phys, *byte);
        }
        self
    }

    /// Place `bytes` at physical address `phys`.
    #[must_use]
    pub fn with_physical(self, phys: u64, bytes: &[u8]) -> Self
    {
        {
            let mut physical = self.physical.borrow_mut();
            for (i, byte) in bytes.iter().enumerate() {
                physical.insert(phys.wrapping_add(i as u64), *byte);
            }
        }
        self
    }

    #[must_use]
    pub fn with_io_port(self, port: u64, bytes: &[u8]) -> Self
    {
        {
            let mut ports = self.io_ports.borrow_mut();
            for (i, byte) in bytes.iter().enumerate() {
                ports.insert(port + i as u64, *byte);
            }
        }
        self
    }

    /// Populate the start of a bus configuration space; the rest reads as zero.
    #[must_use]
    pub fn with_bus_data(self, slot: BusSlot, bytes: &[u8]) -> Self
    {
        let mut space = vec![0u8; BUS_SPACE_SIZE];
        let len = bytes.len().min(BUS_SPACE_SIZE);
        space[..len].copy_from_slice(&bytes[..len]);
        self.bus.borrow_mut().insert(slot, space);
        self
    }

    #[must_use]
    pub fn with_msr(self, msr: u32, value: u64) -> Self
    {
        self.msrs.borrow_mut().insert(msr, value);
        self
    }

    #[must_use]
    pub fn with_processor_data(mut self, processor: u32, kind: ProcessorDataKind, bytes: &[u8]) -> Self
    {
        self.processor_data.insert((processor, kind), bytes.to_vec());
        self
    }

    /// Register a symbol. Match order follows registration order.
    #[must_use]
    pub fn with_symbol(mut self, name: &str, address: u64) -> Self
    {
        self.symbols.push((name.to_string(), address));
        self
    }

    /// Register a loaded module; its name also resolves to its base.
    #[must_use]
    pub fn with_module(mut self, module_name: &str, base: u64, image_name: &str) -> Self
    {
        self.modules.push(FixtureModule {
            base,
            module_name: module_name.to_string(),
            image_name: image_name.to_string(),
            loaded_image_name: image_name.to_string(),
        });
        self
    }

    /// Register a type of module `module` (canonical base).
    #[must_use]
    pub fn with_type(mut self, module: u64, type_id: u32, name: &str, size: u32) -> Self
    {
        let id = TypeId(type_id);
        self.type_names.insert((module, name.to_string()), id);
        let entry = self.types.entry((module, id)).or_default();
        entry.name = name.to_string();
        entry.size = size;
        self
    }

    /// Append a field to a registered type; fields enumerate in insertion order.
    #[must_use]
    pub fn with_field(mut self, module: u64, type_id: u32, name: &str, field_type: u32, offset: u32) -> Self
    {
        self.types
            .entry((module, TypeId(type_id)))
            .or_default()
            .fields
            .push(FixtureField {
                name: name.to_string(),
                type_id: TypeId(field_type),
                offset,
            });
        self
    }

    /// Set the child type identifiers reported by the low-level type query.
    #[must_use]
    pub fn with_children(mut self, module: u64, type_id: u32, children: &[u32]) -> Self
    {
        self.types.entry((module, TypeId(type_id))).or_default().children =
            children.iter().copied().map(TypeId).collect();
        self
    }

    #[must_use]
    pub fn with_symbol_type(mut self, symbol: &str, type_id: u32, module: u64) -> Self
    {
        self.symbol_types.insert(symbol.to_string(), (TypeId(type_id), module));
        self
    }

    /// Canned output of a command; unknown commands fail with `E_FAIL`.
    #[must_use]
    pub fn with_command(mut self, command: &str, output: &str) -> Self
    {
        self.commands.insert(command.to_string(), output.to_string());
        self
    }

    /// One disassembled instruction of `length` bytes at canonical `address`.
    #[must_use]
    pub fn with_instruction(mut self, address: u64, text: &str, length: u64) -> Self
    {
        self.instructions.insert(address, (text.to_string(), length));
        self
    }

    /// Expect a different dbghelp session handle in type-info queries.
    #[must_use]
    pub fn with_type_info_handle(mut self, handle: u64) -> Self
    {
        self.type_info_handle = handle;
        self
    }

    // ---- inspection ----------------------------------------------------

    /// Number of calls made to the engine method `method`.
    pub fn calls(&self, method: &str) -> usize
    {
        self.calls.borrow().get(method).copied().unwrap_or(0)
    }

    /// Symbol searches opened and not yet ended.
    pub fn open_searches(&self) -> usize
    {
        self.searches.borrow().len()
    }

    pub fn symbol_path(&self) -> String
    {
        self.symbol_path.borrow().clone()
    }

    pub fn symbol_options(&self) -> u32
    {
        self.symbol_options.get()
    }

    /// Commands run through `execute`, in order.
    pub fn executed(&self) -> Vec<String>
    {
        self.executed.borrow().clone()
    }

    /// Modules passed to `reload`, in order.
    pub fn reloads(&self) -> Vec<String>
    {
        self.reloads.borrow().clone()
    }

    /// Output callbacks currently registered.
    pub fn output_callbacks(&self) -> Option<Arc<dyn OutputCallbacks>>
    {
        self.output.borrow().clone()
    }

    /// Current value of an MSR.
    pub fn msr(&self, msr: u32) -> Option<u64>
    {
        self.msrs.borrow().get(&msr).copied()
    }

    /// Current contents of a bus configuration space.
    pub fn bus_data(&self, slot: BusSlot) -> Option<Vec<u8>>
    {
        self.bus.borrow().get(&slot).cloned()
    }

    /// Current value of an I/O port byte.
    pub fn io_port(&self, port: u64) -> Option<u8>
    {
        self.io_ports.borrow().get(&port).copied()
    }

    // ---- internals -----------------------------------------------------

    fn record(&self, method: &'static str)
    {
        *self.calls.borrow_mut().entry(method).or_insert(0) += 1;
    }

    fn translate(&self, virt: u64) -> Option<u64>
    {
        self.page_table
            .borrow()
            .get(&(virt & PAGE_MASK))
            .map(|page| page | (virt & !PAGE_MASK))
    }

    fn physical_byte(&self, phys: u64) -> u8
    {
        self.physical.borrow().get(&phys).copied().unwrap_or(0)
    }

    fn lookup_type(&self, module: CanonicalAddress, type_id: TypeId) -> EngineResult<&FixtureType>
    {
        self.types
            .get(&(module.value(), type_id))
            .ok_or(HResult::E_INVALIDARG)
    }

    fn find_field<'a>(ty: &'a FixtureType, field: &str) -> EngineResult<&'a FixtureField>
    {
        ty.fields
            .iter()
            .find(|f| f.name == field)
            .ok_or(HResult::E_INVALIDARG)
    }

    fn module_at(&self, base: u64) -> Option<&FixtureModule>
    {
        self.modules.iter().find(|m| m.base == base)
    }
}

/// Copy `text` plus a terminating NUL into `buf`, truncating to fit; report
/// the full size the engine wanted to write.
fn fill_name(buf: &mut [u8], text: &str) -> usize
{
    let bytes = text.as_bytes();
    let len = bytes.len().min(buf.len());
    buf[..len].copy_from_slice(&bytes[..len]);
    if len < buf.len() {
        buf[len] = 0;
    }
    bytes.len() + 1
}

/// Glob match with `*` and `?`, case-insensitive like the engine's matcher.
fn glob_match(pattern: &str, text: &str) -> bool
{
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

impl DataSpaces for FixtureEngine
{
    fn read_virtual(&self, offset: CanonicalAddress, buf: &mut [u8]) -> EngineResult<usize>
    {
        self.record("read_virtual");
        let mut read = 0;
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.translate(offset.value().wrapping_add(i as u64)) {
                Some(phys) => *slot = self.physical_byte(phys),
                None => break,
            }
            read += 1;
        }
        if read == 0 && !buf.is_empty() {
            return Err(HResult::E_FAIL);
        }
        Ok(read)
    }

    fn write_virtual(&self, offset: CanonicalAddress, data: &[u8]) -> EngineResult<usize>
    {
        self.record("write_virtual");
        let mut written = 0;
        for (i, byte) in data.iter().enumerate() {
            match self.translate(offset.value().wrapping_add(i as u64)) {
                Some(phys) => {
                    self.physical.borrow_mut().insert(phys, *byte);
                }
                None => break,
            }
            written += 1;
        }
        if written == 0 && !data.is_empty() {
            return Err(HResult::E_FAIL);
        }
        Ok(written)
    }

    fn read_physical(&self, offset: u64, buf: &mut [u8]) -> EngineResult<usize>
    {
        self.record("read_physical");
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = self.physical_byte(offset.wrapping_add(i as u64));
        }
        Ok(buf.len())
    }

    fn write_physical(&self, offset: u64, data: &[u8]) -> EngineResult<usize>
    {
        self.record("write_physical");
        let mut physical = self.physical.borrow_mut();
        for (i, byte) in data.iter().enumerate() {
            physical.insert(offset.wrapping_add(i as u64), *byte);
        }
        Ok(data.len())
    }

    fn read_io(&self, location: IoLocation, port: u64, buf: &mut [u8]) -> EngineResult<usize>
    {
        self.record("read_io");
        if location != IoLocation::ISA_PORTS {
            return Err(HResult::E_INVALIDARG);
        }
        let ports = self.io_ports.borrow();
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = ports.get(&(port + i as u64)).copied().unwrap_or(0xff);
        }
        Ok(buf.len())
    }

    fn write_io(&self, location: IoLocation, port: u64, data: &[u8]) -> EngineResult<usize>
    {
        self.record("write_io");
        if location != IoLocation::ISA_PORTS {
            return Err(HResult::E_INVALIDARG);
        }
        let mut ports = self.io_ports.borrow_mut();
        for (i, byte) in data.iter().enumerate() {
            ports.insert(port + i as u64, *byte);
        }
        Ok(data.len())
    }

    fn read_bus_data(&self, slot: BusSlot, offset: u32, buf: &mut [u8]) -> EngineResult<usize>
    {
        self.record("read_bus_data");
        let bus = self.bus.borrow();
        let start = offset as usize;
        match bus.get(&slot) {
            Some(space) if start < space.len() => {
                let available = (space.len() - start).min(buf.len());
                buf[..available].copy_from_slice(&space[start..start + available]);
                Ok(available)
            }
            Some(_) => Ok(0),
            None => {
                // Absent devices read as all ones
                buf.fill(0xff);
                Ok(buf.len())
            }
        }
    }

    fn write_bus_data(&self, slot: BusSlot, offset: u32, data: &[u8]) -> EngineResult<usize>
    {
        self.record("write_bus_data");
        let mut bus = self.bus.borrow_mut();
        let Some(space) = bus.get_mut(&slot) else {
            return Ok(0);
        };
        let start = offset as usize;
        if start >= space.len() {
            return Ok(0);
        }
        let available = (space.len() - start).min(data.len());
        space[start..start + available].copy_from_slice(&data[..available]);
        Ok(available)
    }

    fn read_msr(&self, msr: u32) -> EngineResult<u64>
    {
        self.record("read_msr");
        self.msrs.borrow().get(&msr).copied().ok_or(HResult::E_FAIL)
    }

    fn write_msr(&self, msr: u32, value: u64) -> EngineResult<()>
    {
        self.record("write_msr");
        self.msrs.borrow_mut().insert(msr, value);
        Ok(())
    }

    fn virtual_to_physical(&self, offset: CanonicalAddress) -> EngineResult<u64>
    {
        self.record("virtual_to_physical");
        self.translate(offset.value()).ok_or(HResult::E_FAIL)
    }

    fn read_processor_system_data(&self, processor: u32, kind: ProcessorDataKind, buf: &mut [u8])
        -> EngineResult<usize>
    {
        self.record("read_processor_system_data");
        let data = self.processor_data.get(&(processor, kind)).ok_or(HResult::E_INVALIDARG)?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }
}

impl Symbols for FixtureEngine
{
    fn get_offset_by_name(&self, name: &str) -> EngineResult<u64>
    {
        self.record("get_offset_by_name");
        self.symbols
            .iter()
            .find(|(symbol, _)| symbol.eq_ignore_ascii_case(name))
            .map(|(_, address)| *address)
            .or_else(|| {
                self.modules
                    .iter()
                    .find(|m| m.module_name.eq_ignore_ascii_case(name))
                    .map(|m| m.base)
            })
            .ok_or(HResult::E_FAIL)
    }

    fn get_name_by_offset(&self, offset: CanonicalAddress, buf: &mut [u8]) -> EngineResult<(usize, u64)>
    {
        self.record("get_name_by_offset");
        let target = offset.value();
        let (name, address) = self
            .symbols
            .iter()
            .filter(|(_, address)| *address <= target)
            .max_by_key(|(_, address)| *address)
            .ok_or(HResult::E_FAIL)?;
        Ok((fill_name(buf, name), target - address))
    }

    fn get_type_id(&self, module: CanonicalAddress, name: &str) -> EngineResult<TypeId>
    {
        self.record("get_type_id");
        let bare = name.rsplit('!').next().unwrap_or(name);
        self.type_names
            .get(&(module.value(), bare.to_string()))
            .copied()
            .ok_or(HResult::E_INVALIDARG)
    }

    fn get_symbol_type_id(&self, symbol: &str) -> EngineResult<(TypeId, u64)>
    {
        self.record("get_symbol_type_id");
        self.symbol_types.get(symbol).copied().ok_or(HResult::E_FAIL)
    }

    fn get_type_name(&self, module: CanonicalAddress, type_id: TypeId, buf: &mut [u8]) -> EngineResult<usize>
    {
        self.record("get_type_name");
        let ty = self.lookup_type(module, type_id)?;
        Ok(fill_name(buf, &ty.name))
    }

    fn get_type_size(&self, module: CanonicalAddress, type_id: TypeId) -> EngineResult<u32>
    {
        self.record("get_type_size");
        Ok(self.lookup_type(module, type_id)?.size)
    }

    fn get_field_offset(&self, module: CanonicalAddress, type_id: TypeId, field: &str) -> EngineResult<u32>
    {
        self.record("get_field_offset");
        let ty = self.lookup_type(module, type_id)?;
        Ok(Self::find_field(ty, field)?.offset)
    }

    fn get_field_name(&self, module: CanonicalAddress, type_id: TypeId, index: u32, buf: &mut [u8])
        -> EngineResult<usize>
    {
        self.record("get_field_name");
        let ty = self.lookup_type(module, type_id)?;
        let field = ty.fields.get(index as usize).ok_or(HResult::E_INVALIDARG)?;
        Ok(fill_name(buf, &field.name))
    }

    fn get_field_type_and_offset(&self, module: CanonicalAddress, type_id: TypeId, field: &str)
        -> EngineResult<(TypeId, u32)>
    {
        self.record("get_field_type_and_offset");
        let ty = self.lookup_type(module, type_id)?;
        let field = Self::find_field(ty, field)?;
        Ok((field.type_id, field.offset))
    }

    fn get_number_modules(&self) -> EngineResult<(u32, u32)>
    {
        self.record("get_number_modules");
        Ok((self.modules.len() as u32, 0))
    }

    fn get_module_by_index(&self, index: u32) -> EngineResult<u64>
    {
        self.record("get_module_by_index");
        self.modules
            .get(index as usize)
            .map(|m| m.base)
            .ok_or(HResult::E_INVALIDARG)
    }

    fn get_module_names(
        &self,
        index: u32,
        base: CanonicalAddress,
        image: &mut [u8],
        module: &mut [u8],
        loaded_image: &mut [u8],
    ) -> EngineResult<ModuleNameSizes>
    {
        self.record("get_module_names");
        let record = self
            .modules
            .get(index as usize)
            .filter(|m| m.base == base.value())
            .or_else(|| self.module_at(base.value()))
            .ok_or(HResult::E_INVALIDARG)?;
        Ok(ModuleNameSizes {
            image: fill_name(image, &record.image_name),
            module: fill_name(module, &record.module_name),
            loaded_image: fill_name(loaded_image, &record.loaded_image_name),
        })
    }

    fn reload(&self, module: &str) -> EngineResult<()>
    {
        self.record("reload");
        self.reloads.borrow_mut().push(module.to_string());
        Ok(())
    }

    fn start_symbol_match(&self, pattern: &str) -> EngineResult<SearchHandle>
    {
        self.record("start_symbol_match");
        let matches = self
            .symbols
            .iter()
            .filter(|(name, _)| glob_match(pattern, name))
            .cloned()
            .collect();
        let handle = self.next_search.get();
        self.next_search.set(handle + 1);
        self.searches
            .borrow_mut()
            .insert(handle, SymbolSearch { matches, position: 0 });
        Ok(SearchHandle(handle))
    }

    fn get_next_symbol_match(&self, handle: SearchHandle, buf: &mut [u8]) -> EngineResult<(usize, u64)>
    {
        self.record("get_next_symbol_match");
        let mut searches = self.searches.borrow_mut();
        let search = searches.get_mut(&handle.0).ok_or(HResult::E_INVALIDARG)?;
        let (name, address) = search.matches.get(search.position).ok_or(HResult::E_NOINTERFACE)?;
        if name.len() + 1 > buf.len() {
            return Err(HResult::S_FALSE);
        }
        let size = fill_name(buf, name);
        let address = *address;
        search.position += 1;
        Ok((size, address))
    }

    fn end_symbol_match(&self, handle: SearchHandle) -> EngineResult<()>
    {
        self.record("end_symbol_match");
        self.searches
            .borrow_mut()
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(HResult::E_INVALIDARG)
    }

    fn set_symbol_path(&self, path: &str) -> EngineResult<()>
    {
        self.record("set_symbol_path");
        *self.symbol_path.borrow_mut() = path.to_string();
        Ok(())
    }

    fn set_symbol_options(&self, options: u32) -> EngineResult<()>
    {
        self.record("set_symbol_options");
        self.symbol_options.set(options);
        Ok(())
    }

    fn sym_get_type_info(
        &self,
        process: u64,
        module: CanonicalAddress,
        type_id: TypeId,
        selector: TypeInfoSelector,
        out: TypeInfoOut<'_>,
    ) -> EngineResult<()>
    {
        self.record("sym_get_type_info");
        if process != self.type_info_handle {
            return Err(HResult::E_INVALIDARG);
        }
        let ty = self.lookup_type(module, type_id)?;
        let child_count = if ty.children.is_empty() {
            ty.fields.len()
        } else {
            ty.children.len()
        };
        match (selector, out) {
            (TypeInfoSelector::SymName, TypeInfoOut::Name(name)) => {
                *name = ty.name.clone();
            }
            (TypeInfoSelector::Length, TypeInfoOut::U64(length)) => {
                *length = u64::from(ty.size);
            }
            (TypeInfoSelector::Address, TypeInfoOut::U64(address)) => {
                *address = module.value();
            }
            (TypeInfoSelector::ChildrenCount, TypeInfoOut::U32(count)) => {
                *count = child_count as u32;
            }
            (TypeInfoSelector::TypeId, TypeInfoOut::U32(id)) => {
                *id = type_id.raw();
            }
            (TypeInfoSelector::FindChildren, TypeInfoOut::Raw(record)) => {
                if record.len() < 8 {
                    return Err(HResult::E_INVALIDARG);
                }
                let requested = u32::from_le_bytes([record[0], record[1], record[2], record[3]]) as usize;
                let start = u32::from_le_bytes([record[4], record[5], record[6], record[7]]) as usize;
                let capacity = (record.len() - 8) / 4;
                let children: Vec<TypeId> = if ty.children.is_empty() {
                    ty.fields.iter().map(|f| f.type_id).collect()
                } else {
                    ty.children.clone()
                };
                let filled = requested
                    .min(capacity)
                    .min(children.len().saturating_sub(start));
                for (i, child) in children.iter().skip(start).take(filled).enumerate() {
                    let at = 8 + 4 * i;
                    record[at..at + 4].copy_from_slice(&child.raw().to_le_bytes());
                }
                record[0..4].copy_from_slice(&(filled as u32).to_le_bytes());
            }
            _ => return Err(HResult::E_NOTIMPL),
        }
        Ok(())
    }
}

impl Control for FixtureEngine
{
    fn execute(&self, command: &str) -> EngineResult<()>
    {
        self.record("execute");
        self.executed.borrow_mut().push(command.to_string());
        let text = self.commands.get(command).ok_or(HResult::E_FAIL)?;
        let callbacks = self.output.borrow().clone();
        if let Some(callbacks) = callbacks {
            callbacks.output(OUTPUT_NORMAL, text);
        }
        Ok(())
    }

    fn disassemble(&self, offset: CanonicalAddress, buf: &mut [u8]) -> EngineResult<(usize, u64)>
    {
        self.record("disassemble");
        let (text, length) = self.instructions.get(&offset.value()).ok_or(HResult::E_FAIL)?;
        let size = fill_name(buf, &format!("{text}\n"));
        Ok((size, offset.value().wrapping_add(*length)))
    }

    fn wait_for_event(&self, _timeout_ms: u32) -> EngineResult<()>
    {
        self.record("wait_for_event");
        Ok(())
    }

    fn is_pointer_64bit(&self) -> EngineResult<bool>
    {
        self.record("is_pointer_64bit");
        Ok(self.pointer_64bit)
    }
}

impl Client for FixtureEngine
{
    fn set_output_callbacks(&self, callbacks: Arc<dyn OutputCallbacks>) -> EngineResult<()>
    {
        self.record("set_output_callbacks");
        *self.output.borrow_mut() = Some(callbacks);
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn canonical(raw: u64) -> CanonicalAddress
    {
        CanonicalAddress::from_raw(raw)
    }

    #[test]
    fn test_glob_match()
    {
        assert!(glob_match("nt!Create*", "nt!CreateProcess"));
        assert!(glob_match("*!KeBugCheck?x", "nt!KeBugCheckEx"));
        assert!(glob_match("NT!create*", "nt!CreateFile"));
        assert!(!glob_match("nt!Create*", "hal!CreateFile"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn test_virtual_memory_is_backed_by_physical()
    {
        let engine = FixtureEngine::new().with_virtual(0xffff_f800_0000_0ffe, &[1, 2, 3, 4]);

        let mut buf = [0u8; 4];
        assert_eq!(engine.read_virtual(canonical(0xffff_f800_0000_0ffe), &mut buf), Ok(4));
        assert_eq!(buf, [1, 2, 3, 4]);

        let phys = engine.virtual_to_physical(canonical(0xffff_f800_0000_1000)).unwrap();
        let mut byte = [0u8; 1];
        engine.read_physical(phys, &mut byte).unwrap();
        assert_eq!(byte, [3]);
    }

    #[test]
    fn test_partial_and_failed_virtual_reads()
    {
        let engine = FixtureEngine::new().with_virtual(0x1ffe, &[0xaa, 0xbb]);
        let mut buf = [0u8; 8];
        assert_eq!(engine.read_virtual(canonical(0x1ffe), &mut buf), Ok(2));
        assert_eq!(engine.read_virtual(canonical(0x9000), &mut buf), Err(HResult::E_FAIL));
    }

    #[test]
    fn test_fill_name_truncates_and_reports_full_size()
    {
        let mut buf = [0xffu8; 4];
        assert_eq!(fill_name(&mut buf, "abcdef"), 7);
        assert_eq!(&buf, b"abcd");

        let mut buf = [0xffu8; 8];
        assert_eq!(fill_name(&mut buf, "abc"), 4);
        assert_eq!(&buf[..4], b"abc\0");
    }

    #[test]
    fn test_symbol_match_does_not_advance_on_short_buffer()
    {
        let engine = FixtureEngine::new().with_symbol("nt!CreateSomething", 0x10);
        let handle = engine.start_symbol_match("nt!*").unwrap();

        let mut small = [0u8; 4];
        assert_eq!(engine.get_next_symbol_match(handle, &mut small), Err(HResult::S_FALSE));

        let mut large = [0u8; 64];
        assert_eq!(engine.get_next_symbol_match(handle, &mut large), Ok((19, 0x10)));
        assert_eq!(engine.get_next_symbol_match(handle, &mut large), Err(HResult::E_NOINTERFACE));

        engine.end_symbol_match(handle).unwrap();
        assert_eq!(engine.open_searches(), 0);
    }
}
