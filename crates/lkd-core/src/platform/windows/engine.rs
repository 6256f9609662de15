//! [`DbgEngEngine`]: the engine traits forwarded to DbgEng's COM interfaces.

use std::ffi::{c_void, CString};
use std::sync::Arc;

use tracing::{debug, info, trace};
use windows::core::{Interface, PCSTR};
use windows::Win32::System::Diagnostics::Debug::Extensions::{
    DebugCreate, IDebugClient, IDebugControl, IDebugDataSpaces2, IDebugOutputCallbacks, IDebugSymbols3,
};

use super::ffi;
use super::output::OutputBridge;
use crate::engine::{
    BusSlot, Client, Control, DataSpaces, EngineResult, HResult, IoLocation, ModuleNameSizes, SearchHandle, Symbols,
};
use crate::error::{EngineResultExt, Result};
use crate::output::OutputCallbacks;
use crate::types::{CanonicalAddress, ProcessorDataKind, TypeId, TypeInfoOut, TypeInfoSelector};

const DEBUG_ATTACH_LOCAL_KERNEL: u32 = 0x0000_0001;
const DEBUG_OUTCTL_THIS_CLIENT: u32 = 0x0000_0000;
const DEBUG_EXECUTE_DEFAULT: u32 = 0x0000_0000;
const DEBUG_DISASM_EFFECTIVE_ADDRESS: u32 = 0x0000_0001;
const DEBUG_WAIT_DEFAULT: u32 = 0x0000_0000;
const INFINITE: u32 = 0xFFFF_FFFF;

const IMAGE_FILE_MACHINE_I386: u32 = 0x014c;
const IMAGE_FILE_MACHINE_AMD64: u32 = 0x8664;

/// DbgEng attached to the local kernel.
pub struct DbgEngEngine
{
    client: IDebugClient,
    control: IDebugControl,
    data: IDebugDataSpaces2,
    symbols: IDebugSymbols3,
}

impl std::fmt::Debug for DbgEngEngine
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("DbgEngEngine").finish_non_exhaustive()
    }
}

impl DbgEngEngine
{
    /// Create the engine, attach it to the local kernel and wait for the
    /// initial break-in event.
    ///
    /// ## Errors
    ///
    /// - `EngineCallFailed`: `dbgeng.dll` could not be loaded, one of the
    ///   interfaces is missing, or the attach was refused (not elevated, or
    ///   kernel debugging disabled at boot)
    pub fn attach_local_kernel() -> Result<Self>
    {
        // SAFETY: DebugCreate has no preconditions beyond a loadable dbgeng.dll.
        let client: IDebugClient = unsafe { DebugCreate() }.map_err(status).op("debug_create")?;
        let control = client.cast::<IDebugControl>().map_err(status).op("query_interface")?;
        let data = client
            .cast::<IDebugDataSpaces2>()
            .map_err(status)
            .op("query_interface")?;
        let symbols = client
            .cast::<IDebugSymbols3>()
            .map_err(status)
            .op("query_interface")?;

        debug!("Attaching to the local kernel");
        // SAFETY: a null connect-options string is what local attach expects.
        unsafe { client.AttachKernel(DEBUG_ATTACH_LOCAL_KERNEL, PCSTR::null()) }
            .map_err(status)
            .op("attach_kernel")?;

        let engine = Self {
            client,
            control,
            data,
            symbols,
        };
        engine.wait_for_event(INFINITE).op("wait_for_event")?;
        info!("Local kernel session established");
        Ok(engine)
    }
}

/// Raw status of a failed COM call.
fn status(error: windows::core::Error) -> HResult
{
    HResult(error.code().0 as u32)
}

/// `HRESULT_FROM_WIN32(GetLastError())`.
fn last_error() -> HResult
{
    // SAFETY: reads thread-local state only.
    let code = unsafe { ffi::GetLastError() };
    if code == 0 {
        HResult::E_FAIL
    } else {
        HResult(0x8007_0000 | (code & 0xFFFF))
    }
}

fn c_string(text: &str) -> EngineResult<CString>
{
    CString::new(text).map_err(|_| HResult::E_INVALIDARG)
}

fn pcstr(text: &CString) -> PCSTR
{
    PCSTR::from_raw(text.as_ptr().cast())
}

fn buffer_len(buf: &[u8]) -> u32
{
    u32::try_from(buf.len()).unwrap_or(u32::MAX)
}

impl DataSpaces for DbgEngEngine
{
    fn read_virtual(&self, offset: CanonicalAddress, buf: &mut [u8]) -> EngineResult<usize>
    {
        let mut read = 0u32;
        // SAFETY: `buf` is valid for `buffer_len(buf)` bytes.
        unsafe {
            self.data
                .ReadVirtual(offset.value(), buf.as_mut_ptr().cast(), buffer_len(buf), Some(&mut read))
        }
        .map_err(status)?;
        Ok(read as usize)
    }

    fn write_virtual(&self, offset: CanonicalAddress, data: &[u8]) -> EngineResult<usize>
    {
        let mut written = 0u32;
        // SAFETY: `data` is valid for `buffer_len(data)` bytes.
        unsafe {
            self.data
                .WriteVirtual(offset.value(), data.as_ptr().cast(), buffer_len(data), Some(&mut written))
        }
        .map_err(status)?;
        Ok(written as usize)
    }

    fn read_physical(&self, offset: u64, buf: &mut [u8]) -> EngineResult<usize>
    {
        let mut read = 0u32;
        // SAFETY: `buf` is valid for `buffer_len(buf)` bytes.
        unsafe {
            self.data
                .ReadPhysical(offset, buf.as_mut_ptr().cast(), buffer_len(buf), Some(&mut read))
        }
        .map_err(status)?;
        Ok(read as usize)
    }

    fn write_physical(&self, offset: u64, data: &[u8]) -> EngineResult<usize>
    {
        let mut written = 0u32;
        // SAFETY: `data` is valid for `buffer_len(data)` bytes.
        unsafe {
            self.data
                .WritePhysical(offset, data.as_ptr().cast(), buffer_len(data), Some(&mut written))
        }
        .map_err(status)?;
        Ok(written as usize)
    }

    fn read_io(&self, location: IoLocation, port: u64, buf: &mut [u8]) -> EngineResult<usize>
    {
        let mut read = 0u32;
        // SAFETY: `buf` is valid for `buffer_len(buf)` bytes.
        unsafe {
            self.data.ReadIo(
                location.interface_type,
                location.bus_number,
                location.address_space,
                port,
                buf.as_mut_ptr().cast(),
                buffer_len(buf),
                Some(&mut read),
            )
        }
        .map_err(status)?;
        Ok(read as usize)
    }

    fn write_io(&self, location: IoLocation, port: u64, data: &[u8]) -> EngineResult<usize>
    {
        let mut written = 0u32;
        // SAFETY: `data` is valid for `buffer_len(data)` bytes.
        unsafe {
            self.data.WriteIo(
                location.interface_type,
                location.bus_number,
                location.address_space,
                port,
                data.as_ptr().cast(),
                buffer_len(data),
                Some(&mut written),
            )
        }
        .map_err(status)?;
        Ok(written as usize)
    }

    fn read_bus_data(&self, slot: BusSlot, offset: u32, buf: &mut [u8]) -> EngineResult<usize>
    {
        let mut read = 0u32;
        // SAFETY: `buf` is valid for `buffer_len(buf)` bytes.
        unsafe {
            self.data.ReadBusData(
                slot.data_type,
                slot.bus_number,
                slot.slot,
                offset,
                buf.as_mut_ptr().cast(),
                buffer_len(buf),
                Some(&mut read),
            )
        }
        .map_err(status)?;
        Ok(read as usize)
    }

    fn write_bus_data(&self, slot: BusSlot, offset: u32, data: &[u8]) -> EngineResult<usize>
    {
        let mut written = 0u32;
        // SAFETY: `data` is valid for `buffer_len(data)` bytes.
        unsafe {
            self.data.WriteBusData(
                slot.data_type,
                slot.bus_number,
                slot.slot,
                offset,
                data.as_ptr().cast(),
                buffer_len(data),
                Some(&mut written),
            )
        }
        .map_err(status)?;
        Ok(written as usize)
    }

    fn read_msr(&self, msr: u32) -> EngineResult<u64>
    {
        // SAFETY: plain value call.
        unsafe { self.data.ReadMsr(msr) }.map_err(status)
    }

    fn write_msr(&self, msr: u32, value: u64) -> EngineResult<()>
    {
        // SAFETY: plain value call.
        unsafe { self.data.WriteMsr(msr, value) }.map_err(status)
    }

    fn virtual_to_physical(&self, offset: CanonicalAddress) -> EngineResult<u64>
    {
        // SAFETY: plain value call.
        unsafe { self.data.VirtualToPhysical(offset.value()) }.map_err(status)
    }

    fn read_processor_system_data(&self, processor: u32, kind: ProcessorDataKind, buf: &mut [u8])
        -> EngineResult<usize>
    {
        let mut size = 0u32;
        // SAFETY: `buf` is valid for `buffer_len(buf)` bytes.
        unsafe {
            self.data.ReadProcessorSystemData(
                processor,
                kind as u32,
                buf.as_mut_ptr().cast(),
                buffer_len(buf),
                Some(&mut size),
            )
        }
        .map_err(status)?;
        Ok(size as usize)
    }
}

impl Symbols for DbgEngEngine
{
    fn get_offset_by_name(&self, name: &str) -> EngineResult<u64>
    {
        let name = c_string(name)?;
        // SAFETY: `name` outlives the call.
        unsafe { self.symbols.GetOffsetByName(pcstr(&name)) }.map_err(status)
    }

    fn get_name_by_offset(&self, offset: CanonicalAddress, buf: &mut [u8]) -> EngineResult<(usize, u64)>
    {
        let mut size = 0u32;
        let mut displacement = 0u64;
        // SAFETY: out-pointers are valid locals.
        unsafe {
            self.symbols
                .GetNameByOffset(offset.value(), Some(buf), Some(&mut size), Some(&mut displacement))
        }
        .map_err(status)?;
        Ok((size as usize, displacement))
    }

    fn get_type_id(&self, module: CanonicalAddress, name: &str) -> EngineResult<TypeId>
    {
        let name = c_string(name)?;
        // SAFETY: `name` outlives the call.
        unsafe { self.symbols.GetTypeId(module.value(), pcstr(&name)) }
            .map(TypeId)
            .map_err(status)
    }

    fn get_symbol_type_id(&self, symbol: &str) -> EngineResult<(TypeId, u64)>
    {
        let symbol = c_string(symbol)?;
        let mut type_id = 0u32;
        let mut module = 0u64;
        // SAFETY: `symbol` outlives the call; out-pointers are valid locals.
        unsafe {
            self.symbols
                .GetSymbolTypeId(pcstr(&symbol), &mut type_id, Some(&mut module))
        }
        .map_err(status)?;
        Ok((TypeId(type_id), module))
    }

    fn get_type_name(&self, module: CanonicalAddress, type_id: TypeId, buf: &mut [u8]) -> EngineResult<usize>
    {
        let mut size = 0u32;
        // SAFETY: out-pointer is a valid local.
        unsafe {
            self.symbols
                .GetTypeName(module.value(), type_id.0, Some(buf), Some(&mut size))
        }
        .map_err(status)?;
        Ok(size as usize)
    }

    fn get_type_size(&self, module: CanonicalAddress, type_id: TypeId) -> EngineResult<u32>
    {
        // SAFETY: plain value call.
        unsafe { self.symbols.GetTypeSize(module.value(), type_id.0) }.map_err(status)
    }

    fn get_field_offset(&self, module: CanonicalAddress, type_id: TypeId, field: &str) -> EngineResult<u32>
    {
        let field = c_string(field)?;
        // SAFETY: `field` outlives the call.
        unsafe {
            self.symbols
                .GetFieldOffset(module.value(), type_id.0, pcstr(&field))
        }
        .map_err(status)
    }

    fn get_field_name(&self, module: CanonicalAddress, type_id: TypeId, index: u32, buf: &mut [u8])
        -> EngineResult<usize>
    {
        let mut size = 0u32;
        // SAFETY: out-pointer is a valid local.
        unsafe {
            self.symbols
                .GetFieldName(module.value(), type_id.0, index, Some(buf), Some(&mut size))
        }
        .map_err(status)?;
        Ok(size as usize)
    }

    fn get_field_type_and_offset(&self, module: CanonicalAddress, type_id: TypeId, field: &str)
        -> EngineResult<(TypeId, u32)>
    {
        let field = c_string(field)?;
        let mut field_type = 0u32;
        let mut offset = 0u32;
        // SAFETY: `field` outlives the call; out-pointers are valid locals.
        unsafe {
            self.symbols.GetFieldTypeAndOffset(
                module.value(),
                type_id.0,
                pcstr(&field),
                Some(&mut field_type),
                Some(&mut offset),
            )
        }
        .map_err(status)?;
        Ok((TypeId(field_type), offset))
    }

    fn get_number_modules(&self) -> EngineResult<(u32, u32)>
    {
        let mut loaded = 0u32;
        let mut unloaded = 0u32;
        // SAFETY: out-pointers are valid locals.
        unsafe { self.symbols.GetNumberModules(&mut loaded, &mut unloaded) }.map_err(status)?;
        Ok((loaded, unloaded))
    }

    fn get_module_by_index(&self, index: u32) -> EngineResult<u64>
    {
        // SAFETY: plain value call.
        unsafe { self.symbols.GetModuleByIndex(index) }.map_err(status)
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
        let (mut image_size, mut module_size, mut loaded_size) = (0u32, 0u32, 0u32);
        // SAFETY: out-pointers are valid locals.
        unsafe {
            self.symbols.GetModuleNames(
                index,
                base.value(),
                Some(image),
                Some(&mut image_size),
                Some(module),
                Some(&mut module_size),
                Some(loaded_image),
                Some(&mut loaded_size),
            )
        }
        .map_err(status)?;
        Ok(ModuleNameSizes {
            image: image_size as usize,
            module: module_size as usize,
            loaded_image: loaded_size as usize,
        })
    }

    fn reload(&self, module: &str) -> EngineResult<()>
    {
        let module = c_string(module)?;
        // SAFETY: `module` outlives the call.
        unsafe { self.symbols.Reload(pcstr(&module)) }.map_err(status)
    }

    fn start_symbol_match(&self, pattern: &str) -> EngineResult<SearchHandle>
    {
        let pattern = c_string(pattern)?;
        // SAFETY: `pattern` outlives the call.
        unsafe { self.symbols.StartSymbolMatch(pcstr(&pattern)) }
            .map(SearchHandle)
            .map_err(status)
    }

    fn get_next_symbol_match(&self, handle: SearchHandle, buf: &mut [u8]) -> EngineResult<(usize, u64)>
    {
        let mut size = 0u32;
        let mut offset = 0u64;
        let capacity = buf.len();
        // SAFETY: out-pointers are valid locals.
        unsafe {
            self.symbols
                .GetNextSymbolMatch(handle.0, Some(buf), Some(&mut size), Some(&mut offset))
        }
        .map_err(status)?;
        // The bindings fold S_FALSE into success; the reported size tells.
        if size as usize > capacity {
            trace!("Symbol match needs {} bytes, have {}", size, capacity);
            return Err(HResult::S_FALSE);
        }
        Ok((size as usize, offset))
    }

    fn end_symbol_match(&self, handle: SearchHandle) -> EngineResult<()>
    {
        // SAFETY: plain value call.
        unsafe { self.symbols.EndSymbolMatch(handle.0) }.map_err(status)
    }

    fn set_symbol_path(&self, path: &str) -> EngineResult<()>
    {
        let path = c_string(path)?;
        // SAFETY: `path` outlives the call.
        unsafe { self.symbols.SetSymbolPath(pcstr(&path)) }.map_err(status)
    }

    fn set_symbol_options(&self, options: u32) -> EngineResult<()>
    {
        // SAFETY: plain value call.
        unsafe { self.symbols.SetSymbolOptions(options) }.map_err(status)
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
        let process = process as isize;
        let query = |info: *mut c_void| {
            // SAFETY: `info` points at storage of the shape `selector` expects.
            unsafe { ffi::SymGetTypeInfo(process, module.value(), type_id.0, selector.raw(), info) }
        };
        let succeeded = match out {
            TypeInfoOut::Name(name) => {
                let mut wide: *mut u16 = std::ptr::null_mut();
                let succeeded = query(std::ptr::addr_of_mut!(wide).cast());
                if succeeded != 0 && !wide.is_null() {
                    // SAFETY: on success dbghelp hands back a NUL-terminated,
                    // LocalAlloc'd UTF-16 string that the caller must free.
                    unsafe {
                        let len = (0..).take_while(|&i| *wide.add(i) != 0).count();
                        *name = String::from_utf16_lossy(std::slice::from_raw_parts(wide, len));
                        ffi::LocalFree(wide.cast());
                    }
                }
                succeeded
            }
            TypeInfoOut::U64(value) => query(std::ptr::from_mut(value).cast()),
            TypeInfoOut::U32(value) => query(std::ptr::from_mut(value).cast()),
            TypeInfoOut::Raw(buf) => query(buf.as_mut_ptr().cast()),
        };
        if succeeded == 0 {
            return Err(last_error());
        }
        Ok(())
    }
}

impl Control for DbgEngEngine
{
    fn execute(&self, command: &str) -> EngineResult<()>
    {
        let command = c_string(command)?;
        // SAFETY: `command` outlives the call.
        unsafe {
            self.control
                .Execute(DEBUG_OUTCTL_THIS_CLIENT, pcstr(&command), DEBUG_EXECUTE_DEFAULT)
        }
        .map_err(status)
    }

    fn disassemble(&self, offset: CanonicalAddress, buf: &mut [u8]) -> EngineResult<(usize, u64)>
    {
        let mut size = 0u32;
        let mut end = 0u64;
        // SAFETY: out-pointers are valid locals.
        unsafe {
            self.control.Disassemble(
                offset.value(),
                DEBUG_DISASM_EFFECTIVE_ADDRESS,
                Some(buf),
                Some(&mut size),
                &mut end,
            )
        }
        .map_err(status)?;
        Ok((size as usize, end))
    }

    fn wait_for_event(&self, timeout_ms: u32) -> EngineResult<()>
    {
        // SAFETY: plain value call.
        unsafe { self.control.WaitForEvent(DEBUG_WAIT_DEFAULT, timeout_ms) }.map_err(status)
    }

    /// Decided by the effective processor type: `IsPointer64Bit` answers
    /// "no" with `S_FALSE`, which the bindings report as success.
    fn is_pointer_64bit(&self) -> EngineResult<bool>
    {
        // SAFETY: plain value call.
        let machine = unsafe { self.control.GetEffectiveProcessorType() }.map_err(status)?;
        match machine {
            IMAGE_FILE_MACHINE_AMD64 => Ok(true),
            IMAGE_FILE_MACHINE_I386 => Ok(false),
            other => {
                debug!("Unexpected effective processor type 0x{:x}", other);
                Err(HResult::E_NOTIMPL)
            }
        }
    }
}

impl Client for DbgEngEngine
{
    fn set_output_callbacks(&self, callbacks: Arc<dyn OutputCallbacks>) -> EngineResult<()>
    {
        let bridge: IDebugOutputCallbacks = OutputBridge::new(callbacks).into();
        // SAFETY: the engine takes its own reference on `bridge`.
        unsafe { self.client.SetOutputCallbacks(&bridge) }.map_err(status)
    }
}
