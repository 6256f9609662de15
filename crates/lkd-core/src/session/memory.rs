//! Address-space access: virtual, physical, port I/O, bus data and MSRs.
//!
//! Raw `read_*`/`write_*` calls report the number of bytes actually moved and
//! leave short transfers to the caller. The fixed-width helpers built on top
//! of them require the exact width and fail with `ShortTransfer` otherwise.
//!
//! Physical addresses are engine-width values and never go through the
//! bitness strategy: a PAE physical address above 2 GiB must not be
//! sign-extended.

use tracing::{debug, trace};

use super::KernelSession;
use crate::engine::{BusSlot, DebugEngine, IoLocation};
use crate::error::{EngineResultExt, LkdError, Result};
use crate::types::{Address, FixedLayout, ProcessorData, ProcessorDataKind, SymbolRef};

/// Chunk size of the string readers
const STRING_CHUNK: usize = 0x100;

/// Result of [`KernelSession::read_wstring`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WideText
{
    /// The units decoded as UTF-16
    Decoded(String),
    /// The units were not valid UTF-16; raw little-endian bytes
    Undecodable(Vec<u8>),
}

impl WideText
{
    /// Decoded text, replacing invalid units with U+FFFD.
    pub fn to_string_lossy(&self) -> String
    {
        match self {
            WideText::Decoded(text) => text.clone(),
            WideText::Undecodable(bytes) => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16_lossy(&units)
            }
        }
    }
}

/// Fail with `ShortTransfer` unless exactly `expected` bytes moved.
fn exact(operation: &'static str, expected: usize, actual: usize) -> Result<()>
{
    if actual == expected {
        Ok(())
    } else {
        Err(LkdError::ShortTransfer {
            operation,
            expected,
            actual,
        })
    }
}

impl<E: DebugEngine> KernelSession<E>
{
    // ---- virtual memory ----------------------------------------------------

    /// Read up to `size` bytes of virtual memory.
    ///
    /// The returned buffer holds what the engine actually read, which may be
    /// shorter than `size`.
    ///
    /// ## Errors
    ///
    /// - `UnknownSymbol`: `addr` is a name that did not resolve
    /// - `EngineCallFailed`: nothing could be read
    pub fn read_virtual(&self, addr: impl Into<SymbolRef>, size: usize) -> Result<Vec<u8>>
    {
        let mut buf = vec![0u8; size];
        let read = self.read_virtual_into(addr, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Read virtual memory into a caller buffer, returning the bytes read.
    pub fn read_virtual_into(&self, addr: impl Into<SymbolRef>, buf: &mut [u8]) -> Result<usize>
    {
        let offset = self.resolve_symbol(addr)?;
        let read = self.engine.read_virtual(offset, buf).op("read_virtual")?;
        trace!("read_virtual {}: {} of {} bytes", offset, read, buf.len());
        Ok(read)
    }

    /// Write virtual memory, returning the bytes written.
    pub fn write_virtual(&mut self, addr: impl Into<SymbolRef>, data: &[u8]) -> Result<usize>
    {
        let offset = self.resolve_symbol(addr)?;
        let written = self.engine.write_virtual(offset, data).op("write_virtual")?;
        trace!("write_virtual {}: {} of {} bytes", offset, written, data.len());
        Ok(written)
    }

    /// Read a whole fixed-layout structure from virtual memory.
    ///
    /// ## Errors
    ///
    /// - `ShortTransfer`: fewer than `T::SIZE` bytes were readable
    pub fn read_virtual_struct<T: FixedLayout>(&self, addr: impl Into<SymbolRef>) -> Result<T>
    {
        let bytes = self.read_virtual(addr, T::SIZE)?;
        exact("read_virtual_struct", T::SIZE, bytes.len())?;
        T::decode(&bytes)
    }

    /// Write a fixed-layout structure; the size is the structure's declared size.
    pub fn write_virtual_struct<T: FixedLayout>(&mut self, addr: impl Into<SymbolRef>, value: &T) -> Result<usize>
    {
        let bytes = value.encode();
        if bytes.len() != T::SIZE {
            return Err(LkdError::InvalidArgument(format!(
                "structure encoded to {} bytes, declared {}",
                bytes.len(),
                T::SIZE
            )));
        }
        self.write_virtual(addr, &bytes)
    }

    /// Translate a virtual address to a physical one.
    ///
    /// ## Errors
    ///
    /// - `EngineCallFailed`: the address is not mapped
    pub fn virtual_to_physical(&self, addr: impl Into<SymbolRef>) -> Result<u64>
    {
        let offset = self.resolve_symbol(addr)?;
        let phys = self
            .engine
            .virtual_to_physical(offset)
            .op("virtual_to_physical")?;
        trace!("virtual_to_physical {} -> 0x{:x}", offset, phys);
        Ok(phys)
    }

    /// Write physical memory addressed through a virtual address.
    ///
    /// Bypasses page protections on the virtual side.
    pub fn write_pfv(&mut self, addr: impl Into<SymbolRef>, data: &[u8]) -> Result<usize>
    {
        let phys = self.virtual_to_physical(addr)?;
        self.write_physical(phys, data)
    }

    // ---- physical memory ---------------------------------------------------

    /// Read up to `size` bytes of physical memory.
    pub fn read_physical(&self, addr: u64, size: usize) -> Result<Vec<u8>>
    {
        let mut buf = vec![0u8; size];
        let read = self.read_physical_into(addr, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    pub fn read_physical_into(&self, addr: u64, buf: &mut [u8]) -> Result<usize>
    {
        self.engine.read_physical(addr, buf).op("read_physical")
    }

    pub fn write_physical(&mut self, addr: u64, data: &[u8]) -> Result<usize>
    {
        self.engine.write_physical(addr, data).op("write_physical")
    }

    pub fn read_physical_struct<T: FixedLayout>(&self, addr: u64) -> Result<T>
    {
        let bytes = self.read_physical(addr, T::SIZE)?;
        exact("read_physical_struct", T::SIZE, bytes.len())?;
        T::decode(&bytes)
    }

    pub fn write_physical_struct<T: FixedLayout>(&mut self, addr: u64, value: &T) -> Result<usize>
    {
        let bytes = value.encode();
        if bytes.len() != T::SIZE {
            return Err(LkdError::InvalidArgument(format!(
                "structure encoded to {} bytes, declared {}",
                bytes.len(),
                T::SIZE
            )));
        }
        self.write_physical(addr, &bytes)
    }

    // ---- fixed-width helpers -----------------------------------------------

    fn read_exact_virtual<const N: usize>(&self, operation: &'static str, addr: impl Into<SymbolRef>) -> Result<[u8; N]>
    {
        let mut buf = [0u8; N];
        let read = self.read_virtual_into(addr, &mut buf)?;
        exact(operation, N, read)?;
        Ok(buf)
    }

    fn read_exact_physical<const N: usize>(&self, operation: &'static str, addr: u64) -> Result<[u8; N]>
    {
        let mut buf = [0u8; N];
        let read = self.read_physical_into(addr, &mut buf)?;
        exact(operation, N, read)?;
        Ok(buf)
    }

    pub fn read_byte(&self, addr: impl Into<SymbolRef>) -> Result<u8>
    {
        self.read_exact_virtual::<1>("read_byte", addr).map(u8::from_le_bytes)
    }

    pub fn read_word(&self, addr: impl Into<SymbolRef>) -> Result<u16>
    {
        self.read_exact_virtual::<2>("read_word", addr).map(u16::from_le_bytes)
    }

    /// Read a little-endian `u32` of virtual memory.
    ///
    /// ## Errors
    ///
    /// - `ShortTransfer`: fewer than 4 bytes were readable
    pub fn read_dword(&self, addr: impl Into<SymbolRef>) -> Result<u32>
    {
        self.read_exact_virtual::<4>("read_dword", addr).map(u32::from_le_bytes)
    }

    pub fn read_qword(&self, addr: impl Into<SymbolRef>) -> Result<u64>
    {
        self.read_exact_virtual::<8>("read_qword", addr).map(u64::from_le_bytes)
    }

    pub fn read_byte_p(&self, addr: u64) -> Result<u8>
    {
        self.read_exact_physical::<1>("read_byte_p", addr).map(u8::from_le_bytes)
    }

    pub fn read_word_p(&self, addr: u64) -> Result<u16>
    {
        self.read_exact_physical::<2>("read_word_p", addr).map(u16::from_le_bytes)
    }

    pub fn read_dword_p(&self, addr: u64) -> Result<u32>
    {
        self.read_exact_physical::<4>("read_dword_p", addr).map(u32::from_le_bytes)
    }

    pub fn read_qword_p(&self, addr: u64) -> Result<u64>
    {
        self.read_exact_physical::<8>("read_qword_p", addr).map(u64::from_le_bytes)
    }

    pub fn write_byte(&mut self, addr: impl Into<SymbolRef>, value: u8) -> Result<usize>
    {
        self.write_virtual(addr, &value.to_le_bytes())
    }

    pub fn write_word(&mut self, addr: impl Into<SymbolRef>, value: u16) -> Result<usize>
    {
        self.write_virtual(addr, &value.to_le_bytes())
    }

    pub fn write_dword(&mut self, addr: impl Into<SymbolRef>, value: u32) -> Result<usize>
    {
        self.write_virtual(addr, &value.to_le_bytes())
    }

    pub fn write_qword(&mut self, addr: impl Into<SymbolRef>, value: u64) -> Result<usize>
    {
        self.write_virtual(addr, &value.to_le_bytes())
    }

    pub fn write_byte_p(&mut self, addr: u64, value: u8) -> Result<usize>
    {
        self.write_physical(addr, &value.to_le_bytes())
    }

    pub fn write_word_p(&mut self, addr: u64, value: u16) -> Result<usize>
    {
        self.write_physical(addr, &value.to_le_bytes())
    }

    pub fn write_dword_p(&mut self, addr: u64, value: u32) -> Result<usize>
    {
        self.write_physical(addr, &value.to_le_bytes())
    }

    pub fn write_qword_p(&mut self, addr: u64, value: u64) -> Result<usize>
    {
        self.write_physical(addr, &value.to_le_bytes())
    }

    // ---- pointer-width helpers ---------------------------------------------

    /// Read a target pointer from virtual memory.
    ///
    /// The width comes from the session's bitness strategy.
    ///
    /// ## Errors
    ///
    /// - `NotImplemented`: the strategy does not declare a pointer size
    /// - `ShortTransfer`: fewer than pointer-size bytes were readable
    pub fn read_ptr(&self, addr: impl Into<SymbolRef>) -> Result<Address>
    {
        match self.bitness.pointer_size()? {
            4 => self.read_dword(addr).map(|v| Address::new(u64::from(v))),
            _ => self.read_qword(addr).map(Address::new),
        }
    }

    pub fn read_ptr_p(&self, addr: u64) -> Result<Address>
    {
        match self.bitness.pointer_size()? {
            4 => self.read_dword_p(addr).map(|v| Address::new(u64::from(v))),
            _ => self.read_qword_p(addr).map(Address::new),
        }
    }

    /// Write a target pointer to virtual memory.
    ///
    /// ## Errors
    ///
    /// - `NotImplemented`: the strategy does not declare a pointer size
    /// - `InvalidArgument`: the value does not fit a 32-bit pointer
    pub fn write_ptr(&mut self, addr: impl Into<SymbolRef>, value: Address) -> Result<usize>
    {
        match self.bitness.pointer_size()? {
            4 => {
                let narrow = Self::narrow_pointer(value)?;
                self.write_dword(addr, narrow)
            }
            _ => self.write_qword(addr, value.value()),
        }
    }

    pub fn write_ptr_p(&mut self, addr: u64, value: Address) -> Result<usize>
    {
        match self.bitness.pointer_size()? {
            4 => {
                let narrow = Self::narrow_pointer(value)?;
                self.write_dword_p(addr, narrow)
            }
            _ => self.write_qword_p(addr, value.value()),
        }
    }

    fn narrow_pointer(value: Address) -> Result<u32>
    {
        u32::try_from(value.value())
            .map_err(|_| LkdError::InvalidArgument(format!("{value} does not fit a 32-bit pointer")))
    }

    // ---- strings -----------------------------------------------------------

    /// Read a NUL-terminated byte string.
    ///
    /// Reads 256-byte chunks until one contains a zero byte. There is no upper
    /// bound: memory without a terminator is read until a chunk fails.
    /// Non-UTF-8 bytes are replaced with U+FFFD.
    ///
    /// ## Errors
    ///
    /// - `EngineCallFailed`: a chunk could not be read before a terminator
    ///   was found
    pub fn read_string(&self, addr: impl Into<SymbolRef>) -> Result<String>
    {
        let base = self.trim(self.resolve_symbol(addr)?.value());
        let mut text = Vec::new();
        for chunk_index in 0u64.. {
            let chunk = self.read_string_chunk("read_string", base, chunk_index)?;
            if let Some(nul) = chunk.iter().position(|b| *b == 0) {
                text.extend_from_slice(&chunk[..nul]);
                break;
            }
            text.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&text).into_owned())
    }

    /// Read a NUL-terminated UTF-16LE string.
    ///
    /// Same chunking as [`read_string`](Self::read_string), scanning aligned
    /// 16-bit units for a zero unit. Units that do not decode as UTF-16 are
    /// returned raw.
    pub fn read_wstring(&self, addr: impl Into<SymbolRef>) -> Result<WideText>
    {
        let base = self.trim(self.resolve_symbol(addr)?.value());
        let mut raw = Vec::new();
        'chunks: for chunk_index in 0u64.. {
            let chunk = self.read_string_chunk("read_wstring", base, chunk_index)?;
            for unit in chunk.chunks_exact(2) {
                if unit == [0, 0] {
                    break 'chunks;
                }
                raw.extend_from_slice(unit);
            }
        }
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        match String::from_utf16(&units) {
            Ok(text) => Ok(WideText::Decoded(text)),
            Err(e) => {
                debug!("read_wstring at {}: {}", base, e);
                Ok(WideText::Undecodable(raw))
            }
        }
    }

    fn read_string_chunk(&self, operation: &'static str, base: Address, chunk_index: u64) -> Result<Vec<u8>>
    {
        let at = base + chunk_index * STRING_CHUNK as u64;
        let chunk = self.read_virtual(at, STRING_CHUNK)?;
        if chunk.is_empty() {
            return Err(LkdError::ShortTransfer {
                operation,
                expected: STRING_CHUNK,
                actual: 0,
            });
        }
        Ok(chunk)
    }

    // ---- port I/O, bus data, MSRs ------------------------------------------

    /// Read an I/O port (`in`), `size` being 1, 2 or 4 bytes.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: unsupported size
    /// - `ShortTransfer`: the engine returned fewer than `size` bytes
    pub fn read_io(&self, port: u64, size: usize) -> Result<u32>
    {
        Self::check_io_size(size)?;
        let mut buf = [0u8; 4];
        let read = self
            .engine
            .read_io(IoLocation::ISA_PORTS, port, &mut buf[..size])
            .op("read_io")?;
        exact("read_io", size, read)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write an I/O port (`out`) with a `size`-byte little-endian value.
    pub fn write_io(&mut self, port: u64, value: u32, size: usize) -> Result<usize>
    {
        Self::check_io_size(size)?;
        let bytes = value.to_le_bytes();
        if size < 4 && value >> (8 * size) != 0 {
            return Err(LkdError::InvalidArgument(format!(
                "0x{value:x} does not fit a {size}-byte port write"
            )));
        }
        self.write_io_bytes(port, &bytes[..size])
    }

    /// Write raw bytes to an I/O port; the size is the length of `data`.
    pub fn write_io_bytes(&mut self, port: u64, data: &[u8]) -> Result<usize>
    {
        self.engine
            .write_io(IoLocation::ISA_PORTS, port, data)
            .op("write_io")
    }

    fn check_io_size(size: usize) -> Result<()>
    {
        match size {
            1 | 2 | 4 => Ok(()),
            other => Err(LkdError::InvalidArgument(format!(
                "I/O access size must be 1, 2 or 4, got {other}"
            ))),
        }
    }

    /// Read bus configuration data, e.g. a PCI configuration space.
    pub fn read_bus_data(&self, slot: BusSlot, offset: u32, size: usize) -> Result<Vec<u8>>
    {
        let mut buf = vec![0u8; size];
        let read = self
            .engine
            .read_bus_data(slot, offset, &mut buf)
            .op("read_bus_data")?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Write bus configuration data, returning the bytes written.
    pub fn write_bus_data(&mut self, slot: BusSlot, offset: u32, data: &[u8]) -> Result<usize>
    {
        self.engine
            .write_bus_data(slot, offset, data)
            .op("write_bus_data")
    }

    pub fn read_msr(&self, msr: u32) -> Result<u64>
    {
        self.engine.read_msr(msr).op("read_msr")
    }

    pub fn write_msr(&mut self, msr: u32, value: u64) -> Result<()>
    {
        self.engine.write_msr(msr, value).op("write_msr")
    }

    /// Processor system data (`KPCR`/`KPRCB`/`KTHREAD` offsets, identification, speed).
    pub fn read_processor_system_data(&self, processor: u32, kind: ProcessorDataKind) -> Result<ProcessorData>
    {
        let mut buf = vec![0u8; kind.buffer_size()];
        let size = self
            .engine
            .read_processor_system_data(processor, kind, &mut buf)
            .op("read_processor_system_data")?;
        buf.truncate(size);
        match kind {
            ProcessorDataKind::Identification => Ok(ProcessorData::Identification(buf)),
            ProcessorDataKind::Speed => {
                let bytes: [u8; 4] = buf.as_slice().try_into().map_err(|_| LkdError::ShortTransfer {
                    operation: "read_processor_system_data",
                    expected: 4,
                    actual: buf.len(),
                })?;
                Ok(ProcessorData::Speed(u32::from_le_bytes(bytes)))
            }
            _ => {
                let bytes: [u8; 8] = buf.as_slice().try_into().map_err(|_| LkdError::ShortTransfer {
                    operation: "read_processor_system_data",
                    expected: 8,
                    actual: buf.len(),
                })?;
                Ok(ProcessorData::Offset(u64::from_le_bytes(bytes)))
            }
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::bitness::PointerWidth;
    use crate::config::SessionConfig;
    use crate::engine::FixtureEngine;

    fn session(engine: FixtureEngine, width: PointerWidth) -> KernelSession<FixtureEngine>
    {
        KernelSession::new(engine, width, SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_short_scalar_read_is_an_error()
    {
        let engine = FixtureEngine::new().with_virtual(0x1ffe, &[1, 2]);
        let session = session(engine, PointerWidth::Bits64);
        assert!(matches!(
            session.read_dword(0x1ffeu64),
            Err(LkdError::ShortTransfer { expected: 4, actual: 2, .. })
        ));
        assert_eq!(session.read_word(0x1ffeu64).unwrap(), 0x0201);
    }

    #[test]
    fn test_read_string_spans_chunks()
    {
        let mut bytes = vec![b'a'; 0x180];
        bytes.push(0);
        let engine = FixtureEngine::new().with_virtual(0x4000, &bytes);
        let session = session(engine, PointerWidth::Bits64);
        assert_eq!(session.read_string(0x4000u64).unwrap().len(), 0x180);
    }

    #[test]
    fn test_read_wstring_decodes_utf16()
    {
        let mut bytes: Vec<u8> = "\\Device\\Null".encode_utf16().flat_map(u16::to_le_bytes).collect();
        bytes.extend_from_slice(&[0, 0]);
        let engine = FixtureEngine::new().with_virtual(0x8000, &bytes);
        let session = session(engine, PointerWidth::Bits64);
        assert_eq!(
            session.read_wstring(0x8000u64).unwrap(),
            WideText::Decoded("\\Device\\Null".to_string())
        );
    }

    #[test]
    fn test_read_wstring_returns_raw_units_on_bad_utf16()
    {
        // Lone high surrogate
        let engine = FixtureEngine::new().with_virtual(0x8000, &[0x00, 0xd8, 0x41, 0x00, 0, 0]);
        let session = session(engine, PointerWidth::Bits64);
        let text = session.read_wstring(0x8000u64).unwrap();
        assert_eq!(text, WideText::Undecodable(vec![0x00, 0xd8, 0x41, 0x00]));
        assert_eq!(text.to_string_lossy(), "\u{fffd}A");
    }

    #[test]
    fn test_io_sizes()
    {
        let engine = FixtureEngine::new().with_io_port(0x64, &[0x1c, 0x00, 0x00, 0x00]);
        let mut session = session(engine, PointerWidth::Bits64);
        assert_eq!(session.read_io(0x64, 1).unwrap(), 0x1c);
        assert!(matches!(session.read_io(0x64, 3), Err(LkdError::InvalidArgument(_))));
        assert_eq!(session.write_io(0x80, 0xbeef, 2).unwrap(), 2);
        assert!(session.write_io(0x80, 0x1_0000, 2).is_err());
        assert_eq!(session.write_io_bytes(0x84, &[1, 2, 3, 4]).unwrap(), 4);
        assert_eq!(session.read_io(0x84, 4).unwrap(), 0x0403_0201);
    }

    #[test]
    fn test_pointer_helpers_follow_width()
    {
        let engine = FixtureEngine::new_32bit().with_virtual(0xffff_ffff_8000_1000, &[0; 8]);
        let mut session = session(engine, PointerWidth::Bits32);
        session.write_ptr(0x8000_1000u64, Address::new(0x8123_4567)).unwrap();
        assert_eq!(session.read_ptr(0x8000_1000u64).unwrap(), Address::new(0x8123_4567));
        assert_eq!(session.read_dword(0x8000_1004u64).unwrap(), 0);
        assert!(session.write_ptr(0x8000_1000u64, Address::new(0x1_0000_0000)).is_err());
    }

    #[test]
    fn test_processor_system_data()
    {
        let engine = FixtureEngine::new()
            .with_processor_data(0, ProcessorDataKind::KpcrOffset, &0xffff_f800_1000_0000u64.to_le_bytes())
            .with_processor_data(0, ProcessorDataKind::Speed, &3000u32.to_le_bytes());
        let session = session(engine, PointerWidth::Bits64);
        assert_eq!(
            session.read_processor_system_data(0, ProcessorDataKind::KpcrOffset).unwrap(),
            ProcessorData::Offset(0xffff_f800_1000_0000)
        );
        assert_eq!(
            session.read_processor_system_data(0, ProcessorDataKind::Speed).unwrap(),
            ProcessorData::Speed(3000)
        );
        assert!(session.read_processor_system_data(1, ProcessorDataKind::Speed).is_err());
    }
}
