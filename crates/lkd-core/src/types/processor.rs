//! Processor system data and fixed-layout structures.

use crate::error::{LkdError, Result};

/// Selector of `ReadProcessorSystemData` (`DEBUG_DATA_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ProcessorDataKind
{
    KpcrOffset = 0,
    KprcbOffset = 1,
    KthreadOffset = 2,
    BaseTranslationVirtualOffset = 3,
    Identification = 4,
    Speed = 5,
}

impl ProcessorDataKind
{
    /// Size of the output buffer the engine expects for this selector.
    ///
    /// The identification record is a union over every supported processor
    /// family; 128 bytes covers the largest member.
    pub const fn buffer_size(self) -> usize
    {
        match self {
            ProcessorDataKind::Identification => 128,
            ProcessorDataKind::Speed => 4,
            _ => 8,
        }
    }
}

/// Typed result of a processor system data query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorData
{
    /// Raw `DEBUG_PROCESSOR_IDENTIFICATION_ALL` record
    Identification(Vec<u8>),
    /// Processor speed in MHz
    Speed(u32),
    /// Kernel virtual address of the selected structure
    Offset(u64),
}

/// A structure with a fixed little-endian byte layout.
///
/// Lets callers read and write whole kernel structures through the session
/// instead of raw byte buffers. `SIZE` is the declared byte size; `encode`
/// must produce exactly that many bytes and `decode` receives exactly that many.
pub trait FixedLayout: Sized
{
    /// Declared byte size of the structure.
    const SIZE: usize;

    /// Serialize into exactly `SIZE` bytes.
    fn encode(&self) -> Vec<u8>;

    /// Deserialize from exactly `SIZE` bytes.
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// `LIST_ENTRY` of a 64-bit kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListEntry64
{
    pub flink: u64,
    pub blink: u64,
}

impl FixedLayout for ListEntry64
{
    const SIZE: usize = 16;

    fn encode(&self) -> Vec<u8>
    {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(&self.flink.to_le_bytes());
        bytes.extend_from_slice(&self.blink.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8]) -> Result<Self>
    {
        let flink = bytes.get(0..8).and_then(|b| b.try_into().ok()).map(u64::from_le_bytes);
        let blink = bytes.get(8..16).and_then(|b| b.try_into().ok()).map(u64::from_le_bytes);
        match (flink, blink) {
            (Some(flink), Some(blink)) => Ok(Self { flink, blink }),
            _ => Err(LkdError::InvalidArgument(format!(
                "LIST_ENTRY64 needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            ))),
        }
    }
}

/// `LIST_ENTRY` of a 32-bit kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListEntry32
{
    pub flink: u32,
    pub blink: u32,
}

impl FixedLayout for ListEntry32
{
    const SIZE: usize = 8;

    fn encode(&self) -> Vec<u8>
    {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(&self.flink.to_le_bytes());
        bytes.extend_from_slice(&self.blink.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8]) -> Result<Self>
    {
        let flink = bytes.get(0..4).and_then(|b| b.try_into().ok()).map(u32::from_le_bytes);
        let blink = bytes.get(4..8).and_then(|b| b.try_into().ok()).map(u32::from_le_bytes);
        match (flink, blink) {
            (Some(flink), Some(blink)) => Ok(Self { flink, blink }),
            _ => Err(LkdError::InvalidArgument(format!(
                "LIST_ENTRY32 needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_list_entry64_layout()
    {
        let entry = ListEntry64 {
            flink: 0xffff_f800_0000_1000,
            blink: 0xffff_f800_0000_2000,
        };
        let bytes = entry.encode();
        assert_eq!(bytes.len(), ListEntry64::SIZE);
        assert_eq!(&bytes[0..8], &0xffff_f800_0000_1000u64.to_le_bytes());
        assert_eq!(ListEntry64::decode(&bytes).unwrap(), entry);
    }

    #[test]
    fn test_list_entry_decode_rejects_short_input()
    {
        assert!(ListEntry32::decode(&[0u8; 7]).is_err());
        assert!(ListEntry64::decode(&[0u8; 15]).is_err());
    }

    #[test]
    fn test_processor_buffer_sizes()
    {
        assert_eq!(ProcessorDataKind::Speed.buffer_size(), 4);
        assert_eq!(ProcessorDataKind::KpcrOffset.buffer_size(), 8);
        assert!(ProcessorDataKind::Identification.buffer_size() >= 64);
    }
}
