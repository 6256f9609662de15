//! Low-level type-info query vocabulary.
//!
//! The engine's type-graph is only partly reachable through its symbol
//! interface; the rest sits behind a dbghelp-style `SymGetTypeInfo(handle,
//! module, type, selector, out)` call whose output buffer shape depends on the
//! selector. [`TypeInfoSelector::shape`] is that mapping, and [`TypeInfo`] the
//! typed result.

use std::fmt;

use super::TypeId;

/// Selector of the low-level type-info query (`IMAGEHLP_SYMBOL_TYPE_INFO`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TypeInfoSelector
{
    SymTag = 0,
    SymName = 1,
    Length = 2,
    Type = 3,
    TypeId = 4,
    BaseType = 5,
    ArrayIndexTypeId = 6,
    FindChildren = 7,
    DataKind = 8,
    AddressOffset = 9,
    Offset = 10,
    Value = 11,
    Count = 12,
    ChildrenCount = 13,
    BitPosition = 14,
    VirtualBaseClass = 15,
    VirtualTableShapeId = 16,
    VirtualBasePointerOffset = 17,
    ClassParentId = 18,
    Nested = 19,
    SymIndex = 20,
    LexicalParent = 21,
    Address = 22,
    ThisAdjust = 23,
    UdtKind = 24,
    IsEquivTo = 25,
    CallingConvention = 26,
    IsCloseEquivTo = 27,
    RequestsValid = 28,
}

/// Output buffer shape a selector writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeInfoShape
{
    /// Engine-allocated wide string pointer
    WideString,
    /// 64-bit length
    Length64,
    /// 64-bit address
    Address64,
    /// 32-bit word (every selector not listed elsewhere)
    Dword,
    /// Caller must supply a pre-sized output structure
    CallerBuffer,
}

impl TypeInfoSelector
{
    /// Raw selector value passed to the engine.
    pub const fn raw(self) -> u32
    {
        self as u32
    }

    /// Output shape for this selector.
    pub const fn shape(self) -> TypeInfoShape
    {
        match self {
            TypeInfoSelector::SymName => TypeInfoShape::WideString,
            TypeInfoSelector::Length | TypeInfoSelector::RequestsValid => TypeInfoShape::Length64,
            TypeInfoSelector::Address => TypeInfoShape::Address64,
            TypeInfoSelector::FindChildren | TypeInfoSelector::Value => TypeInfoShape::CallerBuffer,
            _ => TypeInfoShape::Dword,
        }
    }
}

impl fmt::Display for TypeInfoSelector
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{self:?}({})", self.raw())
    }
}

/// Typed result of the low-level type-info query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeInfo
{
    Name(String),
    Length(u64),
    Address(u64),
    Dword(u32),
}

impl TypeInfo
{
    /// Numeric value of the result, if it has one.
    pub fn as_u64(&self) -> Option<u64>
    {
        match self {
            TypeInfo::Name(_) => None,
            TypeInfo::Length(value) | TypeInfo::Address(value) => Some(*value),
            TypeInfo::Dword(value) => Some(u64::from(*value)),
        }
    }

    /// Name carried by a `SymName` result.
    pub fn as_name(&self) -> Option<&str>
    {
        match self {
            TypeInfo::Name(name) => Some(name),
            _ => None,
        }
    }
}

/// Output slot handed to the engine for one type-info query.
///
/// The session picks the variant from the selector's [`TypeInfoShape`]; the
/// engine fills it in place.
#[derive(Debug)]
pub enum TypeInfoOut<'a>
{
    Name(&'a mut String),
    U64(&'a mut u64),
    U32(&'a mut u32),
    /// Caller-built structure, laid out as the engine expects it
    Raw(&'a mut [u8]),
}

/// Child type identifiers of a type (`TI_FINDCHILDREN_PARAMS`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildTypes
{
    /// Number of entries the engine confirmed
    pub count: u32,
    /// First child index requested
    pub start: u32,
    /// Child type identifiers
    pub types: Vec<TypeId>,
}

impl ChildTypes
{
    /// Byte size of the find-children record for `count` children.
    pub const fn record_size(count: u32) -> usize
    {
        8 + 4 * count as usize
    }

    /// Build the request record: `Count`, `Start`, then room for `count` ids.
    pub fn request(count: u32) -> Vec<u8>
    {
        let mut record = vec![0u8; Self::record_size(count)];
        record[0..4].copy_from_slice(&count.to_le_bytes());
        record
    }

    /// Decode a record filled by the engine.
    ///
    /// Never reads past the record, whatever `Count` the engine wrote back.
    pub fn decode(record: &[u8]) -> Self
    {
        let word = |at: usize| {
            record
                .get(at..at + 4)
                .map_or(0, |bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        };
        let count = word(0);
        let start = word(4);
        let capacity = record.len().saturating_sub(8) / 4;
        let types = (0..(count as usize).min(capacity))
            .map(|i| TypeId(word(8 + 4 * i)))
            .collect();
        Self { count, start, types }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_selector_shapes()
    {
        assert_eq!(TypeInfoSelector::SymName.shape(), TypeInfoShape::WideString);
        assert_eq!(TypeInfoSelector::Length.shape(), TypeInfoShape::Length64);
        assert_eq!(TypeInfoSelector::RequestsValid.shape(), TypeInfoShape::Length64);
        assert_eq!(TypeInfoSelector::Address.shape(), TypeInfoShape::Address64);
        assert_eq!(TypeInfoSelector::FindChildren.shape(), TypeInfoShape::CallerBuffer);
        assert_eq!(TypeInfoSelector::Value.shape(), TypeInfoShape::CallerBuffer);
        assert_eq!(TypeInfoSelector::ChildrenCount.shape(), TypeInfoShape::Dword);
        assert_eq!(TypeInfoSelector::BitPosition.shape(), TypeInfoShape::Dword);
    }

    #[test]
    fn test_children_request_layout()
    {
        let record = ChildTypes::request(3);
        assert_eq!(record.len(), 20);
        assert_eq!(&record[0..4], &3u32.to_le_bytes());
        assert!(record[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_children_decode_clamps_to_record()
    {
        let mut record = ChildTypes::request(2);
        record[0..4].copy_from_slice(&9u32.to_le_bytes());
        record[8..12].copy_from_slice(&0x10u32.to_le_bytes());
        record[12..16].copy_from_slice(&0x11u32.to_le_bytes());

        let children = ChildTypes::decode(&record);
        assert_eq!(children.count, 9);
        assert_eq!(children.types, vec![TypeId(0x10), TypeId(0x11)]);
    }
}
