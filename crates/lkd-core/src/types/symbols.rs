//! Symbol, type, module and field types.

use std::fmt;
use std::str::FromStr;

use super::Address;
use crate::error::{LkdError, Result};

/// Either an already-resolved target address or a symbol name
///
/// Every session operation that takes an address accepts a `SymbolRef`, so
/// callers can pass `0x8040_0000`, `Address::new(..)` or `"nt!KiSystemCall64"`
/// interchangeably.
///
/// ## Example
///
/// ```rust
/// use lkd_core::types::{Address, SymbolRef};
///
/// let by_name = SymbolRef::from("nt!PsActiveProcessHead");
/// let by_addr = SymbolRef::from(0x8040_0000u64);
/// assert!(by_name.as_name().is_some());
/// assert_eq!(by_addr.as_address(), Some(Address::new(0x8040_0000)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymbolRef
{
    /// Numeric target address
    Address(Address),
    /// Symbol name, resolved by the engine (e.g. `nt!KeBugCheckEx`)
    Name(String),
}

impl SymbolRef
{
    /// The name, if this reference still needs resolving.
    pub fn as_name(&self) -> Option<&str>
    {
        match self {
            SymbolRef::Name(name) => Some(name),
            SymbolRef::Address(_) => None,
        }
    }

    /// The address, if this reference is numeric.
    pub fn as_address(&self) -> Option<Address>
    {
        match self {
            SymbolRef::Address(addr) => Some(*addr),
            SymbolRef::Name(_) => None,
        }
    }

    /// Parse a command-line style reference.
    ///
    /// `0x`-prefixed hex and plain decimal become addresses, anything else is
    /// taken as a symbol name. Hex values may contain the backquote separator
    /// the engine prints inside 64-bit values.
    pub fn parse(input: &str) -> Result<Self>
    {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(LkdError::InvalidArgument("empty address or symbol".to_string()));
        }
        if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
            let digits: String = hex.chars().filter(|c| *c != '`').collect();
            return u64::from_str_radix(&digits, 16)
                .map(|value| SymbolRef::Address(Address::new(value)))
                .map_err(|err| LkdError::InvalidArgument(format!("bad hex address '{trimmed}': {err}")));
        }
        if trimmed.chars().all(|c| c.is_ascii_digit()) {
            return trimmed
                .parse::<u64>()
                .map(|value| SymbolRef::Address(Address::new(value)))
                .map_err(|err| LkdError::InvalidArgument(format!("bad address '{trimmed}': {err}")));
        }
        Ok(SymbolRef::Name(trimmed.to_string()))
    }
}

impl FromStr for SymbolRef
{
    type Err = LkdError;

    fn from_str(s: &str) -> Result<Self>
    {
        SymbolRef::parse(s)
    }
}

impl fmt::Display for SymbolRef
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            SymbolRef::Address(addr) => write!(f, "{addr}"),
            SymbolRef::Name(name) => write!(f, "{name}"),
        }
    }
}

impl From<Address> for SymbolRef
{
    fn from(value: Address) -> Self
    {
        SymbolRef::Address(value)
    }
}

impl From<u64> for SymbolRef
{
    fn from(value: u64) -> Self
    {
        SymbolRef::Address(Address::new(value))
    }
}

impl From<&str> for SymbolRef
{
    fn from(value: &str) -> Self
    {
        SymbolRef::Name(value.to_string())
    }
}

impl From<String> for SymbolRef
{
    fn from(value: String) -> Self
    {
        SymbolRef::Name(value)
    }
}

impl From<&SymbolRef> for SymbolRef
{
    fn from(value: &SymbolRef) -> Self
    {
        value.clone()
    }
}

/// Engine type identifier, scoped to a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u32);

impl TypeId
{
    /// Raw engine identifier.
    pub const fn raw(self) -> u32
    {
        self.0
    }
}

impl From<u32> for TypeId
{
    fn from(value: u32) -> Self
    {
        TypeId(value)
    }
}

impl fmt::Display for TypeId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Either a numeric type identifier or a type name within a module
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef
{
    /// Already-resolved identifier
    Id(TypeId),
    /// Type name (e.g. `_EPROCESS`)
    Name(String),
}

impl fmt::Display for TypeRef
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            TypeRef::Id(id) => write!(f, "#{id}"),
            TypeRef::Name(name) => write!(f, "{name}"),
        }
    }
}

impl From<TypeId> for TypeRef
{
    fn from(value: TypeId) -> Self
    {
        TypeRef::Id(value)
    }
}

impl From<u32> for TypeRef
{
    fn from(value: u32) -> Self
    {
        TypeRef::Id(TypeId(value))
    }
}

impl From<&str> for TypeRef
{
    fn from(value: &str) -> Self
    {
        TypeRef::Name(value.to_string())
    }
}

impl From<String> for TypeRef
{
    fn from(value: String) -> Self
    {
        TypeRef::Name(value)
    }
}

impl From<&TypeRef> for TypeRef
{
    fn from(value: &TypeRef) -> Self
    {
        value.clone()
    }
}

/// A loaded module as enumerated by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord
{
    /// Engine enumeration index
    pub index: u32,
    /// Load address of the image
    pub base: Address,
    /// Short module name (`nt`, `hal`, ...)
    pub module_name: String,
    /// Image file name (`ntkrnlmp.exe`)
    pub image_name: String,
    /// Name of the image file actually loaded by the engine
    pub loaded_image_name: String,
}

/// One field of a type: its name, type and byte offset in the owning type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor
{
    pub name: String,
    pub type_id: TypeId,
    pub offset: u32,
}

/// Result of a reverse symbol lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolHit
{
    /// Symbol name, including the module prefix
    pub name: String,
    /// Distance of the queried address from the symbol start
    pub displacement: u64,
}

impl fmt::Display for SymbolHit
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        if self.displacement == 0 {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}+0x{:x}", self.name, self.displacement)
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_parse_hex_and_decimal()
    {
        assert_eq!(SymbolRef::parse("0x1000").unwrap(), SymbolRef::from(0x1000u64));
        assert_eq!(SymbolRef::parse("4096").unwrap(), SymbolRef::from(4096u64));
        assert_eq!(
            SymbolRef::parse("0xfffff800`12345678").unwrap(),
            SymbolRef::from(0xffff_f800_1234_5678u64)
        );
    }

    #[test]
    fn test_parse_name()
    {
        assert_eq!(
            SymbolRef::parse(" nt!KeBugCheckEx ").unwrap(),
            SymbolRef::Name("nt!KeBugCheckEx".to_string())
        );
        assert!(SymbolRef::parse("").is_err());
        assert!(SymbolRef::parse("0xzz").is_err());
    }

    #[test]
    fn test_symbol_hit_display()
    {
        let exact = SymbolHit {
            name: "nt!KiSystemCall64".to_string(),
            displacement: 0,
        };
        let inside = SymbolHit {
            displacement: 0x12,
            ..exact.clone()
        };
        assert_eq!(exact.to_string(), "nt!KiSystemCall64");
        assert_eq!(inside.to_string(), "nt!KiSystemCall64+0x12");
    }
}
