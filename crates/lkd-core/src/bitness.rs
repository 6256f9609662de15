//! # Bitness Strategies
//!
//! Conversion between target addresses and the 64-bit addresses the engine
//! expects in every query.
//!
//! A session binds exactly one strategy when it is constructed and routes every
//! address through it: `expand` right before an engine call, `trim` right after
//! an engine call returns an address. Operations never branch on the target
//! width themselves.
//!
//! - [`Bits64`]: both directions are the identity.
//! - [`Bits32`]: `expand` bit-extends addresses with bit 31 set into the
//!   upper half (`0x8xxxxxxx` -> `0xffffffff8xxxxxxx`), `trim` keeps the low
//!   32 bits.

use std::fmt;
use std::str::FromStr;

use crate::error::{LkdError, Result};
use crate::types::{Address, CanonicalAddress};

/// Address expansion/truncation policy of a target kernel.
pub trait Bitness: fmt::Debug + Send + Sync
{
    /// Convert a target address to the engine's 64-bit form.
    fn expand(&self, addr: Address) -> CanonicalAddress;

    /// Convert a 64-bit engine address back to the target's native width.
    fn trim(&self, raw: u64) -> Address;

    /// Width of a target pointer in bytes.
    ///
    /// The capability is bitness dependent and has no sensible default.
    fn pointer_size(&self) -> Result<usize>
    {
        Err(LkdError::NotImplemented("bitness dependent".to_string()))
    }

    /// [`expand`](Self::expand) lifted over absent values.
    fn expand_opt(&self, addr: Option<Address>) -> Option<CanonicalAddress>
    {
        addr.map(|addr| self.expand(addr))
    }

    /// [`trim`](Self::trim) lifted over absent values.
    fn trim_opt(&self, raw: Option<u64>) -> Option<Address>
    {
        raw.map(|raw| self.trim(raw))
    }
}

/// Strategy for 32-bit target kernels.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bits32;

impl Bitness for Bits32
{
    fn expand(&self, addr: Address) -> CanonicalAddress
    {
        let low = addr.value() & 0xffff_ffff;
        if low & 0x8000_0000 != 0 {
            CanonicalAddress::from_raw(0xffff_ffff_0000_0000 | low)
        } else {
            CanonicalAddress::from_raw(low)
        }
    }

    fn trim(&self, raw: u64) -> Address
    {
        Address::new(raw & 0xffff_ffff)
    }

    fn pointer_size(&self) -> Result<usize>
    {
        Ok(4)
    }
}

/// Strategy for 64-bit target kernels.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bits64;

impl Bitness for Bits64
{
    fn expand(&self, addr: Address) -> CanonicalAddress
    {
        CanonicalAddress::from_raw(addr.value())
    }

    fn trim(&self, raw: u64) -> Address
    {
        Address::new(raw)
    }

    fn pointer_size(&self) -> Result<usize>
    {
        Ok(8)
    }
}

static BITS32: Bits32 = Bits32;
static BITS64: Bits64 = Bits64;

/// Pointer width of the target kernel, used to pick a [`Bitness`] strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerWidth
{
    /// 32-bit kernel (x86)
    Bits32,
    /// 64-bit kernel (x64)
    Bits64,
}

impl PointerWidth
{
    /// Shared strategy instance for this width.
    #[must_use]
    pub fn strategy(self) -> &'static dyn Bitness
    {
        match self {
            PointerWidth::Bits32 => &BITS32,
            PointerWidth::Bits64 => &BITS64,
        }
    }
}

impl fmt::Display for PointerWidth
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            PointerWidth::Bits32 => write!(f, "32-bit"),
            PointerWidth::Bits64 => write!(f, "64-bit"),
        }
    }
}

impl FromStr for PointerWidth
{
    type Err = LkdError;

    fn from_str(s: &str) -> Result<Self>
    {
        match s.trim().to_lowercase().as_str() {
            "32" | "x86" | "i386" => Ok(PointerWidth::Bits32),
            "64" | "x64" | "amd64" => Ok(PointerWidth::Bits64),
            other => Err(LkdError::InvalidArgument(format!(
                "unknown pointer width '{other}', use 32 or 64"
            ))),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_bits32_round_trip_high_half()
    {
        for raw in [0x8000_0000u64, 0x8040_1234, 0xffff_ffff, 0xc000_0000] {
            let addr = Address::new(raw);
            let expanded = Bits32.expand(addr);
            assert_eq!(expanded.value() >> 32, 0xffff_ffff);
            assert_eq!(Bits32.trim(expanded.value()), addr);
        }
    }

    #[test]
    fn test_bits32_low_half_is_not_extended()
    {
        assert_eq!(Bits32.expand(Address::new(0x7fff_ffff)).value(), 0x7fff_ffff);
        assert_eq!(Bits32.expand(Address::new(0x1000)).value(), 0x1000);
    }

    #[test]
    fn test_bits32_expand_is_idempotent_on_canonical_input()
    {
        let canonical = Bits32.expand(Address::new(0x8040_0000));
        assert_eq!(Bits32.expand(Address::new(canonical.value())), canonical);
    }

    #[test]
    fn test_bits64_is_identity()
    {
        for raw in [0u64, 0x8000_0000, 0xffff_f800_0000_0000, u64::MAX] {
            assert_eq!(Bits64.expand(Address::new(raw)).value(), raw);
            assert_eq!(Bits64.trim(raw).value(), raw);
        }
    }

    #[test]
    fn test_absent_values_propagate()
    {
        for width in [PointerWidth::Bits32, PointerWidth::Bits64] {
            let strategy = width.strategy();
            assert_eq!(strategy.expand_opt(None), None);
            assert_eq!(strategy.trim_opt(None), None);
        }
    }

    #[test]
    fn test_pointer_size()
    {
        assert_eq!(PointerWidth::Bits32.strategy().pointer_size().unwrap(), 4);
        assert_eq!(PointerWidth::Bits64.strategy().pointer_size().unwrap(), 8);
    }

    #[test]
    fn test_pointer_size_defaults_to_not_implemented()
    {
        #[derive(Debug)]
        struct Undeclared;

        impl Bitness for Undeclared
        {
            fn expand(&self, addr: Address) -> CanonicalAddress
            {
                CanonicalAddress::from_raw(addr.value())
            }

            fn trim(&self, raw: u64) -> Address
            {
                Address::new(raw)
            }
        }

        assert!(matches!(Undeclared.pointer_size(), Err(LkdError::NotImplemented(_))));
    }

    #[test]
    fn test_pointer_width_from_str()
    {
        assert_eq!("32".parse::<PointerWidth>().unwrap(), PointerWidth::Bits32);
        assert_eq!("x64".parse::<PointerWidth>().unwrap(), PointerWidth::Bits64);
        assert!("16".parse::<PointerWidth>().is_err());
    }
}
