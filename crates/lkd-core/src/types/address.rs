//! Target and engine address types.

use std::fmt;
use std::ops::{Add, Sub};

/// Address as meaningful to the debugged kernel
///
/// This wrapper around `u64` holds a *target* address: the value in the native
/// width of the target kernel. On a 32-bit kernel only the low 32 bits are ever
/// populated, on a 64-bit kernel the full value is used. Every public session
/// operation accepts and returns this type.
///
/// ## Why a separate type from `CanonicalAddress`?
///
/// The engine speaks 64-bit addresses only, and a 32-bit kernel's high-half
/// addresses are bit-extended in that space (`0x8xxxxxxx` becomes
/// `0xffffffff8xxxxxxx`). Keeping the two forms in different types means a
/// target address can never reach an engine call without going through the
/// session's bitness strategy.
///
/// ## Example
///
/// ```rust
/// use lkd_core::types::Address;
///
/// let addr = Address::from(0x1000);
/// let next_addr = addr + 0x100; // Add offset
/// assert_eq!(next_addr.value(), 0x1100);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address (0x0)
    pub const ZERO: Self = Address(0);

    /// Create a new address from a `u64` value
    ///
    /// This is equivalent to `Address::from(value)` but can be used in const contexts.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use lkd_core::types::Address;
    ///
    /// const KERNEL_BASE: Address = Address::new(0x8040_0000);
    /// ```
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Get the raw `u64` value of this address
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Add an offset to this address, checking for overflow
    ///
    /// ## Example
    ///
    /// ```rust
    /// use lkd_core::types::Address;
    ///
    /// let addr = Address::from(0x1000);
    /// assert_eq!(addr.checked_add(0x100), Some(Address::from(0x1100)));
    /// assert_eq!(addr.checked_add(u64::MAX), None); // Overflow
    /// ```
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an offset from this address, checking for underflow
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Address)
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}

/// Opaque 64-bit address in the engine's address space
///
/// Produced only by a [`Bitness`](crate::bitness::Bitness) strategy's `expand`
/// and consumed only by engine calls. It is recomputed for every call and never
/// stored by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanonicalAddress(u64);

impl CanonicalAddress
{
    pub(crate) const fn from_raw(value: u64) -> Self
    {
        CanonicalAddress(value)
    }

    /// Raw engine-space value, for use by engine implementations.
    pub const fn value(self) -> u64
    {
        self.0
    }
}

impl fmt::Display for CanonicalAddress
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_address_arithmetic_wraps()
    {
        assert_eq!(Address::new(u64::MAX) + 1, Address::ZERO);
        assert_eq!(Address::ZERO - 1, Address::new(u64::MAX));
        assert_eq!(Address::new(0x1000).checked_sub(0x2000), None);
    }

    #[test]
    fn test_display_formats()
    {
        assert_eq!(Address::new(0x8040_0000).to_string(), "0x80400000");
        assert_eq!(format!("{:08x}", Address::new(0x10)), "00000010");
        assert_eq!(
            CanonicalAddress::from_raw(0xffff_ffff_8040_0000).to_string(),
            "0xffffffff80400000"
        );
    }
}
