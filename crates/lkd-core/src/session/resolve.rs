//! Symbol and type resolution.
//!
//! Every operation that takes an address or a type goes through
//! [`KernelSession::resolve_symbol`] or [`KernelSession::resolve_type`].
//! Numeric references never touch the engine; names cost exactly one lookup.

use tracing::{debug, trace};

use super::{decode_name, KernelSession, NAME_BUFFER_SIZE};
use crate::engine::{DebugEngine, HResult};
use crate::error::{EngineResultExt, LkdError, Result};
use crate::types::{Address, CanonicalAddress, SymbolHit, SymbolRef, TypeId, TypeRef};

impl<E: DebugEngine> KernelSession<E>
{
    /// Normalise a symbol reference to an engine address.
    ///
    /// Integers are expanded without any engine call. Names are looked up
    /// once; an unknown name never defaults to zero.
    ///
    /// ## Errors
    ///
    /// - `UnknownSymbol`: the engine has no match for the name
    ///
    /// ## Example
    ///
    /// ```rust
    /// use lkd_core::bitness::PointerWidth;
    /// use lkd_core::config::SessionConfig;
    /// use lkd_core::engine::FixtureEngine;
    /// use lkd_core::session::KernelSession;
    ///
    /// let session = KernelSession::new(FixtureEngine::new_32bit(), PointerWidth::Bits32, SessionConfig::default())?;
    /// assert_eq!(session.resolve_symbol(0x8040_0000u64)?.value(), 0xffff_ffff_8040_0000);
    /// assert!(session.resolve_symbol("nt!Missing").is_err());
    /// # Ok::<(), lkd_core::error::LkdError>(())
    /// ```
    pub fn resolve_symbol(&self, symbol: impl Into<SymbolRef>) -> Result<CanonicalAddress>
    {
        match symbol.into() {
            SymbolRef::Address(addr) => Ok(self.expand(addr)),
            SymbolRef::Name(name) => {
                let addr = self
                    .get_symbol_offset(&name)
                    .ok_or(LkdError::UnknownSymbol(name))?;
                Ok(self.expand(addr))
            }
        }
    }

    /// Resolve a module reference and a type reference within it.
    ///
    /// The module is always resolved first, as a symbol reference. A numeric
    /// type is returned as is; a type name is looked up inside the module.
    ///
    /// ## Errors
    ///
    /// - `UnknownSymbol`: the module did not resolve
    /// - `UnknownType`: the module resolved but holds no such type
    pub fn resolve_type(&self, module: impl Into<SymbolRef>, ty: impl Into<TypeRef>) -> Result<(CanonicalAddress, TypeId)>
    {
        let module = module.into();
        let base = self.resolve_symbol(&module)?;
        match ty.into() {
            TypeRef::Id(id) => Ok((base, id)),
            TypeRef::Name(type_name) => match self.engine.get_type_id(base, &type_name) {
                Ok(id) => {
                    trace!("Resolved type {}!{} to {}", module, type_name, id);
                    Ok((base, id))
                }
                Err(status) => {
                    debug!("Type lookup {}!{} failed: {}", module, type_name, status);
                    Err(LkdError::UnknownType {
                        module: module.to_string(),
                        type_name,
                    })
                }
            },
        }
    }

    /// Address of a symbol, or `None` if the engine cannot resolve it.
    pub fn get_symbol_offset(&self, name: &str) -> Option<Address>
    {
        match self.engine.get_offset_by_name(name) {
            Ok(raw) => {
                let addr = self.trim(raw);
                trace!("Resolved {} to {}", name, addr);
                Some(addr)
            }
            Err(status) => {
                debug!("Symbol {} not resolved: {}", name, status);
                None
            }
        }
    }

    /// Symbol covering an address, with the displacement into it.
    ///
    /// Returns `Ok(None)` when no symbol covers the address.
    ///
    /// ## Errors
    ///
    /// - `UnknownSymbol`: `addr` is a name that did not resolve
    /// - `EngineCallFailed`: the engine failed for any other reason
    pub fn get_symbol(&self, addr: impl Into<SymbolRef>) -> Result<Option<SymbolHit>>
    {
        let offset = self.resolve_symbol(addr)?;
        let mut buf = vec![0u8; NAME_BUFFER_SIZE];
        match self.engine.get_name_by_offset(offset, &mut buf) {
            Ok((size, displacement)) => Ok(Some(SymbolHit {
                name: decode_name("get_symbol", &buf, size),
                displacement,
            })),
            Err(HResult::E_FAIL) => Ok(None),
            Err(status) => Err(LkdError::engine("get_symbol", status)),
        }
    }

    /// Type identifier of `type_name` inside `module`.
    ///
    /// ## Errors
    ///
    /// - `UnknownSymbol`: the module did not resolve
    /// - `EngineCallFailed`: the engine has no such type
    pub fn get_type_id(&self, module: impl Into<SymbolRef>, type_name: &str) -> Result<TypeId>
    {
        let base = self.resolve_symbol(module)?;
        self.engine.get_type_id(base, type_name).op("get_type_id")
    }

    /// Module base and type identifier of a symbol's type.
    pub fn get_symbol_type_id(&self, symbol: &str) -> Result<(Address, TypeId)>
    {
        let (type_id, module) = self
            .engine
            .get_symbol_type_id(symbol)
            .op("get_symbol_type_id")?;
        Ok((self.trim(module), type_id))
    }
}

#[cfg(test)]
mod tests
{
    use crate::bitness::PointerWidth;
    use crate::config::SessionConfig;
    use crate::engine::FixtureEngine;
    use crate::error::LkdError;
    use crate::session::KernelSession;
    use crate::types::TypeId;

    const NT: u64 = 0xffff_f800_0260_0000;

    fn session() -> KernelSession<FixtureEngine>
    {
        let engine = FixtureEngine::new()
            .with_module("nt", NT, "ntkrnlmp.exe")
            .with_symbol("nt!PsInitialSystemProcess", NT + 0x50)
            .with_type(NT, 0x10, "_EPROCESS", 0x850)
            .with_symbol_type("nt!PsInitialSystemProcess", 0x11, NT);
        KernelSession::new(engine, PointerWidth::Bits64, SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_resolve_type_by_name_and_id()
    {
        let session = session();
        let (base, id) = session.resolve_type("nt", "_EPROCESS").unwrap();
        assert_eq!(base.value(), NT);
        assert_eq!(id, TypeId(0x10));

        let (_, id) = session.resolve_type(NT, 0x99u32).unwrap();
        assert_eq!(id, TypeId(0x99));
    }

    #[test]
    fn test_resolve_type_errors_are_distinct()
    {
        let session = session();
        assert!(matches!(
            session.resolve_type("nope", "_EPROCESS"),
            Err(LkdError::UnknownSymbol(name)) if name == "nope"
        ));
        assert!(matches!(
            session.resolve_type("nt", "_NOPE"),
            Err(LkdError::UnknownType { module, type_name }) if module == "nt" && type_name == "_NOPE"
        ));
    }

    #[test]
    fn test_get_symbol_reports_displacement()
    {
        let session = session();
        let hit = session.get_symbol(NT + 0x58).unwrap().unwrap();
        assert_eq!(hit.name, "nt!PsInitialSystemProcess");
        assert_eq!(hit.displacement, 8);
    }

    #[test]
    fn test_get_symbol_below_every_symbol_is_none()
    {
        let session = session();
        assert_eq!(session.get_symbol(0x1000u64).unwrap(), None);
    }

    #[test]
    fn test_get_symbol_type_id()
    {
        let session = session();
        let (module, id) = session.get_symbol_type_id("nt!PsInitialSystemProcess").unwrap();
        assert_eq!(module.value(), NT);
        assert_eq!(id, TypeId(0x11));
        assert!(session.get_symbol_type_id("nt!Nope").is_err());
    }
}
