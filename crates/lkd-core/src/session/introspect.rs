//! Type introspection (experimental).
//!
//! Field layout queries go through the engine's symbol interface; child
//! enumeration and the rest of the type graph go through the low-level
//! `SymGetTypeInfo` query, issued against the dbghelp session handle fixed in
//! [`SessionConfig::type_info_handle`](crate::config::SessionConfig).
//!
//! Bitfields, nested anonymous unions and array-typed fields are reported as
//! the engine describes them, without further decoding.

use tracing::{debug, trace};

use super::{decode_name, KernelSession, NAME_BUFFER_SIZE};
use crate::engine::DebugEngine;
use crate::error::{EngineResultExt, LkdError, Result};
use crate::types::{
    CanonicalAddress, ChildTypes, FieldDescriptor, SymbolRef, TypeId, TypeInfo, TypeInfoOut, TypeInfoSelector,
    TypeInfoShape, TypeRef,
};

impl<E: DebugEngine> KernelSession<E>
{
    /// Name of a type.
    pub fn get_type_name(&self, module: impl Into<SymbolRef>, ty: impl Into<TypeRef>) -> Result<String>
    {
        let (base, type_id) = self.resolve_type(module, ty)?;
        self.type_name_at(base, type_id)
    }

    /// Size of a type in bytes.
    pub fn get_type_size(&self, module: impl Into<SymbolRef>, ty: impl Into<TypeRef>) -> Result<u32>
    {
        let (base, type_id) = self.resolve_type(module, ty)?;
        self.engine.get_type_size(base, type_id).op("get_type_size")
    }

    /// Byte offset of `field` within a type.
    pub fn get_field_offset(&self, module: impl Into<SymbolRef>, ty: impl Into<TypeRef>, field: &str) -> Result<u32>
    {
        let (base, type_id) = self.resolve_type(module, ty)?;
        self.engine
            .get_field_offset(base, type_id, field)
            .op("get_field_offset")
    }

    /// Name of the field at position `index`.
    ///
    /// ## Errors
    ///
    /// - `EngineCallFailed`: `index` is past the last field
    pub fn get_field_name(&self, module: impl Into<SymbolRef>, ty: impl Into<TypeRef>, index: u32) -> Result<String>
    {
        let (base, type_id) = self.resolve_type(module, ty)?;
        self.field_name_at(base, type_id, index)
    }

    /// Type and byte offset of `field`.
    pub fn get_field_type_and_offset(
        &self,
        module: impl Into<SymbolRef>,
        ty: impl Into<TypeRef>,
        field: &str,
    ) -> Result<(TypeId, u32)>
    {
        let (base, type_id) = self.resolve_type(module, ty)?;
        self.engine
            .get_field_type_and_offset(base, type_id, field)
            .op("get_field_type_and_offset")
    }

    /// Lazily enumerate the field names of a type.
    ///
    /// The type is resolved once, up front. The iterator probes field indices
    /// from 0 until the engine refuses one. A refusal at index 0 is yielded
    /// as an error (the query itself is bad or the type has no fields); a
    /// refusal at any later index ends the sequence. Each call starts over
    /// from index 0.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use lkd_core::bitness::PointerWidth;
    /// use lkd_core::config::SessionConfig;
    /// use lkd_core::engine::FixtureEngine;
    /// use lkd_core::session::KernelSession;
    ///
    /// let engine = FixtureEngine::new()
    ///     .with_module("nt", 0x1000, "ntoskrnl.exe")
    ///     .with_type(0x1000, 7, "_LIST_ENTRY", 16)
    ///     .with_field(0x1000, 7, "Flink", 8, 0)
    ///     .with_field(0x1000, 7, "Blink", 8, 8);
    /// let session = KernelSession::new(engine, PointerWidth::Bits64, SessionConfig::default())?;
    /// let names = session.field_names("nt", "_LIST_ENTRY")?.collect::<Result<Vec<_>, _>>()?;
    /// assert_eq!(names, ["Flink", "Blink"]);
    /// # Ok::<(), lkd_core::error::LkdError>(())
    /// ```
    pub fn field_names(&self, module: impl Into<SymbolRef>, ty: impl Into<TypeRef>) -> Result<FieldNames<'_, E>>
    {
        let (module, type_id) = self.resolve_type(module, ty)?;
        Ok(FieldNames {
            session: self,
            module,
            type_id,
            state: FieldCursor::Open { index: 0 },
        })
    }

    /// All field names of a type, in declaration order.
    pub fn get_all_fields(&self, module: impl Into<SymbolRef>, ty: impl Into<TypeRef>) -> Result<Vec<String>>
    {
        self.field_names(module, ty)?.collect()
    }

    /// Every field of a type with its type and offset.
    pub fn get_all_field_type_and_offset(
        &self,
        module: impl Into<SymbolRef>,
        ty: impl Into<TypeRef>,
    ) -> Result<Vec<FieldDescriptor>>
    {
        let (base, type_id) = self.resolve_type(module, ty)?;
        let names = self.field_names(base.value(), type_id)?.collect::<Result<Vec<_>>>()?;
        names
            .into_iter()
            .map(|name| {
                let (field_type, offset) = self
                    .engine
                    .get_field_type_and_offset(base, type_id, &name)
                    .op("get_field_type_and_offset")?;
                Ok(FieldDescriptor {
                    name,
                    type_id: field_type,
                    offset,
                })
            })
            .collect()
    }

    /// Low-level type-info query for selectors with a scalar or string result.
    ///
    /// The result shape follows the selector: `SymName` yields a name,
    /// `Length`/`RequestsValid` a 64-bit length, `Address` a 64-bit address,
    /// everything else a 32-bit word.
    ///
    /// ## Errors
    ///
    /// - `NotImplemented`: the selector needs a caller-built output structure
    ///   (`FindChildren`, `Value`); use
    ///   [`sym_get_type_info_into`](Self::sym_get_type_info_into)
    /// - `EngineCallFailed`: the engine rejected the query
    pub fn sym_get_type_info(
        &self,
        module: impl Into<SymbolRef>,
        ty: impl Into<TypeRef>,
        selector: TypeInfoSelector,
    ) -> Result<TypeInfo>
    {
        let shape = selector.shape();
        if shape == TypeInfoShape::CallerBuffer {
            return Err(LkdError::NotImplemented(format!(
                "type-info selector {selector} needs a caller-supplied buffer"
            )));
        }
        let (base, type_id) = self.resolve_type(module, ty)?;
        let process = self.config.type_info_handle;
        let info = match shape {
            TypeInfoShape::WideString => {
                let mut name = String::new();
                self.query_type_info(process, base, type_id, selector, TypeInfoOut::Name(&mut name))?;
                TypeInfo::Name(name)
            }
            TypeInfoShape::Length64 | TypeInfoShape::Address64 => {
                let mut value = 0u64;
                self.query_type_info(process, base, type_id, selector, TypeInfoOut::U64(&mut value))?;
                if shape == TypeInfoShape::Address64 {
                    TypeInfo::Address(value)
                } else {
                    TypeInfo::Length(value)
                }
            }
            TypeInfoShape::Dword | TypeInfoShape::CallerBuffer => {
                let mut value = 0u32;
                self.query_type_info(process, base, type_id, selector, TypeInfoOut::U32(&mut value))?;
                TypeInfo::Dword(value)
            }
        };
        trace!("sym_get_type_info {} #{}: {:?}", selector, type_id, info);
        Ok(info)
    }

    /// Low-level type-info query into a caller-built structure.
    pub fn sym_get_type_info_into(
        &self,
        module: impl Into<SymbolRef>,
        ty: impl Into<TypeRef>,
        selector: TypeInfoSelector,
        record: &mut [u8],
    ) -> Result<()>
    {
        let (base, type_id) = self.resolve_type(module, ty)?;
        self.query_type_info(
            self.config.type_info_handle,
            base,
            type_id,
            selector,
            TypeInfoOut::Raw(record),
        )
    }

    /// Number of children of a type.
    pub fn get_number_of_children(&self, module: impl Into<SymbolRef>, ty: impl Into<TypeRef>) -> Result<u32>
    {
        let (base, type_id) = self.resolve_type(module, ty)?;
        match self.sym_get_type_info(base.value(), type_id, TypeInfoSelector::ChildrenCount)? {
            TypeInfo::Dword(count) => Ok(count),
            other => Err(LkdError::InvalidArgument(format!(
                "children count answered with {other:?}"
            ))),
        }
    }

    /// Type identifiers of every child of a type.
    ///
    /// Sizes the find-children record from the child count, then lets the
    /// engine fill the identifiers and confirm the count.
    pub fn get_children_types(&self, module: impl Into<SymbolRef>, ty: impl Into<TypeRef>) -> Result<ChildTypes>
    {
        let (base, type_id) = self.resolve_type(module, ty)?;
        let count = self.get_number_of_children(base.value(), type_id)?;
        let mut record = ChildTypes::request(count);
        self.sym_get_type_info_into(base.value(), type_id, TypeInfoSelector::FindChildren, &mut record)?;
        let children = ChildTypes::decode(&record);
        if children.count != count {
            debug!(
                "get_children_types #{}: asked for {} children, engine confirmed {}",
                type_id, count, children.count
            );
        }
        Ok(children)
    }

    /// A handle on a resolved type.
    pub fn get_type(&self, module: impl Into<SymbolRef>, ty: impl Into<TypeRef>) -> Result<TypeHandle<'_, E>>
    {
        let (module, type_id) = self.resolve_type(module, ty)?;
        Ok(TypeHandle {
            session: self,
            module,
            type_id,
        })
    }

    fn query_type_info(
        &self,
        process: u64,
        base: CanonicalAddress,
        type_id: TypeId,
        selector: TypeInfoSelector,
        out: TypeInfoOut<'_>,
    ) -> Result<()>
    {
        self.engine
            .sym_get_type_info(process, base, type_id, selector, out)
            .op("sym_get_type_info")
    }

    fn type_name_at(&self, base: CanonicalAddress, type_id: TypeId) -> Result<String>
    {
        let mut buf = vec![0u8; NAME_BUFFER_SIZE];
        let size = self
            .engine
            .get_type_name(base, type_id, &mut buf)
            .op("get_type_name")?;
        Ok(decode_name("get_type_name", &buf, size))
    }

    fn field_name_at(&self, base: CanonicalAddress, type_id: TypeId, index: u32) -> Result<String>
    {
        let mut buf = vec![0u8; NAME_BUFFER_SIZE];
        let size = self
            .engine
            .get_field_name(base, type_id, index, &mut buf)
            .op("get_field_name")?;
        Ok(decode_name("get_field_name", &buf, size))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldCursor
{
    Open
    {
        index: u32
    },
    Exhausted,
}

/// Iterator over the field names of a type
///
/// Created by [`KernelSession::field_names`].
pub struct FieldNames<'a, E: DebugEngine>
{
    session: &'a KernelSession<E>,
    module: CanonicalAddress,
    type_id: TypeId,
    state: FieldCursor,
}

impl<E: DebugEngine> Iterator for FieldNames<'_, E>
{
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item>
    {
        let FieldCursor::Open { index } = self.state else {
            return None;
        };
        match self.session.field_name_at(self.module, self.type_id, index) {
            Ok(name) => {
                self.state = FieldCursor::Open { index: index + 1 };
                Some(Ok(name))
            }
            Err(e) => {
                self.state = FieldCursor::Exhausted;
                if index == 0 {
                    Some(Err(e))
                } else {
                    trace!("Type #{} has {} fields", self.type_id, index);
                    None
                }
            }
        }
    }
}

/// A resolved (module, type) pair bound to its session
pub struct TypeHandle<'a, E: DebugEngine>
{
    session: &'a KernelSession<E>,
    module: CanonicalAddress,
    type_id: TypeId,
}

impl<'a, E: DebugEngine> TypeHandle<'a, E>
{
    pub fn module(&self) -> CanonicalAddress
    {
        self.module
    }

    pub fn type_id(&self) -> TypeId
    {
        self.type_id
    }

    pub fn name(&self) -> Result<String>
    {
        self.session.type_name_at(self.module, self.type_id)
    }

    pub fn size(&self) -> Result<u32>
    {
        self.session.get_type_size(self.module.value(), self.type_id)
    }

    pub fn field_offset(&self, field: &str) -> Result<u32>
    {
        self.session.get_field_offset(self.module.value(), self.type_id, field)
    }

    /// Field names of the type.
    pub fn fields(&self) -> Result<FieldNames<'a, E>>
    {
        self.session.field_names(self.module.value(), self.type_id)
    }

    /// Every field with its type and offset.
    pub fn layout(&self) -> Result<Vec<FieldDescriptor>>
    {
        self.session
            .get_all_field_type_and_offset(self.module.value(), self.type_id)
    }

    pub fn children(&self) -> Result<ChildTypes>
    {
        self.session.get_children_types(self.module.value(), self.type_id)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::bitness::PointerWidth;
    use crate::config::SessionConfig;
    use crate::engine::FixtureEngine;

    const NT: u64 = 0xffff_f800_0260_0000;

    fn session() -> KernelSession<FixtureEngine>
    {
        let engine = FixtureEngine::new()
            .with_module("nt", NT, "ntkrnlmp.exe")
            .with_type(NT, 0x20, "_KPROCESS", 0x438)
            .with_field(NT, 0x20, "Header", 0x30, 0)
            .with_field(NT, 0x20, "ProfileListHead", 0x31, 0x18)
            .with_field(NT, 0x20, "DirectoryTableBase", 0x32, 0x28)
            .with_children(NT, 0x20, &[0x40, 0x41, 0x42]);
        KernelSession::new(engine, PointerWidth::Bits64, SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_scalar_type_queries()
    {
        let session = session();
        assert_eq!(session.get_type_name("nt", 0x20u32).unwrap(), "_KPROCESS");
        assert_eq!(session.get_type_size("nt", "_KPROCESS").unwrap(), 0x438);
        assert_eq!(session.get_field_offset("nt", "_KPROCESS", "DirectoryTableBase").unwrap(), 0x28);
        assert_eq!(session.get_field_name("nt", "_KPROCESS", 1).unwrap(), "ProfileListHead");
        assert_eq!(
            session.get_field_type_and_offset("nt", "_KPROCESS", "ProfileListHead").unwrap(),
            (TypeId(0x31), 0x18)
        );
    }

    #[test]
    fn test_field_names_restart_on_each_call()
    {
        let session = session();
        let first: Vec<_> = session.field_names("nt", "_KPROCESS").unwrap().collect();
        let second: Vec<_> = session.field_names("nt", "_KPROCESS").unwrap().collect();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
    }

    #[test]
    fn test_layout()
    {
        let session = session();
        let layout = session.get_all_field_type_and_offset("nt", "_KPROCESS").unwrap();
        assert_eq!(
            layout[2],
            FieldDescriptor {
                name: "DirectoryTableBase".to_string(),
                type_id: TypeId(0x32),
                offset: 0x28,
            }
        );
    }

    #[test]
    fn test_type_info_shapes()
    {
        let session = session();
        assert_eq!(
            session.sym_get_type_info("nt", "_KPROCESS", TypeInfoSelector::SymName).unwrap(),
            TypeInfo::Name("_KPROCESS".to_string())
        );
        assert_eq!(
            session.sym_get_type_info("nt", "_KPROCESS", TypeInfoSelector::Length).unwrap(),
            TypeInfo::Length(0x438)
        );
        assert!(matches!(
            session.sym_get_type_info("nt", "_KPROCESS", TypeInfoSelector::FindChildren),
            Err(LkdError::NotImplemented(_))
        ));
        assert!(matches!(
            session.sym_get_type_info("nt", "_KPROCESS", TypeInfoSelector::Value),
            Err(LkdError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_children()
    {
        let session = session();
        assert_eq!(session.get_number_of_children("nt", "_KPROCESS").unwrap(), 3);
        let children = session.get_children_types("nt", "_KPROCESS").unwrap();
        assert_eq!(children.count, 3);
        assert_eq!(children.types, vec![TypeId(0x40), TypeId(0x41), TypeId(0x42)]);
    }

    #[test]
    fn test_type_handle()
    {
        let session = session();
        let handle = session.get_type("nt", "_KPROCESS").unwrap();
        assert_eq!(handle.type_id(), TypeId(0x20));
        assert_eq!(handle.name().unwrap(), "_KPROCESS");
        assert_eq!(handle.size().unwrap(), 0x438);
        assert_eq!(handle.field_offset("ProfileListHead").unwrap(), 0x18);
        assert_eq!(handle.fields().unwrap().count(), 3);
        assert_eq!(handle.children().unwrap().types.len(), 3);
    }
}
