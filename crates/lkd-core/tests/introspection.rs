//! Tests for type introspection

use lkd_core::config::SessionConfig;
use lkd_core::engine::FixtureEngine;
use lkd_core::error::LkdError;
use lkd_core::types::{FieldDescriptor, TypeId, TypeInfo, TypeInfoSelector};
use lkd_core::{KernelSession, PointerWidth};

const NT: u64 = 0xffff_f800_0260_0000;
const LIST_ENTRY: u32 = 0x10;
const LIST_ENTRY_PTR: u32 = 0x11;
const KEVENT: u32 = 0x20;
const EMPTY: u32 = 0x30;

fn session() -> KernelSession<FixtureEngine>
{
    let engine = FixtureEngine::new()
        .with_module("nt", NT, "ntkrnlmp.exe")
        .with_type(NT, LIST_ENTRY, "_LIST_ENTRY", 16)
        .with_type(NT, LIST_ENTRY_PTR, "_LIST_ENTRY *", 8)
        .with_field(NT, LIST_ENTRY, "Flink", LIST_ENTRY_PTR, 0)
        .with_field(NT, LIST_ENTRY, "Blink", LIST_ENTRY_PTR, 8)
        .with_type(NT, KEVENT, "_KEVENT", 24)
        .with_field(NT, KEVENT, "Header", 0x21, 0)
        .with_children(NT, KEVENT, &[0x21])
        .with_type(NT, EMPTY, "_EMPTY_MARKER", 1);
    KernelSession::new(engine, PointerWidth::Bits64, SessionConfig::default()).unwrap()
}

#[test]
fn test_type_queries()
{
    let session = session();
    assert_eq!(session.get_type_name("nt", LIST_ENTRY).unwrap(), "_LIST_ENTRY");
    assert_eq!(session.get_type_size("nt", "_LIST_ENTRY").unwrap(), 16);
    assert_eq!(session.get_field_offset("nt", "_LIST_ENTRY", "Blink").unwrap(), 8);
    assert_eq!(session.get_field_name("nt", "_LIST_ENTRY", 0).unwrap(), "Flink");
    assert_eq!(
        session
            .get_field_type_and_offset("nt", "_LIST_ENTRY", "Blink")
            .unwrap(),
        (TypeId(LIST_ENTRY_PTR), 8)
    );
    assert!(session.get_field_offset("nt", "_LIST_ENTRY", "Missing").is_err());
}

#[test]
fn test_field_names_yield_every_field_once()
{
    let session = session();
    let names: Vec<String> = session
        .field_names("nt", "_LIST_ENTRY")
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(names, vec!["Flink", "Blink"]);
    assert_eq!(session.get_all_fields("nt", "_LIST_ENTRY").unwrap(), names);
}

#[test]
fn test_type_without_fields_fails_at_first_index()
{
    let session = session();
    let mut fields = session.field_names("nt", "_EMPTY_MARKER").unwrap();
    assert!(matches!(fields.next(), Some(Err(LkdError::EngineCallFailed { .. }))));
    assert!(fields.next().is_none());
    assert!(session.get_all_fields("nt", "_EMPTY_MARKER").is_err());
}

#[test]
fn test_field_layout()
{
    let session = session();
    let layout = session.get_all_field_type_and_offset("nt", "_LIST_ENTRY").unwrap();
    assert_eq!(
        layout,
        vec![
            FieldDescriptor {
                name: "Flink".to_string(),
                type_id: TypeId(LIST_ENTRY_PTR),
                offset: 0,
            },
            FieldDescriptor {
                name: "Blink".to_string(),
                type_id: TypeId(LIST_ENTRY_PTR),
                offset: 8,
            },
        ]
    );
}

#[test]
fn test_low_level_type_info()
{
    let session = session();
    assert_eq!(
        session
            .sym_get_type_info("nt", "_KEVENT", TypeInfoSelector::SymName)
            .unwrap(),
        TypeInfo::Name("_KEVENT".to_string())
    );
    assert_eq!(
        session
            .sym_get_type_info("nt", KEVENT, TypeInfoSelector::Length)
            .unwrap(),
        TypeInfo::Length(24)
    );
    assert!(matches!(
        session.sym_get_type_info("nt", KEVENT, TypeInfoSelector::FindChildren),
        Err(LkdError::NotImplemented(_))
    ));
}

#[test]
fn test_type_info_uses_configured_handle()
{
    let engine = FixtureEngine::new()
        .with_module("nt", NT, "ntkrnlmp.exe")
        .with_type(NT, KEVENT, "_KEVENT", 24)
        .with_type_info_handle(0x1234);
    let session = KernelSession::new(engine, PointerWidth::Bits64, SessionConfig::default()).unwrap();
    assert!(session
        .sym_get_type_info("nt", KEVENT, TypeInfoSelector::Length)
        .is_err());
}

#[test]
fn test_children()
{
    let session = session();
    assert_eq!(session.get_number_of_children("nt", "_KEVENT").unwrap(), 1);
    let children = session.get_children_types("nt", "_KEVENT").unwrap();
    assert_eq!(children.count, 1);
    assert_eq!(children.types, vec![TypeId(0x21)]);

    // Without explicit children, the field types stand in
    let children = session.get_children_types("nt", "_LIST_ENTRY").unwrap();
    assert_eq!(children.types, vec![TypeId(LIST_ENTRY_PTR), TypeId(LIST_ENTRY_PTR)]);
}

#[test]
fn test_type_handle()
{
    let session = session();
    let ty = session.get_type("nt", "_LIST_ENTRY").unwrap();
    assert_eq!(ty.module().value(), NT);
    assert_eq!(ty.type_id(), TypeId(LIST_ENTRY));
    assert_eq!(ty.name().unwrap(), "_LIST_ENTRY");
    assert_eq!(ty.size().unwrap(), 16);
    assert_eq!(ty.field_offset("Blink").unwrap(), 8);
    assert_eq!(ty.fields().unwrap().count(), 2);
    assert_eq!(ty.layout().unwrap().len(), 2);
}

#[test]
fn test_unknown_type_name()
{
    let session = session();
    assert!(matches!(
        session.get_type("nt", "_NOPE").err(),
        Some(LkdError::UnknownType { .. })
    ));
}
