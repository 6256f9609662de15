//! Tests for the address-space access layer

use lkd_core::engine::{BusSlot, FixtureEngine, HResult};
use lkd_core::error::LkdError;
use lkd_core::session::WideText;
use lkd_core::types::{Address, ListEntry64, ProcessorData, ProcessorDataKind};
use lkd_core::{KernelSession, PointerWidth, SessionConfig};

const KVA: u64 = 0xffff_f800_0010_0000;

fn session_64(engine: FixtureEngine) -> KernelSession<FixtureEngine>
{
    KernelSession::new(engine, PointerWidth::Bits64, SessionConfig::default()).unwrap()
}

#[test]
fn test_virtual_write_then_read()
{
    let mut session = session_64(FixtureEngine::new().with_virtual(KVA, &[0u8; 32]));
    let data = [0x48, 0x8b, 0xc4, 0x48, 0x89, 0x58, 0x08];
    assert_eq!(session.write_virtual(KVA + 3, &data).unwrap(), data.len());
    assert_eq!(session.read_virtual(KVA + 3, data.len()).unwrap(), data);
}

#[test]
fn test_dword_round_trip()
{
    let mut session = session_64(FixtureEngine::new().with_virtual(KVA, &[0u8; 8]));
    session.write_dword(KVA, 0xDEAD_BEEF).unwrap();
    assert_eq!(session.read_dword(KVA).unwrap(), 0xDEAD_BEEF);
    assert_eq!(session.read_byte(KVA).unwrap(), 0xEF);
    assert_eq!(session.read_word(KVA + 2).unwrap(), 0xDEAD);
}

#[test]
fn test_fixed_width_read_of_unmapped_memory_fails()
{
    let session = session_64(FixtureEngine::new());
    let error = session.read_qword(KVA).unwrap_err();
    assert!(matches!(error, LkdError::EngineCallFailed { operation: "read_virtual", .. }));
}

#[test]
fn test_read_stops_at_unmapped_page()
{
    let page_end = KVA + 0x1000;
    let session = session_64(FixtureEngine::new().with_virtual(page_end - 2, &[0xaa, 0xbb]));
    assert_eq!(session.read_virtual(page_end - 2, 8).unwrap(), vec![0xaa, 0xbb]);
    assert!(matches!(
        session.read_dword(page_end - 2).unwrap_err(),
        LkdError::ShortTransfer { expected: 4, actual: 2, .. }
    ));
}

#[test]
fn test_read_string_stops_at_nul()
{
    let session = session_64(FixtureEngine::new().with_virtual(KVA, b"hello\0world"));
    assert_eq!(session.read_string(KVA).unwrap(), "hello");
}

#[test]
fn test_read_string_spans_chunks()
{
    let long: Vec<u8> = std::iter::repeat(b'A').take(300).chain([0u8]).collect();
    let session = session_64(FixtureEngine::new().with_virtual(KVA, &long));
    assert_eq!(session.read_string(KVA).unwrap().len(), 300);
}

#[test]
fn test_read_wstring()
{
    let mut bytes: Vec<u8> = "\\Device\\HarddiskVolume1"
        .encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect();
    bytes.extend_from_slice(&[0, 0, b'x', 0]);
    let session = session_64(FixtureEngine::new().with_virtual(KVA, &bytes));
    assert_eq!(
        session.read_wstring(KVA).unwrap(),
        WideText::Decoded("\\Device\\HarddiskVolume1".to_string())
    );
}

#[test]
fn test_read_wstring_keeps_undecodable_units()
{
    // Lone high surrogate
    let session = session_64(FixtureEngine::new().with_virtual(KVA, &[0x00, 0xd8, 0x41, 0x00, 0, 0]));
    match session.read_wstring(KVA).unwrap() {
        WideText::Undecodable(raw) => assert_eq!(raw, vec![0x00, 0xd8, 0x41, 0x00]),
        other => panic!("expected raw units, got {other:?}"),
    }
}

#[test]
fn test_virtual_to_physical()
{
    let session = session_64(FixtureEngine::new().with_mapping(KVA, 0x3_2000));
    assert_eq!(session.virtual_to_physical(KVA + 0x18).unwrap(), 0x3_2018);

    let error = session.virtual_to_physical(0xffff_f800_dead_0000u64).unwrap_err();
    assert!(matches!(
        error,
        LkdError::EngineCallFailed {
            operation: "virtual_to_physical",
            status: HResult::E_FAIL
        }
    ));
}

#[test]
fn test_write_pfv_goes_through_physical()
{
    let mut session = session_64(FixtureEngine::new().with_mapping(KVA, 0x3_2000));
    session.write_pfv(KVA + 4, &[1, 2, 3, 4]).unwrap();
    assert_eq!(session.read_dword_p(0x3_2004).unwrap(), 0x0403_0201);
    assert_eq!(session.read_dword(KVA + 4).unwrap(), 0x0403_0201);
}

#[test]
fn test_physical_addresses_are_not_sign_extended()
{
    // Above 2 GiB on a 32-bit PAE target
    let engine = FixtureEngine::new_32bit().with_physical(0x9000_0000, &0x1122_3344u32.to_le_bytes());
    let mut session = KernelSession::new(engine, PointerWidth::Bits32, SessionConfig::default()).unwrap();
    assert_eq!(session.read_dword_p(0x9000_0000).unwrap(), 0x1122_3344);
    session.write_word_p(0x9000_0000, 0xffff).unwrap();
    assert_eq!(session.read_physical(0x9000_0000, 4).unwrap(), vec![0xff, 0xff, 0x22, 0x11]);
}

#[test]
fn test_pointers_follow_target_width()
{
    let va = 0x8054_1000u64;
    let engine = FixtureEngine::new_32bit().with_virtual(0xffff_ffff_8054_1000, &[0u8; 8]);
    let mut session = KernelSession::new(engine, PointerWidth::Bits32, SessionConfig::default()).unwrap();
    assert_eq!(session.write_ptr(va, Address::new(0x8123_4567)).unwrap(), 4);
    assert_eq!(session.read_ptr(va).unwrap(), Address::new(0x8123_4567));
    assert_eq!(session.read_dword(va + 4).unwrap(), 0);
    assert!(matches!(
        session.write_ptr(va, Address::new(0x1_0000_0000)).unwrap_err(),
        LkdError::InvalidArgument(_)
    ));
}

#[test]
fn test_fixed_layout_structures()
{
    let mut session = session_64(FixtureEngine::new().with_virtual(KVA, &[0u8; 16]));
    let entry = ListEntry64 {
        flink: KVA,
        blink: KVA + 8,
    };
    assert_eq!(session.write_virtual_struct(KVA, &entry).unwrap(), 16);
    assert_eq!(session.read_virtual_struct::<ListEntry64>(KVA).unwrap(), entry);
    assert_eq!(session.read_qword(KVA + 8).unwrap(), KVA + 8);
}

#[test]
fn test_io_ports()
{
    let engine = FixtureEngine::new().with_io_port(0x3f8, &[0x41, 0x00, 0x7f, 0x80]);
    let mut session = session_64(engine);
    assert_eq!(session.read_io(0x3f8, 1).unwrap(), 0x41);
    assert_eq!(session.read_io(0x3f8, 4).unwrap(), 0x807f_0041);
    assert!(matches!(session.read_io(0x3f8, 3).unwrap_err(), LkdError::InvalidArgument(_)));

    session.write_io(0x80, 0x5a, 1).unwrap();
    assert_eq!(session.engine().io_port(0x80), Some(0x5a));
    assert!(matches!(session.write_io(0x80, 0x1ff, 1).unwrap_err(), LkdError::InvalidArgument(_)));

    session.write_io_bytes(0xcf8, &0x8000_0000u32.to_le_bytes()).unwrap();
    assert_eq!(session.read_io(0xcf8, 4).unwrap(), 0x8000_0000);
}

#[test]
fn test_pci_configuration_space()
{
    let slot = BusSlot::pci(0, 3);
    let mut header = vec![0u8; 64];
    header[0..4].copy_from_slice(&[0x86, 0x80, 0x0e, 0x10]);
    let mut session = session_64(FixtureEngine::new().with_bus_data(slot, &header));

    assert_eq!(session.read_bus_data(slot, 0, 4).unwrap(), vec![0x86, 0x80, 0x0e, 0x10]);
    session.write_bus_data(slot, 4, &[0x07, 0x00]).unwrap();
    assert_eq!(session.engine().bus_data(slot).unwrap()[4..6], [0x07, 0x00]);

    // Empty slots read as all ones
    assert_eq!(session.read_bus_data(BusSlot::pci(0, 31), 0, 2).unwrap(), vec![0xff, 0xff]);
}

#[test]
fn test_msr_access()
{
    let mut session = session_64(FixtureEngine::new().with_msr(0xc000_0082, 0xffff_f800_0123_4000));
    assert_eq!(session.read_msr(0xc000_0082).unwrap(), 0xffff_f800_0123_4000);
    session.write_msr(0x1b, 0xfee0_0900).unwrap();
    assert_eq!(session.engine().msr(0x1b), Some(0xfee0_0900));
    assert!(session.read_msr(0x10).is_err());
}

#[test]
fn test_processor_system_data()
{
    let engine = FixtureEngine::new()
        .with_processor_data(0, ProcessorDataKind::KpcrOffset, &0xffff_f800_0400_0000u64.to_le_bytes())
        .with_processor_data(0, ProcessorDataKind::Speed, &2_400u32.to_le_bytes());
    let session = session_64(engine);
    assert_eq!(
        session
            .read_processor_system_data(0, ProcessorDataKind::KpcrOffset)
            .unwrap(),
        ProcessorData::Offset(0xffff_f800_0400_0000)
    );
    assert_eq!(
        session.read_processor_system_data(0, ProcessorDataKind::Speed).unwrap(),
        ProcessorData::Speed(2_400)
    );
}
