//! Subcommands and their rendering.

use std::io::{self, Write};

use clap::Subcommand;
use lkd_core::engine::BusSlot;
use lkd_core::error::{LkdError, Result};
use lkd_core::types::SymbolRef;
use lkd_core::{DebugEngine, KernelSession};
use tracing::debug;

const HEXDUMP_WIDTH: usize = 16;

#[derive(Subcommand, Debug)]
pub enum Command
{
    /// Resolve a symbol name to its address
    Symbol
    {
        /// Symbol name (e.g. nt!PsLoadedModuleList)
        name: String,
    },
    /// Find the symbol covering an address
    Lookup
    {
        #[arg(value_parser = SymbolRef::parse)]
        address: SymbolRef,
    },
    /// Hex dump of virtual (or physical) memory
    Read
    {
        /// Address (0x-hex, decimal or symbol)
        #[arg(value_parser = SymbolRef::parse)]
        address: SymbolRef,
        /// Number of bytes to read
        #[arg(short, long, default_value_t = 64)]
        length: usize,
        /// Treat the address as physical
        #[arg(long, default_value_t = false)]
        physical: bool,
    },
    /// Read one dword
    Dword
    {
        #[arg(value_parser = SymbolRef::parse)]
        address: SymbolRef,
        /// Treat the address as physical
        #[arg(long, default_value_t = false)]
        physical: bool,
    },
    /// Read a NUL-terminated string
    String
    {
        #[arg(value_parser = SymbolRef::parse)]
        address: SymbolRef,
        /// UTF-16 string
        #[arg(long, default_value_t = false)]
        wide: bool,
    },
    /// Translate a virtual address to physical
    V2p
    {
        #[arg(value_parser = SymbolRef::parse)]
        address: SymbolRef,
    },
    /// Read a model-specific register
    Msr
    {
        #[arg(value_parser = parse_u32)]
        id: u32,
    },
    /// Read an I/O port
    Io
    {
        #[arg(value_parser = parse_u64)]
        port: u64,
        /// Access size in bytes (1, 2 or 4)
        #[arg(short, long, default_value_t = 1)]
        size: usize,
    },
    /// Dump PCI configuration space
    Pci
    {
        #[arg(value_parser = parse_u32)]
        bus: u32,
        #[arg(value_parser = parse_u32)]
        slot: u32,
        #[arg(value_parser = parse_u32)]
        offset: u32,
        /// Number of bytes to read
        #[arg(short, long, default_value_t = 64)]
        length: usize,
    },
    /// List loaded modules (reloads symbols first)
    Modules,
    /// Show the size and field layout of a type
    Type
    {
        /// Module name or base address (e.g. nt)
        #[arg(value_parser = SymbolRef::parse)]
        module: SymbolRef,
        /// Type name (e.g. _EPROCESS)
        type_name: String,
    },
    /// List symbols matching a wildcard pattern
    Match
    {
        /// Pattern (e.g. nt!NtCreate*)
        pattern: String,
    },
    /// Disassemble instructions
    Disasm
    {
        #[arg(value_parser = SymbolRef::parse)]
        address: SymbolRef,
        /// Number of instructions
        #[arg(short, long, default_value_t = 8)]
        count: usize,
    },
    /// Run a debugger command and print its output
    Exec
    {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Interactive command shell; an empty line exits
    Shell,
}

/// `0x`-hex or decimal.
fn parse_u64(input: &str) -> std::result::Result<u64, String>
{
    match SymbolRef::parse(input).map_err(|e| e.to_string())? {
        SymbolRef::Address(addr) => Ok(addr.value()),
        SymbolRef::Name(name) => Err(format!("'{name}' is not a number")),
    }
}

fn parse_u32(input: &str) -> std::result::Result<u32, String>
{
    let value = parse_u64(input)?;
    u32::try_from(value).map_err(|_| format!("0x{value:x} does not fit in 32 bits"))
}

/// Physical operations take numbers only; symbols are virtual.
fn physical_address(address: &SymbolRef) -> Result<u64>
{
    address
        .as_address()
        .map(|addr| addr.value())
        .ok_or_else(|| LkdError::InvalidArgument(format!("physical address expected, got '{address}'")))
}

fn hexdump(out: &mut impl Write, base: u64, bytes: &[u8]) -> io::Result<()>
{
    for (row, chunk) in bytes.chunks(HEXDUMP_WIDTH).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        writeln!(
            out,
            "{:016x}  {:<width$}  {}",
            base.wrapping_add((row * HEXDUMP_WIDTH) as u64),
            hex.join(" "),
            ascii,
            width = HEXDUMP_WIDTH * 3 - 1
        )?;
    }
    Ok(())
}

/// Run one subcommand against `session`, printing to `out`.
///
/// ## Errors
///
/// Whatever the session operation reports, plus `Io` when `out` fails.
pub fn run<E: DebugEngine>(session: &mut KernelSession<E>, command: Command, out: &mut impl Write) -> Result<()>
{
    debug!("Running {:?}", command);
    match command {
        Command::Symbol { name } => {
            let addr = session.resolve_symbol(name.as_str())?;
            writeln!(out, "{} = {}", name, session.trim(addr.value()))?;
        }
        Command::Lookup { address } => match session.get_symbol(&address)? {
            Some(hit) => writeln!(out, "{address} = {hit}")?,
            None => writeln!(out, "{address}: no symbol")?,
        },
        Command::Read {
            address,
            length,
            physical,
        } => {
            let (base, bytes) = if physical {
                let base = physical_address(&address)?;
                (base, session.read_physical(base, length)?)
            } else {
                let base = session.trim(session.resolve_symbol(&address)?.value());
                (base.value(), session.read_virtual(base, length)?)
            };
            hexdump(out, base, &bytes)?;
        }
        Command::Dword { address, physical } => {
            let value = if physical {
                session.read_dword_p(physical_address(&address)?)?
            } else {
                session.read_dword(&address)?
            };
            writeln!(out, "0x{value:08x}")?;
        }
        Command::String { address, wide } => {
            let text = if wide {
                session.read_wstring(&address)?.to_string_lossy()
            } else {
                session.read_string(&address)?
            };
            writeln!(out, "{text:?}")?;
        }
        Command::V2p { address } => {
            let physical = session.virtual_to_physical(&address)?;
            writeln!(out, "{address} -> 0x{physical:x}")?;
        }
        Command::Msr { id } => {
            writeln!(out, "msr[0x{id:x}] = 0x{:016x}", session.read_msr(id)?)?;
        }
        Command::Io { port, size } => {
            let value = session.read_io(port, size)?;
            writeln!(out, "port 0x{port:x} = 0x{value:0width$x}", width = size * 2)?;
        }
        Command::Pci {
            bus,
            slot,
            offset,
            length,
        } => {
            let bytes = session.read_bus_data(BusSlot::pci(bus, slot), offset, length)?;
            hexdump(out, u64::from(offset), &bytes)?;
        }
        Command::Modules => {
            for module in session.get_modules()? {
                writeln!(
                    out,
                    "{:>3}  {:<18}  {:<16}  {}",
                    module.index,
                    module.base.to_string(),
                    module.module_name,
                    module.image_name
                )?;
            }
        }
        Command::Type { module, type_name } => {
            let ty = session.get_type(&module, type_name.as_str())?;
            writeln!(out, "{} (id {}, 0x{:x} bytes)", ty.name()?, ty.type_id().0, ty.size()?)?;
            for field in ty.layout()? {
                writeln!(out, "  +0x{:03x} {}", field.offset, field.name)?;
            }
        }
        Command::Match { pattern } => {
            for hit in session.symbol_match(&pattern)? {
                let (name, addr) = hit?;
                writeln!(out, "{:<18}  {}", addr.to_string(), name)?;
            }
        }
        Command::Disasm { address, count } => {
            for line in session.disassemble(&address, count)? {
                writeln!(out, "{line}")?;
            }
        }
        Command::Exec { command } => {
            let output = session.execute(&command.join(" "), true)?;
            write!(out, "{}", output.unwrap_or_default())?;
        }
        Command::Shell => {
            let stdin = io::stdin();
            session.shell(stdin.lock(), out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests
{
    use lkd_core::engine::FixtureEngine;
    use lkd_core::{PointerWidth, SessionConfig};

    use super::*;

    fn session(engine: FixtureEngine) -> KernelSession<FixtureEngine>
    {
        KernelSession::new(engine, PointerWidth::Bits64, SessionConfig::default().with_quiet(true)).unwrap()
    }

    fn render(session: &mut KernelSession<FixtureEngine>, command: Command) -> String
    {
        let mut out = Vec::new();
        run(session, command, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_parse_numbers()
    {
        assert_eq!(parse_u64("0x3f8"), Ok(0x3f8));
        assert_eq!(parse_u64("1016"), Ok(1016));
        assert!(parse_u64("nt!KiTrap0E").is_err());
        assert!(parse_u32("0x100000000").is_err());
        assert_eq!(parse_u32("0xC0000082"), Ok(0xC000_0082));
    }

    #[test]
    fn test_hexdump_layout()
    {
        let mut out = Vec::new();
        hexdump(&mut out, 0x1000, b"MZ\x90\x00 hello, kernel!!").unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000000000001000  4d 5a 90 00"));
        assert!(lines[0].ends_with("MZ.. hello, kern"));
        assert!(lines[1].starts_with("0000000000001010  65 6c 21 21"));
    }

    #[test]
    fn test_symbol_and_dword()
    {
        let engine = FixtureEngine::new()
            .with_symbol("nt!NtBuildNumber", 0xffff_f800_0000_2000)
            .with_virtual(0xffff_f800_0000_2000, &0xF000_4A61u32.to_le_bytes());
        let mut session = session(engine);

        let text = render(&mut session, Command::Symbol { name: "nt!NtBuildNumber".into() });
        assert_eq!(text, "nt!NtBuildNumber = 0xfffff80000002000\n");

        let text = render(
            &mut session,
            Command::Dword {
                address: SymbolRef::from("nt!NtBuildNumber"),
                physical: false,
            },
        );
        assert_eq!(text, "0xf0004a61\n");
    }

    #[test]
    fn test_physical_read_rejects_symbols()
    {
        let mut session = session(FixtureEngine::new());
        let mut out = Vec::new();
        let result = run(
            &mut session,
            Command::Dword {
                address: SymbolRef::from("nt!KiTrap0E"),
                physical: true,
            },
            &mut out,
        );
        assert!(matches!(result, Err(LkdError::InvalidArgument(_))));
    }

    #[test]
    fn test_match_lists_hits()
    {
        let engine = FixtureEngine::new()
            .with_symbol("nt!NtCreateFile", 0x1000)
            .with_symbol("nt!NtClose", 0x2000)
            .with_symbol("nt!NtCreateKey", 0x3000);
        let mut session = session(engine);
        let text = render(&mut session, Command::Match { pattern: "nt!NtCreate*".into() });
        let names: Vec<&str> = text.lines().filter_map(|l| l.split_whitespace().last()).collect();
        assert_eq!(names, vec!["nt!NtCreateFile", "nt!NtCreateKey"]);
    }

    #[test]
    fn test_exec_prints_captured_output()
    {
        let engine = FixtureEngine::new().with_command("vertarget", "Windows 10 Kernel Version 19041 MP (4 procs)\n");
        let mut session = session(engine);
        let text = render(&mut session, Command::Exec { command: vec!["vertarget".into()] });
        assert_eq!(text, "Windows 10 Kernel Version 19041 MP (4 procs)\n");
    }

    #[test]
    fn test_type_layout()
    {
        let engine = FixtureEngine::new()
            .with_module("nt", 0xffff_f800_0000_0000, "ntkrnlmp.exe")
            .with_type(0xffff_f800_0000_0000, 10, "_LIST_ENTRY", 16)
            .with_type(0xffff_f800_0000_0000, 11, "_LIST_ENTRY *", 8)
            .with_field(0xffff_f800_0000_0000, 10, "Flink", 11, 0)
            .with_field(0xffff_f800_0000_0000, 10, "Blink", 11, 8);
        let mut session = session(engine);
        let text = render(
            &mut session,
            Command::Type {
                module: SymbolRef::from("nt"),
                type_name: "_LIST_ENTRY".into(),
            },
        );
        assert_eq!(text, "_LIST_ENTRY (id 10, 0x10 bytes)\n  +0x000 Flink\n  +0x008 Blink\n");
    }
}
