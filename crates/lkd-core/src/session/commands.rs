//! Command pass-through and disassembly.

use std::io::{BufRead, Write};
use std::sync::Arc;

use tracing::{debug, warn};

use super::{decode_name, KernelSession};
use crate::engine::DebugEngine;
use crate::error::{EngineResultExt, Result};
use crate::output::{CapturedOutput, OutputCallbacks};
use crate::types::{Address, SymbolRef};

/// Size of the disassembly text buffer
const DISASSEMBLY_BUFFER_SIZE: usize = 1000;

/// Prompt printed before every shell line
pub const SHELL_PROMPT: &str = "(dbg) ";

impl<E: DebugEngine> KernelSession<E>
{
    /// Run a command through the engine's command interpreter.
    ///
    /// With `capture_output`, the engine output is collected in memory and
    /// returned instead of going to the registered callbacks, which are
    /// restored before returning, even if the command failed.
    ///
    /// ## Errors
    ///
    /// - `EngineCallFailed`: the engine rejected the command, or the output
    ///   callbacks could not be swapped
    pub fn execute(&mut self, command: &str, capture_output: bool) -> Result<Option<String>>
    {
        debug!("Executing {:?} (capture: {})", command, capture_output);
        if !capture_output {
            self.engine.execute(command).op("execute")?;
            return Ok(None);
        }

        let captured = Arc::new(CapturedOutput::new());
        let previous = self.set_output_callbacks(Arc::clone(&captured) as Arc<dyn OutputCallbacks>)?;
        let outcome = self.engine.execute(command).op("execute");
        if let Err(e) = self.set_output_callbacks(previous) {
            warn!("Failed to restore output callbacks after {:?}: {}", command, e);
            outcome?;
            return Err(e);
        }
        outcome?;
        Ok(Some(captured.take()))
    }

    /// Disassemble one instruction: its text and the address of the next one.
    pub fn disassemble_one(&self, addr: impl Into<SymbolRef>) -> Result<(String, Address)>
    {
        let offset = self.resolve_symbol(addr)?;
        let mut buf = vec![0u8; DISASSEMBLY_BUFFER_SIZE];
        let (size, next) = self
            .engine
            .disassemble(offset, &mut buf)
            .op("disassemble")?;
        let text = decode_name("disassemble", &buf, size);
        Ok((text.trim_end_matches(['\n', '\0']).to_string(), self.trim(next)))
    }

    /// Disassemble `count` consecutive instructions.
    pub fn disassemble(&self, addr: impl Into<SymbolRef>, count: usize) -> Result<Vec<String>>
    {
        let mut at = self.trim(self.resolve_symbol(addr)?.value());
        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            let (text, next) = self.disassemble_one(at)?;
            lines.push(text);
            at = next;
        }
        Ok(lines)
    }

    /// Interactive command loop.
    ///
    /// Prints [`SHELL_PROMPT`] to `console`, reads one line from `input` and
    /// runs it through [`execute`](Self::execute), until an empty line or end
    /// of input. Engine output goes to the registered callbacks. A failing
    /// command is reported on `console` and the loop continues.
    ///
    /// Returns the number of commands the engine accepted.
    ///
    /// ## Errors
    ///
    /// - `Io`: reading `input` or writing `console` failed
    pub fn shell(&mut self, mut input: impl BufRead, mut console: impl Write) -> Result<usize>
    {
        let mut accepted = 0;
        let mut line = String::new();
        loop {
            console.write_all(SHELL_PROMPT.as_bytes())?;
            console.flush()?;

            line.clear();
            if input.read_line(&mut line)? == 0 {
                break;
            }
            let command = line.trim_end_matches(['\r', '\n']);
            if command.is_empty() {
                break;
            }
            match self.execute(command, false) {
                Ok(_) => accepted += 1,
                Err(e) => {
                    warn!("Shell command {:?} failed: {}", command, e);
                    writeln!(console, "error: {e}")?;
                }
            }
        }
        debug!("Shell finished after {} commands", accepted);
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::bitness::PointerWidth;
    use crate::config::SessionConfig;
    use crate::engine::FixtureEngine;

    #[test]
    fn test_execute_capture_restores_callbacks()
    {
        let engine = FixtureEngine::new().with_command("vertarget", "Windows 10 Kernel Version 19041\n");
        let mut session = KernelSession::new(engine, PointerWidth::Bits64, SessionConfig::default()).unwrap();
        let before = session.output_callbacks();

        let text = session.execute("vertarget", true).unwrap();
        assert_eq!(text.as_deref(), Some("Windows 10 Kernel Version 19041\n"));

        let registered = session.engine().output_callbacks().unwrap();
        assert!(Arc::ptr_eq(&registered, &before));
        assert!(Arc::ptr_eq(&session.output_callbacks(), &before));
    }

    #[test]
    fn test_execute_failure_still_restores_callbacks()
    {
        let mut session =
            KernelSession::new(FixtureEngine::new(), PointerWidth::Bits64, SessionConfig::default()).unwrap();
        let before = session.output_callbacks();
        assert!(session.execute("bogus", true).is_err());
        assert!(Arc::ptr_eq(&session.engine().output_callbacks().unwrap(), &before));
    }

    #[test]
    fn test_execute_without_capture()
    {
        let engine = FixtureEngine::new().with_command("lm", "start end module name\n");
        let mut session =
            KernelSession::new(engine, PointerWidth::Bits64, SessionConfig::default().with_quiet(true)).unwrap();
        assert_eq!(session.execute("lm", false).unwrap(), None);
        assert_eq!(session.engine().executed(), vec!["lm".to_string()]);
    }

    #[test]
    fn test_shell_runs_lines_until_empty()
    {
        let engine = FixtureEngine::new()
            .with_command("lm", "")
            .with_command("!process 0 0", "");
        let mut session =
            KernelSession::new(engine, PointerWidth::Bits64, SessionConfig::default().with_quiet(true)).unwrap();

        let input = "lm\nbogus\n!process 0 0\n\nnever\n".as_bytes();
        let mut console = Vec::new();
        assert_eq!(session.shell(input, &mut console).unwrap(), 2);

        let console = String::from_utf8(console).unwrap();
        assert_eq!(console.matches(SHELL_PROMPT).count(), 4);
        assert!(console.contains("error:"));
        assert_eq!(
            session.engine().executed(),
            vec!["lm".to_string(), "bogus".to_string(), "!process 0 0".to_string()]
        );
    }

    #[test]
    fn test_shell_stops_at_end_of_input()
    {
        let engine = FixtureEngine::new().with_command("k", "");
        let mut session = KernelSession::new(engine, PointerWidth::Bits64, SessionConfig::default()).unwrap();
        assert_eq!(session.shell("k".as_bytes(), std::io::sink()).unwrap(), 1);
    }

    #[test]
    fn test_disassemble_walks_instructions()
    {
        let engine = FixtureEngine::new()
            .with_instruction(0x1000, "nt!KiSystemCall64:\nfffff800`00001000 0f01f8 swapgs", 3)
            .with_instruction(0x1003, "fffff800`00001003 654889242510000000 mov qword ptr gs:[10h],rsp", 9);
        let session = KernelSession::new(engine, PointerWidth::Bits64, SessionConfig::default()).unwrap();

        let (text, next) = session.disassemble_one(0x1000u64).unwrap();
        assert!(text.ends_with("swapgs"));
        assert_eq!(next, Address::new(0x1003));

        let lines = session.disassemble(0x1000u64, 2).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with("rsp"));
        assert!(session.disassemble(0x1000u64, 3).is_err());
    }
}
