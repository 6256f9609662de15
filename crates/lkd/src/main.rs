mod commands;

use std::process;

use clap::Parser;
use commands::Command;
use lkd_core::{connect_local_kernel, PointerWidth, SessionConfig};
use lkd_utils::{info, init_logging, init_logging_for_shell, init_logging_with_level, LogFormat, LogLevel};

/// Live kernel debugging from the command line.
#[derive(Parser, Debug)]
#[command(name = "lkd")]
#[command(version)]
#[command(about = "Symbols, memory and types of a live kernel through the system debugging engine", long_about = None)]
struct Cli
{
    /// Target pointer width (32 or 64); detected from the engine if omitted
    #[arg(long, global = true)]
    width: Option<PointerWidth>,
    /// Symbol search path (overrides _NT_SYMBOL_PATH)
    #[arg(long, global = true)]
    symbol_path: Option<String>,
    /// Do not forward engine output to stdout
    #[arg(long, global = true, default_value_t = false)]
    quiet: bool,
    /// Log level (error, warn, info, debug, trace); RUST_LOG otherwise
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Command,
}

fn main()
{
    let cli = Cli::parse();

    // The shell owns stdout, so it logs to a file
    let logging = if matches!(cli.command, Command::Shell) {
        init_logging_for_shell(cli.log_level).map(|path| eprintln!("Logging to {}", path.display()))
    } else if let Some(level) = cli.log_level {
        let format = std::env::var(lkd_utils::logging::LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LogFormat::Pretty);
        init_logging_with_level(level, format)
    } else {
        init_logging()
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> lkd_core::Result<()>
{
    let mut config = SessionConfig::from_env().with_quiet(cli.quiet);
    if let Some(path) = cli.symbol_path {
        config = config.with_symbol_path(path);
    }

    info!("Connecting to the local kernel");
    let mut session = connect_local_kernel(config, cli.width)?;
    let stdout = std::io::stdout();
    commands::run(&mut session, cli.command, &mut stdout.lock())
}
