//! # Logging Utilities
//!
//! Logging infrastructure for lkd using `tracing`.
//!
//! Two output formats (pretty for a terminal, JSON for collection), an
//! `EnvFilter` driven by `RUST_LOG`, and optional file output through
//! `tracing-appender`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lkd_utils::init_logging;
//!
//! // Reads RUST_LOG, LKD_LOG_FORMAT and LKD_LOG_FILE
//! init_logging().expect("Failed to initialize logging");
//!
//! tracing::info!("Attached");
//! tracing::debug!("Symbol path applied");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Log level filter (e.g., `RUST_LOG=debug`, `RUST_LOG=lkd_core=trace`)
//! - `LKD_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
//! - `LKD_LOG_FILE`: Optional log file, rolled daily (if not set, logs only to the console)
//!
//! ## Interactive Shell
//!
//! The shell prints engine output on stdout, so it logs to a file only:
//!
//! ```rust,no_run
//! use lkd_utils::{LogLevel, init_logging_for_shell};
//!
//! let path = init_logging_for_shell(Some(LogLevel::Debug)).expect("Failed to initialize logging");
//! println!("logging to {}", path.display());
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format
pub const LOG_FORMAT_ENV: &str = "LKD_LOG_FORMAT";

/// Environment variable naming an additional log file
pub const LOG_FILE_ENV: &str = "LKD_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Flush guards of the non-blocking file writers; held for the process lifetime.
static FILE_GUARDS: Mutex<Vec<WorkerGuard>> = Mutex::new(Vec::new());

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default)
    Pretty,
    /// JSON format
    Json,
}

impl FromStr for LogFormat
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {s}. Use 'pretty' or 'json'")),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    Error,
    Warn,
    /// Default
    Info,
    Debug,
    /// Most verbose; logs every symbol resolution
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!(
                "Unknown log level: {s}. Use 'error', 'warn', 'info', 'debug', or 'trace'"
            )),
        }
    }
}

/// Initialize logging from the environment
///
/// - `RUST_LOG`: filter (e.g., `debug`, `lkd_core=trace`), default `info`
/// - `LKD_LOG_FORMAT`: `json` or `pretty`, default `pretty`
/// - `LKD_LOG_FILE`: optional log file, rolled daily
///
/// ## Errors
///
/// Returns an error if:
/// - Logging is already initialized
/// - `LKD_LOG_FORMAT` names an unknown format
/// - The log file directory cannot be created
pub fn init_logging() -> Result<(), LoggingError>
{
    let format = match env::var(LOG_FORMAT_ENV) {
        Ok(value) => LogFormat::from_str(&value).map_err(LoggingError::InvalidFormat)?,
        Err(_) => LogFormat::Pretty,
    };
    init_console(format, None)
}

/// Initialize logging with explicit level and format
///
/// `LKD_LOG_FILE` is still honoured.
///
/// ## Example
///
/// ```rust,no_run
/// use lkd_utils::{LogFormat, LogLevel, init_logging_with_level};
///
/// init_logging_with_level(LogLevel::Debug, LogFormat::Pretty)
///     .expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if logging is already initialized or file logging fails.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<(), LoggingError>
{
    init_console(format, Some(level.into()))
}

/// Initialize logging for the interactive shell (file-only, no stdout)
///
/// Logs go to `~/.lkd/YYYY-MM-DD-lkd-shell.log`, or to the system temp
/// directory when there is no home directory. Returns the log file path.
///
/// `level` overrides `RUST_LOG`; with neither, `INFO` is used.
///
/// ## Errors
///
/// Returns an error if logging is already initialized or the log directory
/// cannot be created.
pub fn init_logging_for_shell(level: Option<LogLevel>) -> Result<PathBuf, LoggingError>
{
    let today = Utc::now().format("%Y-%m-%d").to_string();
    let home = env::var_os("HOME").or_else(|| env::var_os("USERPROFILE")).map(PathBuf::from);
    let log_file = shell_log_path(home.as_deref(), &today);
    if let Some(dir) = log_file.parent() {
        std::fs::create_dir_all(dir)?;
    }

    // Date is already in the file name
    let writer = file_writer(|dir, name| tracing_appender::rolling::never(dir, name), &log_file);
    let filter = build_filter(level.map(Into::into));
    install(vec![file_layer(LogFormat::Pretty, writer, filter)])?;
    Ok(log_file)
}

/// Where the shell writes its log for `date` (`YYYY-MM-DD`).
pub fn shell_log_path(home: Option<&Path>, date: &str) -> PathBuf
{
    let file_name = format!("{date}-lkd-shell.log");
    match home {
        Some(home) => home.join(".lkd").join(file_name),
        None => env::temp_dir().join(file_name),
    }
}

fn init_console(format: LogFormat, explicit_level: Option<Level>) -> Result<(), LoggingError>
{
    let mut layers = vec![console_layer(format, build_filter(explicit_level))];

    if let Some(path) = env::var_os(LOG_FILE_ENV).map(PathBuf::from) {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let writer = file_writer(|dir, name| tracing_appender::rolling::daily(dir, name), &path);
        layers.push(file_layer(format, writer, build_filter(explicit_level)));
    }

    install(layers)
}

/// Filter priority: explicit level (CLI flag), then `RUST_LOG`, then `INFO`.
fn build_filter(explicit_level: Option<Level>) -> EnvFilter
{
    if let Some(level) = explicit_level {
        return EnvFilter::new(level.to_string());
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
}

/// Split a log file path into the appender's `(directory, file name)`.
fn split_log_path(path: &Path) -> (PathBuf, OsString)
{
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let name = path
        .file_name()
        .map_or_else(|| OsString::from("lkd.log"), ToOwned::to_owned);
    (dir, name)
}

fn file_writer<F, A>(rolling: F, path: &Path) -> NonBlocking
where
    F: FnOnce(PathBuf, OsString) -> A,
    A: io::Write + Send + 'static,
{
    let (dir, name) = split_log_path(path);
    let (writer, guard) = tracing_appender::non_blocking(rolling(dir, name));
    FILE_GUARDS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(guard);
    writer
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer
{
    let layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(io::stderr);

    match format {
        LogFormat::Pretty => layer.with_ansi(true).with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

fn file_layer(format: LogFormat, writer: NonBlocking, filter: EnvFilter) -> BoxedLayer
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339());

    match format {
        // No ANSI in files
        LogFormat::Pretty => layer.with_ansi(false).with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

fn install(layers: Vec<BoxedLayer>) -> Result<(), LoggingError>
{
    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// A global subscriber is already installed
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
