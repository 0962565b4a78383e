/// Structured logging setup using tracing
///
/// The console layer writes to stderr only: stdout carries the MCP JSON-RPC
/// stream. It is human-readable with ANSI colors when stderr is a terminal and
/// structured JSON when piped/redirected. When `log_file` is set, a second JSON
/// layer writes to that file through a non-blocking, daily-rotated appender.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::Config;

const DEFAULT_LOG_FILE_NAME: &str = "partnerlink.log";

/// Initialize the tracing subscriber.
///
/// Log level from config.log_level (default: info); RUST_LOG overrides it.
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process.
pub fn init_logging(config: &Config) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let console_layer = if std::io::stderr().is_terminal() {
        fmt::layer().with_writer(std::io::stderr).with_ansi(true).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).json().boxed()
    };

    let (file_layer, guard) = match config.log_file.as_deref() {
        Some(path) => {
            let (dir, file_name) = log_file_parts(path);
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().json().with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

/// Split a configured log path into the rotation directory and file name prefix.
fn log_file_parts(path: &str) -> (PathBuf, String) {
    let path = Path::new(path);
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(DEFAULT_LOG_FILE_NAME)
        .to_string();
    (dir, file_name)
}
