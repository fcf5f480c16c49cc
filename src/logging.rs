//! Tracing subscriber setup.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Target of audit events: one per API request, one per sync outcome.
pub const AUDIT_TARGET: &str = "audit";

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `logging.level`. Output always goes to
/// stderr; when `logging.file` is set a non-blocking file writer is added.
/// `logging.audit_file` gets a JSON-lines writer that only sees
/// [`AUDIT_TARGET`] events. Keep the returned guards alive for the life of
/// the process or buffered lines are lost.
pub fn init(config: &LoggingConfig) -> Result<Vec<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("invalid logging.level: {}", config.level))?,
    };

    let mut guards = Vec::new();
    let file_sink = match &config.file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            guards.push(guard);
            Some(writer)
        }
        None => None,
    };
    let audit_layer = match &config.audit_file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            guards.push(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(filter_fn(|meta| meta.target() == AUDIT_TARGET)),
            )
        }
        None => None,
    };

    let registry = tracing_subscriber::registry().with(filter).with(audit_layer);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(file_sink.map(|w| fmt::layer().json().with_ansi(false).with_writer(w)))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_sink.map(|w| fmt::layer().with_ansi(false).with_writer(w)))
            .try_init(),
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))?;

    Ok(guards)
}

fn file_writer(path: &Path) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("logging.file has no file name: {}", path.display()))?;

    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;

    let appender = tracing_appender::rolling::never(dir, name);
    Ok(tracing_appender::non_blocking(appender))
}
