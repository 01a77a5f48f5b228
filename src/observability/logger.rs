use std::path::Path;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogRotation;

const LOG_FILE_NAME: &str = "filemux.log";

/// Must be kept alive until the process exits so buffered lines get flushed
static LOG_GUARD: OnceLock<Mutex<Option<tracing_appender::non_blocking::WorkerGuard>>> =
    OnceLock::new();

/// Console logging to stderr, plus JSON lines in `log_dir` when given.
///
/// `RUST_LOG` takes precedence over `level`.
pub fn init_logging(
    level: &str,
    log_dir: Option<&Path>,
    rotation: LogRotation,
) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries command output
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer);

    let Some(dir) = log_dir else {
        subscriber.try_init()?;
        return Ok(());
    };

    std::fs::create_dir_all(dir)?;
    let file_appender = match rotation {
        LogRotation::Daily => tracing_appender::rolling::daily(dir, LOG_FILE_NAME),
        LogRotation::Hourly => tracing_appender::rolling::hourly(dir, LOG_FILE_NAME),
        LogRotation::Never => tracing_appender::rolling::never(dir, LOG_FILE_NAME),
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false);

    subscriber.with(file_layer).try_init()?;

    LOG_GUARD
        .set(Mutex::new(Some(guard)))
        .map_err(|_| anyhow::anyhow!("Logger already initialized"))?;
    Ok(())
}

/// Flush and close the file writer, if any.
pub fn shutdown_logging() {
    if let Some(mutex) = LOG_GUARD.get()
        && let Ok(mut guard) = mutex.lock()
    {
        guard.take();
    }
}
