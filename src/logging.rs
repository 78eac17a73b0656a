//! Tracing setup for the `editor-bridge` binary.
//!
//! Library code only emits events; the host decides where they go. The binary
//! writes them to `<state dir>/logs/editor-bridge.<date>.log` and to the console.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "editor-bridge";
const RETAINED_LOG_FILES: usize = 7;
/// Used when `RUST_LOG` is unset. Frame-level websocket chatter stays quiet.
const DEFAULT_DIRECTIVES: &str = "info,tungstenite=warn,tokio_tungstenite=warn";

/// Flushes buffered log lines when dropped.
pub struct LogGuard {
    _worker: WorkerGuard,
}

fn bridge_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

fn daily_appender(log_dir: &Path) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("create log dir {}", log_dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(RETAINED_LOG_FILES)
        .build(log_dir)
        .context("build rolling log appender")
}

/// Installs the process-wide subscriber. Fails if one is already set.
pub fn init_logging(log_dir: &Path) -> Result<LogGuard> {
    let (file_writer, worker) = tracing_appender::non_blocking(daily_appender(log_dir)?);

    tracing_subscriber::registry()
        .with(bridge_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .with(tracing_subscriber::fmt::layer().compact())
        .try_init()
        .context("install tracing subscriber")?;

    tracing::info!(
        log_dir = %log_dir.display(),
        retained_files = RETAINED_LOG_FILES,
        "editor bridge logging ready"
    );
    Ok(LogGuard { _worker: worker })
}
