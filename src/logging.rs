/*!
 * Logging and tracing initialization
 */

use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LogLevel;
use crate::error::{CdaError, Result};

/// Logging options collected from the command line
#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    pub level: LogLevel,
    /// Write JSON lines here instead of compact stdout output
    pub file: Option<PathBuf>,
    /// Force debug level
    pub verbose: bool,
}

impl LogSettings {
    pub fn effective_level(&self) -> Level {
        if self.verbose {
            Level::DEBUG
        } else {
            self.level.to_tracing_level()
        }
    }

    fn directive(&self) -> String {
        format!("cda={},cda_core_resilience={}", self.effective_level(), self.effective_level())
    }
}

/// Initialize structured logging; `RUST_LOG` wins over the settings
pub fn init_logging(settings: &LogSettings) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(settings.directive()))
        .map_err(|e| CdaError::Config(format!("Failed to create log filter: {}", e)))?;

    if let Some(ref log_path) = settings.file {
        init_file_logging(log_path, env_filter)?;
    } else {
        init_stdout_logging(env_filter);
    }

    Ok(())
}

fn init_stdout_logging(env_filter: EnvFilter) {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::create(log_path)
        .map_err(|e| CdaError::Config(format!("Failed to create log file: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}

/// Route logs to the test harness writer; safe to call from every test
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cda=debug"));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    });
}
