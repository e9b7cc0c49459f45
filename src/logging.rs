//! Application logging

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::errors::DeployError;

pub const APP_LOG_FILE_PREFIX: &str = "remote-deployer.log";

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Default filter directive, overridden by `RUST_LOG`
    pub log_level: String,

    /// Write logs to stdout
    pub stdout: bool,

    /// Directory for the daily rolling application log; `None` disables it
    pub log_dir: Option<PathBuf>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            stdout: true,
            log_dir: None,
        }
    }
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// lifetime of the process, or buffered file output is lost.
pub fn init_logging(options: LogOptions) -> Result<Option<WorkerGuard>, DeployError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.log_level))
        .map_err(|error| {
            DeployError::Config(format!("Invalid log level `{}`: {error}", options.log_level))
        })?;

    let stdout_layer = options
        .stdout
        .then(|| fmt::layer().with_target(false).boxed());

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, APP_LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|error| DeployError::Config(error.to_string()))?;

    Ok(guard)
}
