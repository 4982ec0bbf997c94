use crate::config::LoggingSettings;
use crate::error::AppError;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// RUST_LOG wins over the configured level.
pub fn filter(settings: &LoggingSettings) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(LevelFilter::from_level(settings.level).to_string()))
}

/// Install the global subscriber. With a log file configured, output is
/// written to both stdout and the file.
pub fn init(settings: &LoggingSettings) -> Result<(), AppError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(settings))
        .with_target(false)
        .compact();

    let installed = match &settings.file {
        Some(path) => {
            let file = open_log_file(path)?;
            builder
                .with_ansi(false)
                .with_writer(std::io::stdout.and(Mutex::new(file)))
                .try_init()
        }
        None => builder.try_init(),
    };
    installed.map_err(|e| AppError::Logging(e.to_string()))
}

fn open_log_file(path: &Path) -> Result<File, AppError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .map_err(|e| AppError::Logging(format!("{}: {e}", dir.display())))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| AppError::Logging(format!("{}: {e}", path.display())))
}
