//! Structured logging for the command line tool.
//!
//! Two layers are installed:
//! - stderr, human-readable, level chosen by `-v` count or `RUST_LOG`
//! - a daily-rotated JSON file under the local data directory
//!
//! Stdout stays reserved for command output.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_PREFIX: &str = "musiclib-mobile";

/// Logging options derived from the command line.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory for rotated log files. `None` disables file logging.
    pub log_directory: Option<PathBuf>,
    /// Maximum level written to stderr.
    pub console_level: Level,
    /// Maximum level written to the log file.
    pub file_level: Level,
    /// Whether stderr output is colored.
    pub console_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::for_verbosity(0)
    }
}

impl LoggingConfig {
    /// Levels for a `-v` count: warnings by default, then info, debug, trace.
    #[must_use]
    pub fn for_verbosity(verbose: u8) -> Self {
        let console_level = match verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        Self {
            log_directory: Some(default_log_directory()),
            console_level,
            file_level: if verbose >= 2 { Level::TRACE } else { Level::DEBUG },
            console_ansi: std::env::var_os("NO_COLOR").is_none(),
        }
    }

    /// Disable the file layer.
    #[must_use]
    pub fn without_file(mut self) -> Self {
        self.log_directory = None;
        self
    }

    fn console_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = level_to_directive(self.console_level);
            EnvFilter::new("warn")
                .add_directive(crate_directive("musiclib_mobile", level))
                .add_directive(crate_directive("musiclib_mobile_core", level))
        })
    }

    fn file_filter(&self) -> EnvFilter {
        let level = level_to_directive(self.file_level);
        EnvFilter::new("info")
            .add_directive(crate_directive("musiclib_mobile", level))
            .add_directive(crate_directive("musiclib_mobile_core", level))
    }
}

fn crate_directive(target: &str, level: &str) -> tracing_subscriber::filter::Directive {
    format!("{target}={level}")
        .parse()
        .expect("valid directive")
}

/// Keeps the file writer alive. Dropping it flushes pending entries.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created.
///
/// # Panics
///
/// Panics if logging has already been initialized.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.console_ansi)
        .with_target(config.console_level >= Level::DEBUG)
        .without_time()
        .with_filter(config.console_filter());

    let (file_layer, file_guard) = match &config.log_directory {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| LoggingError::DirectoryCreationFailed {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .json()
                .with_filter(config.file_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Default log directory.
#[must_use]
pub fn default_log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("musiclib")
        .join("logs")
}

const fn level_to_directive(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

/// Errors raised while installing logging.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// The log directory could not be created.
    #[error("Failed to create log directory {path}: {reason}")]
    DirectoryCreationFailed {
        /// Directory path.
        path: PathBuf,
        /// Reason for the failure.
        reason: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(LoggingConfig::for_verbosity(0).console_level, Level::WARN);
        assert_eq!(LoggingConfig::for_verbosity(1).console_level, Level::INFO);
        assert_eq!(LoggingConfig::for_verbosity(2).console_level, Level::DEBUG);
        assert_eq!(LoggingConfig::for_verbosity(7).console_level, Level::TRACE);
        assert_eq!(LoggingConfig::for_verbosity(2).file_level, Level::TRACE);
        assert_eq!(LoggingConfig::default().file_level, Level::DEBUG);
    }

    #[test]
    fn test_without_file() {
        let config = LoggingConfig::default().without_file();
        assert!(config.log_directory.is_none());
        assert!(LoggingConfig::default().log_directory.is_some());
    }

    #[test]
    fn test_default_log_directory() {
        let dir = default_log_directory();
        assert!(dir.ends_with("musiclib/logs"));
    }

    #[test]
    fn test_crate_directive_parses() {
        let directive = crate_directive("musiclib_mobile_core", "debug");
        assert_eq!(directive.to_string(), "musiclib_mobile_core=debug");
    }
}
