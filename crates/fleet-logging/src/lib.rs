//! # Fleet Logging
//!
//! Structured logging for fleet services.
//!
//! Console output is either pretty-printed or JSONL, and a rolling file
//! sink can be added alongside it. `RUST_LOG` overrides the configured
//! default level.
//!
//! ## Example
//!
//! ```rust,ignore
//! use fleet_logging::FleetSubscriberBuilder;
//!
//! let _guard = FleetSubscriberBuilder::new()
//!     .with_level("debug")
//!     .init()?;
//!
//! tracing::info!(node_id = "dev-1", "Upstream connected");
//! ```

pub mod config;
pub mod layers;

pub use config::{ConsoleFormat, FileConfig, LogConfig, RotationStrategy};
pub use tracing_appender::non_blocking::WorkerGuard;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry};

use crate::layers::{file_writer, jsonl_layer, pretty_layer, BoxedLayer};

/// Errors raised while installing the global subscriber
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to open log file: {0}")]
    File(#[from] tracing_appender::rolling::InitError),

    #[error("global subscriber already set: {0}")]
    AlreadySet(#[from] tracing_subscriber::util::TryInitError),
}

/// Builder for the fleet tracing subscriber
pub struct FleetSubscriberBuilder {
    config: LogConfig,
}

impl FleetSubscriberBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    /// Create a builder with custom configuration
    pub fn with_config(config: LogConfig) -> Self {
        Self { config }
    }

    /// Set the default log level
    pub fn with_level(mut self, level: &str) -> Self {
        self.config.level = level.to_string();
        self
    }

    /// Configure console output
    pub fn with_console(mut self, format: ConsoleFormat) -> Self {
        self.config.console = format;
        self
    }

    /// Add rolling file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Install the subscriber globally
    ///
    /// The returned guard flushes the file writer when dropped, so hold it
    /// for the life of the process.
    pub fn init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.level));

        let mut layers: Vec<BoxedLayer<Registry>> = Vec::new();

        match self.config.console {
            ConsoleFormat::Off => {}
            ConsoleFormat::Json => layers.push(jsonl_layer(std::io::stdout)),
            ConsoleFormat::Pretty { ansi } => layers.push(pretty_layer(ansi)),
        }

        let guard = match &self.config.file {
            Some(file) => {
                let (writer, guard) = file_writer(file)?;
                layers.push(jsonl_layer(writer));
                Some(guard)
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(layers)
            .with(env_filter)
            .try_init()?;

        Ok(guard)
    }
}

impl Default for FleetSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize with default settings
pub fn init_default() -> Result<Option<WorkerGuard>, LoggingError> {
    FleetSubscriberBuilder::new().init()
}

/// Initialize with pretty console output for development
pub fn init_development() -> Result<Option<WorkerGuard>, LoggingError> {
    FleetSubscriberBuilder::with_config(LogConfig::development()).init()
}

/// Initialize for tests
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_testing() {
    let _ = FleetSubscriberBuilder::with_config(LogConfig::testing()).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = FleetSubscriberBuilder::new();
        assert_eq!(builder.config.level, "info");
        assert_eq!(builder.config.console, ConsoleFormat::Json);
        assert!(builder.config.file.is_none());
    }

    #[test]
    fn test_builder_with_level() {
        let builder = FleetSubscriberBuilder::new().with_level("trace");
        assert_eq!(builder.config.level, "trace");
    }

    #[test]
    fn test_builder_with_console() {
        let builder = FleetSubscriberBuilder::new().with_console(ConsoleFormat::Off);
        assert_eq!(builder.config.console, ConsoleFormat::Off);
    }

    #[test]
    fn test_builder_with_file_output() {
        let builder = FleetSubscriberBuilder::new().with_file_output(FileConfig::daily("logs"));
        let file = builder.config.file.unwrap();
        assert_eq!(file.prefix, "fleet-upstream");
    }

    #[test]
    fn test_init_testing_is_repeatable() {
        init_testing();
        init_testing();
    }
}
