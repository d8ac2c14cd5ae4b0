//! Settings read by [`FleetSubscriberBuilder`](crate::FleetSubscriberBuilder)

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What the subscriber writes and where
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
    pub console: ConsoleFormat,
    /// Rolling JSONL file written alongside the console
    pub file: Option<FileConfig>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: ConsoleFormat::Json,
            file: None,
        }
    }
}

impl LogConfig {
    /// Debug level, colored console
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            console: ConsoleFormat::Pretty { ansi: true },
            file: None,
        }
    }

    /// Warnings only, plain text so test harness capture stays readable
    pub fn testing() -> Self {
        Self {
            level: "warn".to_string(),
            console: ConsoleFormat::Pretty { ansi: false },
            file: None,
        }
    }
}

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsoleFormat {
    Off,
    /// One JSON object per line on stdout
    Json,
    Pretty { ansi: bool },
}

/// Rolling log file on a gateway's disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub directory: PathBuf,
    /// File names are `<prefix>.<date>.log`
    pub prefix: String,
    pub rotation: RotationStrategy,
    /// Oldest files beyond this count are removed; `None` keeps all
    pub keep: Option<usize>,
}

impl FileConfig {
    /// Daily files under `directory`, one week retained
    pub fn daily(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            prefix: "fleet-upstream".to_string(),
            rotation: RotationStrategy::Daily,
            keep: Some(7),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    Never,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logs_json_to_console() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.console, ConsoleFormat::Json);
        assert!(config.file.is_none());
    }

    #[test]
    fn test_development_is_colored() {
        let config = LogConfig::development();
        assert_eq!(config.level, "debug");
        assert_eq!(config.console, ConsoleFormat::Pretty { ansi: true });
    }

    #[test]
    fn test_testing_is_quiet_and_plain() {
        let config = LogConfig::testing();
        assert_eq!(config.level, "warn");
        assert_eq!(config.console, ConsoleFormat::Pretty { ansi: false });
    }

    #[test]
    fn test_daily_file_keeps_a_week() {
        let file = FileConfig::daily("/var/log/fleet");
        assert_eq!(file.directory, PathBuf::from("/var/log/fleet"));
        assert_eq!(file.rotation, RotationStrategy::Daily);
        assert_eq!(file.keep, Some(7));
    }
}
