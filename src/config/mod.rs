use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub stream: StreamConfig,
    pub bulk_load: BulkLoadConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Incremental update stream configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Bounded capacity of the batch channel between reader and store consumer
    pub channel_capacity: usize,
    /// Maximum accepted size of a single batch line
    pub max_line_bytes: usize,
}

/// Bulk load source configuration
#[derive(Debug, Clone, Default)]
pub struct BulkLoadConfig {
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/kpi.db".to_string()),
            ),
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let stream = StreamConfig {
            channel_capacity: parse_positive("STREAM_CHANNEL_CAPACITY", 256)?,
            max_line_bytes: parse_positive("STREAM_MAX_LINE_BYTES", 1024 * 1024)?,
        };

        let bulk_load = BulkLoadConfig {
            path: env::var("BULK_LOAD_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        };

        Ok(Config {
            database,
            logging,
            stream,
            bulk_load,
        })
    }
}

/// Parse a strictly positive integer variable, falling back to `default` when unset.
fn parse_positive(key: &str, default: usize) -> Result<usize, AppError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(0) | Err(_) => Err(AppError::Config {
                message: format!("{} must be a positive integer, got '{}'", key, raw),
            }),
            Ok(value) => Ok(value),
        },
        Err(_) => Ok(default),
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            max_line_bytes: 1024 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_default() {
        let config = StreamConfig::default();
        assert_eq!(config.channel_capacity, 256);
        assert_eq!(config.max_line_bytes, 1024 * 1024);
    }

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn test_bulk_load_config_default_is_unset() {
        assert!(BulkLoadConfig::default().path.is_none());
    }
}
