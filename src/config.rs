//! Application configuration for the `scrape-batch` binary.
//!
//! Values come from CLI flags, which fall back to environment variables
//! (`SCRAPE_BATCH_DB`, `SCRAPE_BATCH_EXTRACTOR`,
//! `SCRAPE_BATCH_EXTRACTOR_TIMEOUT`), which fall back to the defaults here.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::extractor::CommandExtractorConfig;
use crate::scheduler::{RetryPolicy, RunnerConfig};
use crate::store::ExtractionConfig;

/// Default SQLite database file.
pub const DEFAULT_DATABASE_PATH: &str = "scrape_batch.db";

/// Default log filter.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Resolved application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database holding jobs and tasks.
    pub database_path: PathBuf,
    /// Extractor command line: program followed by its arguments.
    pub extractor_command: Option<String>,
    /// Per-page extractor timeout.
    pub extractor_timeout: Option<Duration>,
    /// Backoff between attempts of a failing page.
    pub retry_policy: RetryPolicy,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            extractor_command: None,
            extractor_timeout: None,
            retry_policy: RetryPolicy::default(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_extractor_command(mut self, command: impl Into<String>) -> Self {
        self.extractor_command = Some(command.into());
        self
    }

    pub fn with_extractor_timeout(mut self, timeout: Duration) -> Self {
        self.extractor_timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_log_level(mut self, log_level: impl Into<String>) -> Self {
        self.log_level = log_level.into();
        self
    }

    /// Checks values that cannot be expressed in the types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "database_path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.extractor_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: "extractor_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if let Some(command) = &self.extractor_command {
            if command.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "extractor_command",
                    reason: "must not be blank".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Database path as a string, as sqlx expects it.
    pub fn database_url(&self) -> String {
        self.database_path.to_string_lossy().into_owned()
    }

    /// Builds the subprocess extractor configuration.
    pub fn extractor_config(&self) -> Result<CommandExtractorConfig, ConfigError> {
        let command = self
            .extractor_command
            .as_deref()
            .and_then(CommandExtractorConfig::from_command_line)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "extractor_command",
                reason: "not configured; pass --extractor or set SCRAPE_BATCH_EXTRACTOR"
                    .to_string(),
            })?;

        Ok(match self.extractor_timeout {
            Some(timeout) => command.with_timeout(timeout),
            None => command,
        })
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::new().with_retry_policy(self.retry_policy)
    }
}

/// Reads an extraction rule from a JSON file.
pub fn load_extraction_config(path: &Path) -> Result<ExtractionConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: ExtractionConfig = serde_json::from_str(&content)?;
    if config.root_selector.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "root_selector",
            reason: "must not be empty".to_string(),
        });
    }
    Ok(config)
}

/// Reads a URL list file: one URL per line.
pub fn load_urls(path: &Path) -> Result<Vec<String>, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(parse_urls(&content))
}

/// One URL per line; blank lines and `#` comments are skipped.
pub fn parse_urls(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}
