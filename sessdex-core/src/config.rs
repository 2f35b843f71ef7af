//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/sessdex/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/sessdex/` (~/.config/sessdex/)
//! - Data: `$XDG_DATA_HOME/sessdex/` (~/.local/share/sessdex/)
//! - State/Logs: `$XDG_STATE_HOME/sessdex/` (~/.local/state/sessdex/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Upper bound for concurrent parse workers.
const MAX_PARALLEL_PARSES: usize = 32;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Parsing and reconciliation settings
    #[serde(default)]
    pub index: IndexConfig,

    /// Maintenance sweep settings
    #[serde(default)]
    pub sweep: SweepConfig,

    /// Log source path overrides
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Parsing, concurrency and store settings
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Maximum lines read by the bounded (low-latency) parser
    #[serde(default = "default_bounded_parse_line_limit")]
    pub bounded_parse_line_limit: u64,

    /// Upgrade exhaustive parses to `Enriched` with derived metrics
    #[serde(default = "default_true")]
    pub enable_enriched_fidelity: bool,

    /// Gaps between events longer than this do not count as active time
    #[serde(default = "default_idle_gap_minutes")]
    pub idle_gap_minutes: u32,

    /// Number of files parsed concurrently
    #[serde(default = "default_max_parallel_parses")]
    pub max_parallel_parses: usize,

    /// Retries for a store write that hit SQLite contention
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,

    /// Base backoff between store retries, multiplied by the attempt number
    #[serde(default = "default_store_retry_backoff_ms")]
    pub store_retry_backoff_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            bounded_parse_line_limit: default_bounded_parse_line_limit(),
            enable_enriched_fidelity: true,
            idle_gap_minutes: default_idle_gap_minutes(),
            max_parallel_parses: default_max_parallel_parses(),
            store_retry_attempts: default_store_retry_attempts(),
            store_retry_backoff_ms: default_store_retry_backoff_ms(),
        }
    }
}

impl IndexConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.bounded_parse_line_limit == 0 {
            return Err(Error::Config(
                "index.bounded_parse_line_limit must be at least 1".to_string(),
            ));
        }
        if self.max_parallel_parses == 0 || self.max_parallel_parses > MAX_PARALLEL_PARSES {
            return Err(Error::Config(format!(
                "index.max_parallel_parses must be between 1 and {}",
                MAX_PARALLEL_PARSES
            )));
        }
        Ok(())
    }

    /// Idle gap threshold as a chrono duration
    pub fn idle_gap(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.idle_gap_minutes))
    }
}

fn default_true() -> bool {
    true
}

fn default_bounded_parse_line_limit() -> u64 {
    64
}

fn default_idle_gap_minutes() -> u32 {
    15
}

fn default_max_parallel_parses() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_PARALLEL_PARSES)
}

fn default_store_retry_attempts() -> u32 {
    3
}

fn default_store_retry_backoff_ms() -> u64 {
    25
}

/// Maintenance sweep configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SweepConfig {
    /// A `full`/`enriched` row averaging more bytes per scanned line than
    /// this is treated as under-scanned and re-derived.
    #[serde(default = "default_max_avg_line_bytes")]
    pub max_avg_line_bytes: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            max_avg_line_bytes: default_max_avg_line_bytes(),
        }
    }
}

fn default_max_avg_line_bytes() -> u64 {
    256 * 1024
}

/// Override paths for log sources
#[derive(Debug, Deserialize, Default, Clone)]
pub struct SourcesConfig {
    /// Override path for Codex data
    pub codex_path: Option<PathBuf>,
    /// Override path for Claude Code data
    pub claude_code_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.index.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/sessdex/config.toml` (~/.config/sessdex/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("sessdex").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite index)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("sessdex")
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("sessdex")
    }

    /// Returns the index database path
    ///
    /// `$XDG_DATA_HOME/sessdex/index.db` (~/.local/share/sessdex/index.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("index.db")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("sessdex.log")
    }
}
