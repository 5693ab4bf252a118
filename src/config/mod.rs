//! Configuration loading and validation
//!
//! A run is described by two JSON documents: the application config (backend,
//! concurrency, input and log locations) and the run config (operation list,
//! layouts, spool location, output format).

use std::path::{Path, PathBuf};
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::RunMode;

lazy_static! {
    static ref IDENTIFIER: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("identifier pattern is valid");
}

/// Returns true when `name` is safe to splice into SQL as an identifier.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Errors related to configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        /// File being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for its type
    #[error("Failed to parse {}: {source}", .path.display())]
    Parse {
        /// File being parsed
        path: PathBuf,
        /// Underlying JSON error
        #[source]
        source: serde_json::Error,
    },

    /// A value is out of bounds
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// A name spliced into SQL is not a plain identifier
    #[error("Invalid identifier '{0}': expected letters, digits, '_' or '$'")]
    InvalidIdentifier(String),

    /// Run mode string is neither invoke nor extract
    #[error("Unknown mode '{0}': expected invoke (I) or extract (E)")]
    UnknownMode(String),
}

/// Backend connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Server host name
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login role
    pub user: String,
    /// Login password; empty for trust or peer authentication
    #[serde(default)]
    pub password: String,
    /// Database name
    pub database: String,
    /// Maximum lifetime of a pooled connection, in seconds
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
}

impl DatabaseConfig {
    /// Maximum lifetime of a pooled connection
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_port(),
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            max_lifetime_secs: default_max_lifetime_secs(),
        }
    }
}

/// Application level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Backend connection settings
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Number of entities processed at the same time
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// File holding the entity IDs, one per line
    #[serde(default)]
    pub sol_file_path: PathBuf,
    /// Directory receiving the outcome log and the summary
    #[serde(default = "default_log_dir")]
    pub log_file_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            concurrency: default_concurrency(),
            sol_file_path: PathBuf::new(),
            log_file_path: default_log_dir(),
        }
    }
}

/// Settings for one run of operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Namespace (package) the procedures live in
    pub package_name: String,
    /// Operations applied to every entity, in order
    pub procedures: Vec<String>,
    /// Directory holding `<operation>.csv` column layouts
    #[serde(default)]
    pub template_path: PathBuf,
    /// Directory receiving spool files and final outputs
    #[serde(default = "default_spool_dir")]
    pub spool_output_path: PathBuf,
    /// `delimited` or `fixed`
    #[serde(default = "default_format")]
    pub format: String,
    /// Field separator for the delimited format
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// Process entities concurrently in invoke mode
    #[serde(default = "default_true")]
    pub run_insertion_parallel: bool,
    /// Process entities concurrently in extract mode
    #[serde(default = "default_true")]
    pub run_extraction_parallel: bool,
    /// Workers per entity
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Outcomes buffered between workers and the log writer
    #[serde(default = "default_log_channel_capacity")]
    pub log_channel_capacity: usize,
    /// Column used to filter extracted rows by entity
    #[serde(default = "default_entity_column")]
    pub entity_column: String,
}

impl RunConfig {
    /// Minimal config for the given namespace and operations; everything else defaulted.
    pub fn new(package_name: impl Into<String>, procedures: Vec<String>) -> Self {
        Self {
            package_name: package_name.into(),
            procedures,
            template_path: PathBuf::new(),
            spool_output_path: default_spool_dir(),
            format: default_format(),
            delimiter: default_delimiter(),
            run_insertion_parallel: true,
            run_extraction_parallel: true,
            worker_count: default_worker_count(),
            log_channel_capacity: default_log_channel_capacity(),
            entity_column: default_entity_column(),
        }
    }

    /// Whether entities may run concurrently in the given mode
    pub fn parallel_enabled(&self, mode: RunMode) -> bool {
        match mode {
            RunMode::Invoke => self.run_insertion_parallel,
            RunMode::Extract => self.run_extraction_parallel,
        }
    }

    /// Check identifiers and bounds. The output format is not checked here;
    /// an unknown format only fails extraction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.procedures.is_empty() {
            return Err(ConfigError::Invalid("procedures must not be empty".to_string()));
        }
        if !is_identifier(&self.package_name) {
            return Err(ConfigError::InvalidIdentifier(self.package_name.clone()));
        }
        if let Some(bad) = self.procedures.iter().find(|p| !is_identifier(p)) {
            return Err(ConfigError::InvalidIdentifier(bad.clone()));
        }
        if !is_identifier(&self.entity_column) {
            return Err(ConfigError::InvalidIdentifier(self.entity_column.clone()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".to_string()));
        }
        if self.log_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "log_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Outcome log file name for the mode
    pub fn log_file_name(&self, mode: RunMode) -> String {
        format!("{}_{}.csv", self.package_name, mode.file_tag())
    }

    /// Summary file name for the mode
    pub fn summary_file_name(&self, mode: RunMode) -> String {
        format!("{}_{}_summary.csv", self.package_name, mode.file_tag())
    }
}

impl AppConfig {
    /// Check bounds that loading alone cannot enforce
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Entity concurrency after applying the run's parallel switch
    pub fn effective_concurrency(&self, run: &RunConfig, mode: RunMode) -> usize {
        if run.parallel_enabled(mode) {
            self.concurrency.max(1)
        } else {
            1
        }
    }

    /// Backend connections needed so every worker of every in-flight entity
    /// can hold one: effective concurrency times workers per entity.
    pub fn connection_pool_size(&self, run: &RunConfig, mode: RunMode) -> Result<u32, ConfigError> {
        let concurrency = self.effective_concurrency(run, mode);
        concurrency
            .checked_mul(run.worker_count)
            .and_then(|connections| u32::try_from(connections).ok())
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "concurrency {} x worker_count {} exceeds the connection pool limit",
                    concurrency, run.worker_count
                ))
            })
    }
}

/// Load and validate the application config
pub fn load_app_config(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = read_json(path.as_ref())?;
    config.validate()?;
    Ok(config)
}

/// Load and validate the run config
pub fn load_run_config(path: impl AsRef<Path>) -> Result<RunConfig, ConfigError> {
    let config: RunConfig = read_json(path.as_ref())?;
    config.validate()?;
    Ok(config)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_port() -> u16 {
    5432
}

fn default_max_lifetime_secs() -> u64 {
    30 * 60
}

fn default_concurrency() -> usize {
    num_cpus::get()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_format() -> String {
    "delimited".to_string()
}

fn default_delimiter() -> String {
    "|".to_string()
}

fn default_true() -> bool {
    true
}

fn default_worker_count() -> usize {
    4
}

fn default_log_channel_capacity() -> usize {
    1000
}

fn default_entity_column() -> String {
    "sol_id".to_string()
}
