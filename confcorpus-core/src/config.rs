//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/confcorpus/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/confcorpus/` (~/.config/confcorpus/)
//! - Data: `$XDG_DATA_HOME/confcorpus/` (~/.local/share/confcorpus/)
//! - State/Logs: `$XDG_STATE_HOME/confcorpus/` (~/.local/state/confcorpus/)

use crate::error::{Error, Result};
use crate::source::FileFormat;
use crate::view::{projection, EVENTSERIES_PROJECTION, EVENT_PROJECTION};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

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
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Cache storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Union view projections
    #[serde(default)]
    pub views: ViewConfig,

    /// Named SQL queries
    #[serde(default)]
    pub queries: BTreeMap<String, String>,

    /// Registered data sources, in registration order
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// Where cached tables live
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// SQLite file on disk
    #[default]
    Sql,
    /// Throwaway in-memory SQLite database
    Memory,
}

/// Cache storage configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Storage backend
    #[serde(default)]
    pub mode: StorageMode,

    /// Override path of the SQLite cache file
    pub cache_file: Option<PathBuf>,

    /// Cached tables older than this are refetched (never, if unset)
    pub max_age_hours: Option<u64>,
}

impl StorageConfig {
    /// In-memory storage, mainly for tests.
    pub fn memory() -> Self {
        Self {
            mode: StorageMode::Memory,
            ..Default::default()
        }
    }

    /// SQLite storage at an explicit path.
    pub fn sql(path: impl Into<PathBuf>) -> Self {
        Self {
            mode: StorageMode::Sql,
            cache_file: Some(path.into()),
            max_age_hours: None,
        }
    }

    /// Resolved cache file path
    pub fn cache_path(&self) -> PathBuf {
        self.cache_file
            .clone()
            .unwrap_or_else(Config::database_path)
    }

    pub fn max_age(&self) -> Option<chrono::Duration> {
        // capped at a century so the conversion cannot overflow
        self.max_age_hours
            .map(|h| chrono::Duration::hours(h.min(24 * 365 * 100) as i64))
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
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

/// Column projections of the union views
#[derive(Debug, Deserialize, Clone)]
pub struct ViewConfig {
    #[serde(default = "default_event_projection")]
    pub event: Vec<String>,

    #[serde(default = "default_eventseries_projection")]
    pub eventseries: Vec<String>,

    /// Tables left out of every union view
    #[serde(default)]
    pub exclude: HashSet<String>,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            event: default_event_projection(),
            eventseries: default_eventseries_projection(),
            exclude: HashSet::new(),
        }
    }
}

fn default_event_projection() -> Vec<String> {
    projection(EVENT_PROJECTION)
}

fn default_eventseries_projection() -> Vec<String> {
    projection(EVENTSERIES_PROJECTION)
}

/// One `[[sources]]` entry
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Stable source id, e.g. `dblp`
    pub id: String,
    /// Display name
    pub name: Option<String>,
    /// Home page of the source
    pub url: Option<String>,
    /// Descriptive title
    pub title: Option<String>,
    /// Table suffix; defaults to the id
    pub table_suffix: Option<String>,
    /// Event records
    pub events: FileTableConfig,
    /// Event series records
    pub series: FileTableConfig,
}

impl SourceConfig {
    pub fn table_suffix(&self) -> &str {
        self.table_suffix.as_deref().unwrap_or(&self.id)
    }
}

/// File-backed records of one entity kind
#[derive(Debug, Deserialize, Clone)]
pub struct FileTableConfig {
    /// Glob pattern; relative patterns resolve against the config file's directory
    pub pattern: String,
    /// File format
    #[serde(default)]
    pub format: FileFormat,
    /// Primary key override
    pub primary_key: Option<String>,
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
    ///
    /// Relative source patterns are resolved against the file's directory.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let mut config = Self::parse(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_patterns(base);
        }
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.is_empty() {
                return Err(Error::Config("sources.id must not be empty".to_string()));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(Error::Config(format!(
                    "source id {:?} is configured twice",
                    source.id
                )));
            }
            let suffix = source.table_suffix();
            if suffix.is_empty()
                || !suffix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(Error::Config(format!(
                    "table_suffix {:?} of source {:?} must match [A-Za-z0-9_]+",
                    suffix, source.id
                )));
            }
        }
        if self.views.event.is_empty() || self.views.eventseries.is_empty() {
            return Err(Error::Config(
                "view projections must name at least one column".to_string(),
            ));
        }
        Ok(())
    }

    fn resolve_patterns(&mut self, base: &Path) {
        for source in &mut self.sources {
            for table in [&mut source.events, &mut source.series] {
                if Path::new(&table.pattern).is_relative() {
                    table.pattern = base.join(&table.pattern).to_string_lossy().to_string();
                }
            }
        }
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/confcorpus/config.toml` (~/.config/confcorpus/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("confcorpus").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite cache)
    ///
    /// `$XDG_DATA_HOME/confcorpus/` (~/.local/share/confcorpus/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("confcorpus")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/confcorpus/` (~/.local/state/confcorpus/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("confcorpus")
    }

    /// Returns the default cache database path
    ///
    /// `$XDG_DATA_HOME/confcorpus/EventCorpus.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("EventCorpus.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/confcorpus/confcorpus.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("confcorpus.log")
    }
}
