use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::LevelFilter;
use serde::Deserialize;

use crate::watch::{NotifyFilter, WatchScope};

/// Names a JSON config file to load instead of the defaults.
pub const CONFIG_ENV: &str = "ENUM_UNINSTALL_CONFIG";
/// Overrides the configured log level.
pub const LOG_ENV: &str = "ENUM_UNINSTALL_LOG";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    /// Keep entries that are components of another product in `list`/`search`.
    pub include_components: bool,
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub filter: Vec<FilterName>,
    pub scope: ScopeName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterName {
    Key,
    Attribute,
    Value,
    Security,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeName {
    Key,
    KeyAndSubtree,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            include_components: false,
            watch: WatchConfig::default(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            filter: vec![
                FilterName::Key,
                FilterName::Attribute,
                FilterName::Value,
                FilterName::Security,
            ],
            scope: ScopeName::KeyAndSubtree,
        }
    }
}

impl Config {
    /// Defaults, or the file named by `ENUM_UNINSTALL_CONFIG`, then the
    /// `ENUM_UNINSTALL_LOG` override.
    pub fn load() -> Result<Config, ConfigError> {
        Config::load_from(|name| env::var(name).ok())
    }

    /// Like [`Config::load`], reading variables through `lookup`.
    pub fn load_from<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_ENV) {
            Some(path) => Config::from_file(Path::new(&path))?,
            None => Config::default(),
        };
        if let Some(level) = lookup(LOG_ENV) {
            config.log_level = level;
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Unknown level names fall back to `warn`.
    pub fn level_filter(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Warn)
    }
}

impl WatchConfig {
    /// An empty list watches everything.
    pub fn notify_filter(&self) -> NotifyFilter {
        let filter = self.filter.iter().fold(NotifyFilter::empty(), |acc, name| {
            acc | match name {
                FilterName::Key => NotifyFilter::KEY,
                FilterName::Attribute => NotifyFilter::ATTRIBUTE,
                FilterName::Value => NotifyFilter::VALUE,
                FilterName::Security => NotifyFilter::SECURITY,
            }
        });
        if filter.is_empty() {
            NotifyFilter::ALL
        } else {
            filter
        }
    }

    pub fn watch_scope(&self) -> WatchScope {
        match self.scope {
            ScopeName::Key => WatchScope::KeyOnly,
            ScopeName::KeyAndSubtree => WatchScope::KeyAndSubtree,
        }
    }
}
