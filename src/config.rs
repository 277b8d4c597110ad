//! Configuration System
//!
//! Layered configuration: built-in defaults, the global config file, an
//! explicitly named file, then `ATELIER__SECTION__KEY` environment overrides.
//! Validation reports every problem at once.

use crate::logging::LoggingConfig;
use config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub use crate::provider::{ProviderConfig, ProviderType};
pub use crate::queue::SchedulerConfig;

mod merge {
    pub mod merge_policy;
}

mod sources {
    pub mod explicit_file;
    pub mod global_file;
}

const APP_NAME: &str = "atelier";

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AtelierConfig {
    /// Directory for the artifact cache and database. Platform cache dir when unset.
    #[serde(default)]
    pub cache_root: Option<PathBuf>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Platform cache directory for atelier, e.g. `~/.cache/atelier`.
pub fn default_cache_root() -> PathBuf {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME))
}

impl AtelierConfig {
    /// Configuration rooted at `cache_root`, everything else defaulted.
    pub fn with_cache_root(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: Some(cache_root.into()),
            ..Self::default()
        }
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache_root.clone().unwrap_or_else(default_cache_root)
    }

    pub fn db_path(&self) -> PathBuf {
        self.cache_root().join("db")
    }

    pub fn artifacts_path(&self) -> PathBuf {
        self.cache_root().join("artifacts")
    }

    /// Log file path with relative paths resolved against the cache root.
    pub fn log_file(&self) -> PathBuf {
        if self.logging.file.is_absolute() {
            self.logging.file.clone()
        } else {
            self.cache_root().join(&self.logging.file)
        }
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        if let Some(root) = &self.cache_root {
            if root.as_os_str().is_empty() {
                errors.push(ConfigValidationError::Storage(
                    "cache_root cannot be empty".to_string(),
                ));
            }
        }
        if let Err(e) = self.scheduler.validate() {
            errors.push(ConfigValidationError::Scheduler(e));
        }
        if let Err(e) = self.provider.validate() {
            errors.push(ConfigValidationError::Provider(e));
        }
        if let Err(e) = self.logging.validate() {
            errors.push(ConfigValidationError::Logging(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    Storage(String),
    Scheduler(String),
    Provider(String),
    Logging(String),
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
            ConfigValidationError::Scheduler(msg) => write!(f, "Scheduler: {}", msg),
            ConfigValidationError::Provider(msg) => write!(f, "Provider: {}", msg),
            ConfigValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Join validation errors into one message.
pub fn describe_validation_errors(errors: &[ConfigValidationError]) -> String {
    let lines: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("Configuration validation failed:\n{}", lines.join("\n"))
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the layered configuration. `explicit` must exist when given.
    pub fn load(explicit: Option<&Path>) -> Result<AtelierConfig, ConfigError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::explicit_file::add_to_builder(builder, explicit)?;
        builder
            .add_source(merge::merge_policy::environment())
            .build()?
            .try_deserialize()
    }

    /// Load a single file over the defaults, ignoring the global file and the
    /// environment.
    pub fn load_from_file(path: &Path) -> Result<AtelierConfig, ConfigError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        sources::explicit_file::add_to_builder(builder, Some(path))?
            .build()?
            .try_deserialize()
    }

    pub fn global_config_path() -> Option<PathBuf> {
        sources::global_file::global_config_path()
    }
}
