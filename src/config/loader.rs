//! Startup settings loading from disk.
//!
//! Only the declarative part of [`StartConfig`] can live in a file; hooks are
//! attached in code after loading.

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::schema::{ListenerNetwork, ShutdownSignal, StartConfig};
use crate::config::validation::{validate_settings, ValidationError};

/// Serializable subset of the startup configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StartSettings {
    pub listener_network: Option<ListenerNetwork>,
    pub cert_file: Option<PathBuf>,
    pub cert_key_file: Option<PathBuf>,
    pub cert_client_file: Option<PathBuf>,
    pub graceful_signals: Vec<ShutdownSignal>,
    pub graceful_timeout_secs: Option<u64>,
    pub disable_startup_message: bool,
    pub enable_prefork: bool,
    pub enable_print_routes: bool,
    pub prefork_processes: Option<usize>,
}

impl From<StartSettings> for StartConfig {
    fn from(settings: StartSettings) -> Self {
        StartConfig {
            listener_network: settings.listener_network,
            cert_file: settings.cert_file,
            cert_key_file: settings.cert_key_file,
            cert_client_file: settings.cert_client_file,
            graceful_signals: settings.graceful_signals,
            graceful_timeout: settings
                .graceful_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_default(),
            disable_startup_message: settings.disable_startup_message,
            enable_prefork: settings.enable_prefork,
            enable_print_routes: settings.enable_print_routes,
            prefork_processes: settings.prefork_processes.and_then(NonZeroUsize::new),
            ..StartConfig::default()
        }
    }
}

/// Error type for settings loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Validation(_) => None,
        }
    }
}

/// Parse and validate settings from TOML text.
pub fn parse_settings(content: &str) -> Result<StartSettings, ConfigError> {
    let settings: StartSettings = toml::from_str(content).map_err(ConfigError::Parse)?;
    validate_settings(&settings).map_err(ConfigError::Validation)?;
    Ok(settings)
}

/// Load and validate settings from a TOML file.
pub fn load_settings(path: &Path) -> Result<StartSettings, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    let settings = parse_settings(&content)?;

    tracing::debug!(path = %path.display(), "Startup settings loaded");
    Ok(settings)
}
