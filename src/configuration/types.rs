use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::LevelFilter;
use serde::Deserialize;

use crate::error_handling::types::ConfigError;

/// Optional settings file. Every key has a default, so an empty file (or no
/// file at all) is valid.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub sink: SinkSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SinkSettings {
    /// Prepended to the stream id to name each stream file.
    pub file_prefix: String,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            file_prefix: String::from("stream_"),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    /// Copy each finalized stream file into the database as well.
    pub embed_payload: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: String::from("info"),
        }
    }
}

impl LoggingSettings {
    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(&self.level)
            .map_err(|_| ConfigError::TomlError(format!("unknown logging level '{}'", self.level)))
    }
}

impl Settings {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        if settings.sink.file_prefix.contains(std::path::MAIN_SEPARATOR) {
            return Err(ConfigError::TomlError(format!(
                "sink.file_prefix must not contain a path separator: '{}'",
                settings.sink.file_prefix
            )));
        }
        settings.logging.level_filter()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}
