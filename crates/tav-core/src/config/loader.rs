//! Configuration loading

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};
use crate::task::VersionSet;

use super::defaults::config_file_names;
use super::types::SuiteConfig;
use super::validation::{validate_config, validate_version_set};

/// Serialization format of a config or version file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Toml,
    Yaml,
    Json,
}

impl FileFormat {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::Toml,
            Some("json") => Self::Json,
            _ => Self::Yaml,
        }
    }

    fn parse<T: for<'de> serde::Deserialize<'de>>(self, content: &str) -> Result<T> {
        let value = match self {
            Self::Toml => toml::from_str(content).map_err(ConfigError::TomlError)?,
            Self::Yaml => serde_yaml::from_str(content).map_err(ConfigError::YamlError)?,
            Self::Json => serde_json::from_str(content).map_err(ConfigError::JsonError)?,
        };
        Ok(value)
    }
}

/// Load a suite configuration from a file
pub fn load_config(path: &Path) -> Result<SuiteConfig> {
    let format = FileFormat::of(path);
    info!(path = %path.display(), format = ?format, "loading config");

    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
    let config: SuiteConfig = format.parse(&content)?;

    validate_config(&config)?;
    debug!(path = %path.display(), tests = config.tests.len(), "config loaded and validated");
    Ok(config)
}

/// Find the configuration file of a suite directory. Only the directory
/// itself is searched: every suite carries its own declarations.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    debug!(dir = %dir.display(), "searching for config file");

    for name in config_file_names() {
        let config_path = dir.join(name);
        if config_path.is_file() {
            info!(path = %config_path.display(), "found config file");
            return Some(config_path);
        }
    }

    debug!("no config file found");
    None
}

/// Load the configuration of a suite directory. A directory without a
/// config file declares no tests; a file that fails to parse or validate is
/// an error.
pub fn load_suite_config(dir: &Path) -> Result<(SuiteConfig, Option<PathBuf>)> {
    match find_config(dir) {
        Some(path) => {
            let config = load_config(&path)?;
            Ok((config, Some(path)))
        }
        None => {
            warn!(dir = %dir.display(), "no config file, suite declares no tests");
            Ok((SuiteConfig::default(), None))
        }
    }
}

/// Load a dependency version set (JSON, YAML or TOML by extension)
pub fn load_version_set(path: &Path) -> Result<VersionSet> {
    let format = FileFormat::of(path);
    info!(path = %path.display(), format = ?format, "loading version set");

    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
    let versions: VersionSet = format.parse(&content)?;

    validate_version_set(&versions)?;
    debug!(packages = versions.len(), "version set loaded");
    Ok(versions)
}
