//! Configuration validation

use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::task::VersionSet;

use super::types::SuiteConfig;

/// Validate a suite configuration
pub fn validate_config(config: &SuiteConfig) -> Result<()> {
    debug!(tests = config.tests.len(), "validating configuration");
    validate_tests(config)?;
    validate_runner(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_tests(config: &SuiteConfig) -> Result<()> {
    for (i, test) in config.tests.iter().enumerate() {
        if test.files.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: format!("tests[{}].files", i),
                message: "at least one test file is required".to_string(),
            }
            .into());
        }

        if test.files.iter().any(|f| f.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: format!("tests[{}].files", i),
                message: "test file names cannot be empty".to_string(),
            }
            .into());
        }

        if test.packages.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: format!("tests[{}].packages", i),
                message: "package names cannot be empty".to_string(),
            }
            .into());
        }
    }

    Ok(())
}

fn validate_runner(config: &SuiteConfig) -> Result<()> {
    if config.runner.worker.program.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "runner.worker.program".to_string(),
            message: "worker program cannot be empty".to_string(),
        }
        .into());
    }

    Ok(())
}

/// Validate a version set: names must be non-empty and every version
/// string must be non-empty and free of whitespace
pub fn validate_version_set(versions: &VersionSet) -> Result<()> {
    for (name, list) in versions.iter() {
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "versions".to_string(),
                message: "package names cannot be empty".to_string(),
            }
            .into());
        }

        if let Some(bad) = list
            .iter()
            .find(|v| v.is_empty() || v.chars().any(char::is_whitespace))
        {
            return Err(ConfigError::InvalidValue {
                field: format!("versions.{}", name),
                message: format!("invalid version string '{}'", bad),
            }
            .into());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::DeclaredTest;

    #[test]
    fn test_validate_default_config() {
        let config = SuiteConfig::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_test_without_files() {
        let mut config = SuiteConfig::default();
        config.tests.push(DeclaredTest::new(Vec::<String>::new()));
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_empty_package_name() {
        let mut config = SuiteConfig::default();
        config
            .tests
            .push(DeclaredTest::new(["a.test.js"]).with_package(" "));
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_empty_worker() {
        let mut config = SuiteConfig::default();
        config.runner.worker.program = String::new();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_version_set() {
        let good = VersionSet::new().with_package("redis", ["1.0.0", "2.0.0"]);
        assert!(validate_version_set(&good).is_ok());

        let bad = VersionSet::new().with_package("redis", ["1.0.0", "2 .0"]);
        assert!(validate_version_set(&bad).is_err());
    }
}
