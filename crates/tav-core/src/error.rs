//! Error types for tav

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using TavError
pub type Result<T> = std::result::Result<T, TavError>;

/// Main error type for tav operations
#[derive(Debug, Error)]
pub enum TavError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Version matrix errors
    #[error(transparent)]
    Matrix(#[from] MatrixError),

    /// Orchestrator errors
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// Run handle errors
    #[error(transparent)]
    Run(#[from] RunError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// Test files on disk that no declared test references (strict mode)
    #[error("Untracked test files in {dir}: {}", files.join(", "))]
    UntrackedTests { dir: PathBuf, files: Vec<String> },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Version matrix construction errors
#[derive(Debug, Error)]
pub enum MatrixError {
    /// A declared test depends on a package missing from the version set
    #[error("Test '{test}' requires package '{package}' which has no version list")]
    UnknownPackage { test: String, package: String },

    /// A package has an empty version list
    #[error("Package '{0}' has no candidate versions")]
    NoVersions(String),

    /// The number of combinations does not fit in memory addressing
    #[error("Test '{test}' has too many version combinations; set a sample bound")]
    TooManyCombinations { test: String },
}

/// Orchestrator errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A run for this suite is still active
    #[error("A run is already active for suite {0}")]
    RunInProgress(PathBuf),

    /// Failed to spawn the worker
    #[error("Failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run handle errors
#[derive(Debug, Error)]
pub enum RunError {
    /// The worker has already exited
    #[error("Run handle is no longer active: worker has exited")]
    InvalidState,
}

/// Control channel framing errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame length exceeds the allowed maximum
    #[error("Control frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    /// IO error on the control channel
    #[error("Control channel IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed message body
    #[error("Malformed control message: {0}")]
    Json(#[from] serde_json::Error),
}
