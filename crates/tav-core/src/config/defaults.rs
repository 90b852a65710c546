//! Default configuration values

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "tav.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "tav.yaml";

/// Alternative configuration file name
pub const ALT_CONFIG_FILE: &str = ".tav.yml";

/// Worker program used when none is configured
pub const DEFAULT_WORKER_PROGRAM: &str = "tav-worker";

/// Get list of config file names to search for, in priority order
pub fn config_file_names() -> Vec<&'static str> {
    vec![DEFAULT_CONFIG_TOML, DEFAULT_CONFIG_YAML, "tav.yml", ALT_CONFIG_FILE]
}
