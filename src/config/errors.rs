//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading or validating the proxy configuration.
///
/// All of these are fatal at load time: the engine refuses to initialize
/// with a configuration that produced one.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file '{path}': {reason}")]
    Io { path: String, reason: String },

    /// The config file is not valid JSON/YAML or does not match the schema.
    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    /// A server entry is invalid.
    #[error("invalid server '{server}': {reason}")]
    InvalidServer { server: String, reason: String },

    /// The global settings block is invalid.
    #[error("invalid global settings: {reason}")]
    InvalidGlobal { reason: String },

    /// A `${VAR}` placeholder refers to an unset environment variable.
    #[error("server '{server}' references undefined environment variable '{var}'")]
    MissingEnvVar { server: String, var: String },

    /// No config file could be located.
    #[error("no config file found: {reason}")]
    NotFound { reason: String },
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse {
            reason: e.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Parse {
            reason: e.to_string(),
        }
    }
}
