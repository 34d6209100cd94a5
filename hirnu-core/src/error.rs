//! Error types for configuration loading and persistence.

use std::path::PathBuf;

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] Box<figment::Error>),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// A type alias for results using [`ConfigError`].
pub type Result<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = ConfigError::FileNotFound {
            path: PathBuf::from("configs/missing.yaml"),
        };
        assert_eq!(
            err.to_string(),
            "Configuration file not found: configs/missing.yaml"
        );
    }

    #[test]
    fn test_error_display_invalid() {
        let err = ConfigError::invalid("batch_size must be positive");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: batch_size must be positive"
        );
    }
}
