//! Configuration errors.

use thiserror::Error;

use super::ErrorCode;

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read or written.
    #[error("config I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("config parse error: {source}")]
    Parse {
        /// The underlying parse error.
        #[from]
        source: toml::de::Error,
    },

    /// The configuration could not be serialized.
    #[error("config serialization error: {source}")]
    Serialize {
        /// The underlying serialization error.
        #[from]
        source: toml::ser::Error,
    },

    /// A value is out of range or inconsistent.
    #[error("invalid configuration: {message}")]
    Invalid {
        /// Error message.
        message: String,
    },
}

impl ConfigError {
    /// Creates an invalid-configuration error.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::ConfigIo,
            Self::Parse { .. } | Self::Serialize { .. } => ErrorCode::ConfigParse,
            Self::Invalid { .. } => ErrorCode::InvalidConfig,
        }
    }
}
