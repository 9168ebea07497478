use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Encryption, decryption or integrity-check failure. Also raised when
    /// key material could not be provisioned.
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Storage unavailable ({backend}): {message}")]
    StorageUnavailable {
        backend: &'static str,
        message: String,
    },

    #[error("Invalid usage value for {field}: {value}. Must be a finite, non-negative number.")]
    InvalidUsageValue { field: &'static str, value: String },

    #[error("Invalid identifier: '{value}'. {reason}")]
    InvalidIdentifier { value: String, reason: String },

    #[error("Empty value is not allowed")]
    EmptyValue,

    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn storage(backend: &'static str, err: impl std::fmt::Display) -> Self {
        Error::StorageUnavailable {
            backend,
            message: err.to_string(),
        }
    }

    pub(crate) fn crypto(err: impl std::fmt::Display) -> Self {
        Error::Crypto(err.to_string())
    }
}
