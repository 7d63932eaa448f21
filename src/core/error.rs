use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error reported by the driver for a failed call.
///
/// `code` is `None` when the driver signalled failure without recording an
/// error code of its own.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("driver error {}: {message}", code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()))]
pub struct DriverError {
    pub code: Option<i64>,
    pub message: String,
}

impl DriverError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn without_code(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Caller misuse detected without asking the driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("Database connection was closed")]
    ConnectionClosed,

    #[error("Transaction was closed")]
    TransactionClosed,

    #[error("Blob was not opened for writing")]
    NotOpenedForWriting,

    #[error("Blob was already closed/discarded")]
    BlobClosed,

    #[error("Blob was not opened for reading")]
    NotOpenedForReading,

    #[error("Positional numbering starts at 1, got {0}")]
    InvalidPosition(i64),

    #[error("Missing bound parameter at position {0}")]
    MissingParameter(usize),

    #[error("Between 1 and 15 event names are required, got {0}")]
    EventCount(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl UsageError {
    /// Stable numeric code for the misuse kind.
    pub fn code(&self) -> i64 {
        match self {
            Self::ConnectionClosed => 0,
            Self::TransactionClosed => 1,
            Self::NotOpenedForWriting => 2,
            Self::BlobClosed => 3,
            Self::NotOpenedForReading => 4,
            Self::InvalidPosition(_) => 5,
            Self::MissingParameter(_) => 6,
            Self::EventCount(_) => 7,
            Self::InvalidConfig(_) => 8,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl Error {
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Driver(e) => e.code,
            Self::Usage(e) => Some(e.code()),
        }
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    pub fn is_driver(&self) -> bool {
        matches!(self, Self::Driver(_))
    }

    /// Returns the usage error if this is one.
    pub fn as_usage(&self) -> Option<&UsageError> {
        match self {
            Self::Usage(e) => Some(e),
            Self::Driver(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_codes_are_stable() {
        assert_eq!(UsageError::ConnectionClosed.code(), 0);
        assert_eq!(UsageError::TransactionClosed.code(), 1);
        assert_eq!(UsageError::NotOpenedForWriting.code(), 2);
        assert_eq!(UsageError::BlobClosed.code(), 3);
        assert_eq!(UsageError::NotOpenedForReading.code(), 4);
        assert_eq!(UsageError::InvalidPosition(0).code(), 5);
    }

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::new(-902, "unavailable database");
        assert_eq!(err.to_string(), "driver error -902: unavailable database");

        let err = DriverError::without_code("no code");
        assert_eq!(err.to_string(), "driver error -: no code");
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = UsageError::BlobClosed.into();
        assert!(err.is_usage());
        assert_eq!(err.code(), Some(3));
        assert_eq!(err.to_string(), "Blob was already closed/discarded");

        let err: Error = DriverError::new(-104, "token unknown").into();
        assert!(err.is_driver());
        assert_eq!(err.code(), Some(-104));
    }
}
