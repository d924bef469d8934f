//! Error types for smstore

use crate::model::SchemaVersion;
use thiserror::Error;

/// Result type alias for smstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in smstore operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Schema mismatch: file is at {found}, code supports up to {supported}")]
    SchemaMismatch {
        found: SchemaVersion,
        supported: SchemaVersion,
    },

    #[error("Store is busy: {0}")]
    Busy(String),

    #[error("Corruption detected: {0}")]
    Corrupt(String),

    #[error("Truncated buffer: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same call may succeed.
    ///
    /// Only lock contention qualifies; schema, corruption and write-path
    /// failures are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Error::Busy(err.to_string())
            }
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                Error::Corrupt(err.to_string())
            }
            _ => Error::Sqlite(err),
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_retryable() {
        let busy = Error::from(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(matches!(busy, Error::Busy(_)));
        assert!(busy.is_retryable());
    }

    #[test]
    fn test_schema_mismatch_not_retryable() {
        let err = Error::SchemaMismatch {
            found: SchemaVersion::new(9, 0, 0, 0),
            supported: SchemaVersion::new(1, 0, 0, 0),
        };
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Schema mismatch: file is at 9.0.0.0, code supports up to 1.0.0.0"
        );
    }
}
