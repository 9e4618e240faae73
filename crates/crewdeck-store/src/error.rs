use std::fmt;

/// Result type for crewdeck-store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the storage layer
#[derive(Debug)]
pub enum Error {
    /// Database operation failed
    Database(rusqlite::Error),

    /// IO operation failed
    Io(std::io::Error),

    /// Query-specific error (invalid input, not found, etc.)
    Query(String),

    /// A write collided with a uniqueness constraint and the caller should
    /// treat the row as already present
    Conflict(String),

    /// Payload failed the event writer's schema validation
    Validation(String),

    /// Advisory lock could not be acquired within the timeout
    LockTimeout { namespace: i64, key: i64 },

    /// Re-entrant blocking acquisition of a lock this thread already holds
    ReentrantLock { namespace: i64, key: i64 },
}

impl Error {
    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Database(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Database(err) => write!(f, "Database error: {}", err),
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Query(msg) => write!(f, "Query error: {}", msg),
            Error::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::LockTimeout { namespace, key } => {
                write!(f, "Advisory lock timeout for ({}, {})", namespace, key)
            }
            Error::ReentrantLock { namespace, key } => {
                write!(f, "Reentrant advisory lock for ({}, {})", namespace, key)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Query(format!("JSON encoding failed: {}", err))
    }
}
