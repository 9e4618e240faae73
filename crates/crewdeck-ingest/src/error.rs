use std::fmt;

/// Result type for crewdeck-ingest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the ingest layer
#[derive(Debug)]
pub enum Error {
    /// IO operation failed
    Io(std::io::Error),

    /// Session is not registered
    UnknownSession(String),

    /// No transcript file could be located for a session
    NoTranscript(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::UnknownSession(id) => write!(f, "Unknown session: {}", id),
            Error::NoTranscript(id) => write!(f, "No transcript found for session: {}", id),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::UnknownSession(_) | Error::NoTranscript(_) => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}
