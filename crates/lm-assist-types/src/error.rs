use std::fmt;
use std::path::PathBuf;

/// Result type for lm-assist operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types surfaced by the session engine
#[derive(Debug)]
pub enum Error {
    /// Session id could not be resolved to an existing file
    NotFound(String),

    /// File exists but no valid record was ever read from it
    Malformed(PathBuf),

    /// IO operation failed
    Io(std::io::Error),

    /// JSON encoding/decoding failed outside the line parser
    Json(serde_json::Error),

    /// Attempted to respond to a blocking event that is not pending
    Conflict(String),

    /// Execution ring is full of running executions
    OverCapacity(usize),

    /// Configuration error
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(id) => write!(f, "Session not found: {}", id),
            Error::Malformed(path) => {
                write!(f, "No valid records in file: {}", path.display())
            }
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Json(err) => write!(f, "JSON error: {}", err),
            Error::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Error::OverCapacity(max) => {
                write!(f, "Execution capacity exhausted ({} running)", max)
            }
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Json(err) => Some(err),
            Error::NotFound(_)
            | Error::Malformed(_)
            | Error::Conflict(_)
            | Error::OverCapacity(_)
            | Error::Config(_) => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl Error {
    /// Retry transient IO errors at most once
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
