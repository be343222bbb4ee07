//! Error types for Graphite
//!
//! Defines a unified error type that can represent failures from all
//! storage components. Apart from wrapped I/O errors, the interesting
//! cases are the transaction log conditions: a log file with a foreign
//! header (`BadMagic`) and a log file whose trailing frame was cut off
//! mid-write (`Truncated`).

use std::fmt;
use std::io;

use crate::store::record::RecordId;

/// Unified error type for Graphite storage operations
#[derive(Debug)]
pub enum GraphiteError {
    /// I/O error from the data file or the transaction log
    Io(io::Error),
    /// Transaction log header does not carry the expected magic bytes.
    /// Tolerated at startup (the log is re-initialised), fatal anywhere
    /// else. Carries the log file path.
    BadMagic(String),
    /// Transaction log ends in the middle of a frame or record image
    Truncated(String),
    /// Record is already checked out of the record file
    RecordInUse(RecordId),
    /// Record was released without having been checked out
    RecordNotInUse(RecordId),
    /// Operation against a transaction log that is currently closed
    LogClosed,
    /// Generic internal error
    Internal(String),
}

impl GraphiteError {
    /// True if this is the tolerated bad-header condition
    pub fn is_bad_magic(&self) -> bool {
        matches!(self, GraphiteError::BadMagic(_))
    }
}

impl fmt::Display for GraphiteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphiteError::Io(e) => write!(f, "{}", e),
            GraphiteError::BadMagic(name) => {
                write!(f, "Bad magic for transaction log '{}'", name)
            }
            GraphiteError::Truncated(msg) => {
                write!(f, "Truncated transaction log: {}", msg)
            }
            GraphiteError::RecordInUse(id) => write!(f, "Record {} is already in use", id),
            GraphiteError::RecordNotInUse(id) => write!(f, "Record {} has not been checked out", id),
            GraphiteError::LogClosed => write!(f, "Transaction log is closed"),
            GraphiteError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for GraphiteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GraphiteError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for GraphiteError {
    fn from(e: io::Error) -> Self {
        GraphiteError::Io(e)
    }
}

/// Result type alias for Graphite operations
pub type Result<T> = std::result::Result<T, GraphiteError>;
