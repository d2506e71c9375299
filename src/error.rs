//! Errors that cross the reader boundary.

use std::path::Path;

use thiserror::Error;

use crate::data::model::ConstructionError;

/// The only two ways a reader may fail; every other problem is folded into
/// diagnostic metadata on the returned tree.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The file does not carry the signature this reader expects.
    #[error("{path}: not a recognized {format} file: {reason}")]
    NotRecognizedFormat {
        path: String,
        format: &'static str,
        reason: String,
    },

    /// The format was recognized but an internal consistency check failed.
    #[error("{path}: malformed structure: {reason}")]
    MalformedStructure { path: String, reason: String },
}

impl ReadError {
    pub fn not_recognized(path: &Path, format: &'static str, reason: impl Into<String>) -> Self {
        ReadError::NotRecognizedFormat {
            path: path.display().to_string(),
            format,
            reason: reason.into(),
        }
    }

    pub fn malformed(path: &Path, reason: impl Into<String>) -> Self {
        ReadError::MalformedStructure {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Node assembly failed inside a reader: the file produced a shape the
    /// tree cannot hold.
    pub fn from_construction(path: &Path, err: ConstructionError) -> Self {
        Self::malformed(path, err.to_string())
    }
}

/// Result type for reader operations
pub type ReadResult<T> = Result<T, ReadError>;
