//! Persistence error types.

use motif_core::WorkflowError;
use thiserror::Error;

/// Errors from import, export and snapshot restore.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("unsupported document format: expected '{expected}', found '{found}'")]
    UnsupportedFormat { expected: String, found: String },

    #[error("unsupported schema version: {0}")]
    UnsupportedVersion(u32),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("unknown step kind: {0}")]
    UnknownKind(String),

    #[error("{kind} edge '{from}' -> '{to}' is defined in code and cannot be exported")]
    NotSerializable {
        kind: String,
        from: String,
        to: String,
    },

    #[error("checksum mismatch: expected {expected}, actual {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("no recorded snapshot at index {0}")]
    NoSuchSnapshot(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

impl PersistError {
    /// Returns an error code suitable for reporting errors as data.
    pub fn error_code(&self) -> &'static str {
        match self {
            PersistError::UnsupportedFormat { .. } => "UNSUPPORTED_FORMAT",
            PersistError::UnsupportedVersion(_) => "UNSUPPORTED_VERSION",
            PersistError::UnknownNode(_) => "UNKNOWN_NODE",
            PersistError::UnknownKind(_) => "UNKNOWN_KIND",
            PersistError::NotSerializable { .. } => "NOT_SERIALIZABLE",
            PersistError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            PersistError::InvalidDocument(_) => "INVALID_DOCUMENT",
            PersistError::NoSuchSnapshot(_) => "NO_SUCH_SNAPSHOT",
            PersistError::Io(_) => "IO_ERROR",
            PersistError::Json(_) | PersistError::Yaml(_) => "PARSE_ERROR",
            PersistError::Workflow(e) => e.error_code(),
        }
    }
}
