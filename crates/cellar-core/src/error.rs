//! Error types for cellar operations
//!
//! Only two kinds of failure ever surface at the public boundary: invalid
//! arguments (a malformed key) and illegal states (programmer errors such as
//! editing an entry that is already under edit). Everything else, from
//! missing files to unreadable journals to failed deletes, degrades to an
//! absent result or is absorbed and reconciled on the next open.

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Keys must match this pattern; it is embedded in the invalid-key message.
pub const KEY_PATTERN: &str = "[a-z0-9_-]{1,120}";

/// Cellar error types with context for debugging
#[derive(Debug, Clone)]
pub enum CellarError {
    /// Key does not match `[a-z0-9_-]{1,120}`
    InvalidKey {
        /// The offending key, verbatim
        key: String,
    },

    /// An editor is already live for this entry
    EditInProgress {
        /// Key of the entry under edit
        key: String,
    },

    /// Attempted to remove an entry while an editor is live for it
    RemoveDuringEdit {
        /// Key of the entry under edit
        key: String,
    },

    /// Write/commit/abort on an editor that has already been committed or aborted
    StreamClosed,

    /// An editor's terminal call found it is no longer the entry's live writer
    ConcurrentEditors {
        /// Key of the contested entry
        key: String,
    },

    /// Operation invoked on the embedder's designated UI thread
    UiThreadAccess {
        /// The operation that was attempted
        operation: &'static str,
    },

    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: io::ErrorKind,
        /// Human-readable description
        message: String,
    },
}

impl fmt::Display for CellarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellarError::InvalidKey { key } => {
                write!(f, "keys must match regex {}: \"{}\"", KEY_PATTERN, key)
            }

            CellarError::EditInProgress { key } => {
                write!(f, "trying to edit entry \"{}\" while another edit is in progress", key)
            }

            CellarError::RemoveDuringEdit { key } => {
                write!(f, "trying to remove entry \"{}\" while it is still under edit", key)
            }

            CellarError::StreamClosed => {
                write!(f, "trying to operate on an editor that is already committed or aborted")
            }

            CellarError::ConcurrentEditors { key } => {
                write!(f, "two editors trying to write to the cached file for \"{}\"", key)
            }

            CellarError::UiThreadAccess { operation } => {
                write!(f, "{} can't be run on the UI thread", operation)
            }

            CellarError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }
        }
    }
}

impl Error for CellarError {}

impl From<io::Error> for CellarError {
    fn from(err: io::Error) -> Self {
        CellarError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for cellar operations
pub type CellarResult<T> = Result<T, CellarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_key_display() {
        let err = CellarError::InvalidKey { key: "Has Space".to_string() };
        let display = format!("{}", err);
        assert!(display.contains("[a-z0-9_-]{1,120}"));
        assert!(display.contains("\"Has Space\""));
    }

    #[test]
    fn test_edit_in_progress_display() {
        let err = CellarError::EditInProgress { key: "k1".to_string() };
        assert!(format!("{}", err).contains("another edit is in progress"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: CellarError = io_err.into();

        match err {
            CellarError::Io { kind, .. } => assert_eq!(kind, io::ErrorKind::NotFound),
            _ => panic!("Expected Io error"),
        }
    }
}
