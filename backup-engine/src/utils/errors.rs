//! Custom error types for the backup engine.

use std::fmt;
use std::io;
use thiserror::Error;

/// Coarse classification carried by every storage failure.
///
/// Callers branch on the kind instead of comparing error values: a
/// `NotFound` while listing a bucket is tolerated, a `NotFound` while probing
/// yearly metadata triggers a reinit, everything else is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Transient,
    Fatal,
}

impl ErrorKind {
    pub fn from_io(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData | io::ErrorKind::Unsupported => {
                ErrorKind::Fatal
            }
            _ => ErrorKind::Transient,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// A failed operation against a storage backend.
#[derive(Error, Debug)]
#[error("{op} '{path}' failed ({kind}): {source}")]
pub struct StorageError {
    pub kind: ErrorKind,
    pub op: &'static str,
    pub path: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl StorageError {
    pub fn new(
        kind: ErrorKind,
        op: &'static str,
        path: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            op,
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn from_io(op: &'static str, path: impl Into<String>, err: io::Error) -> Self {
        Self::new(ErrorKind::from_io(err.kind()), op, path, err)
    }

    pub fn unsupported(op: &'static str, path: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, op, path, "operation not supported by this backend")
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage '{backend}': {source}")]
    Storage {
        backend: String,
        #[source]
        source: StorageError,
    },

    #[error("Metadata error for '{object_key}': {message}")]
    Metadata { object_key: String, message: String },

    #[error("Archive error for '{object_key}': {source}")]
    Archive {
        object_key: String,
        #[source]
        source: io::Error,
    },

    #[error("Delivery of '{object_key}' to '{backend}' failed: {source}")]
    Delivery {
        object_key: String,
        backend: String,
        #[source]
        source: StorageError,
    },

    #[error("Retention sweep of '{object_key}' on '{backend}' failed: {source}")]
    Retention {
        object_key: String,
        backend: String,
        #[source]
        source: StorageError,
    },

    #[error("Dump of '{object_key}' failed: {message}")]
    Dump { object_key: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BackupError {
    pub fn metadata(object_key: &str, message: impl Into<String>) -> Self {
        BackupError::Metadata {
            object_key: object_key.to_string(),
            message: message.into(),
        }
    }

    pub fn archive(object_key: &str, source: io::Error) -> Self {
        BackupError::Archive {
            object_key: object_key.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_kind_mapping() {
        assert_eq!(ErrorKind::from_io(io::ErrorKind::NotFound), ErrorKind::NotFound);
        assert_eq!(
            ErrorKind::from_io(io::ErrorKind::PermissionDenied),
            ErrorKind::PermissionDenied
        );
        assert_eq!(ErrorKind::from_io(io::ErrorKind::TimedOut), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_io(io::ErrorKind::InvalidData), ErrorKind::Fatal);
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::from_io(
            "list",
            "svc/daily",
            io::Error::new(io::ErrorKind::NotFound, "no such directory"),
        );
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "list 'svc/daily' failed (not found): no such directory"
        );

        let wrapped = BackupError::Retention {
            object_key: "svc".into(),
            backend: "s3".into(),
            source: err,
        };
        assert!(wrapped.to_string().starts_with("Retention sweep of 'svc' on 's3' failed"));
    }
}
