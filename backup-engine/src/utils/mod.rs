//! Utility modules for the backup engine.

pub mod calendar;
pub mod errors;
pub mod logger;

pub use errors::{BackupError, ErrorKind, Result, StorageError};
