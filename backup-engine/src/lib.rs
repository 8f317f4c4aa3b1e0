//! Backup Engine Library
//!
//! Rotating multi-destination backups: file archives (full or GNU
//! incremental) and externally produced dumps are delivered to local and
//! remote storages and aged out per storage retention policy.

pub mod archive;
pub mod config;
pub mod context;
pub mod delivery;
pub mod executor;
pub mod fs;
pub mod layout;
pub mod retention;
pub mod snapshot;
pub mod storage;
pub mod targets;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use context::AppContext;
pub use executor::{Job, JobReport};
pub use utils::errors::{BackupError, ErrorKind, StorageError};
pub type Result<T> = std::result::Result<T, BackupError>;
