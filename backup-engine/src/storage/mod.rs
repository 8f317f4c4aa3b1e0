//! Storage backends.
//!
//! Every destination a job delivers to implements [`StorageBackend`]. Paths
//! passed to a backend are `/`-separated and relative to the backend root
//! (the job's `backup_path` on that storage).

pub mod filesystem;
pub mod ftp;
pub mod paths;
pub mod s3;
pub mod sftp;
pub mod webdav;

use crate::config::{StorageConnection, LOCAL_STORAGE};
use crate::retention::policy::RetentionPolicy;
use crate::utils::errors::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Protocol behind a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    S3,
    Sftp,
    Ftp,
    Smb,
    Nfs,
    WebDav,
}

impl BackendKind {
    /// Whether bucket duplicates can be stored as links to one physical copy.
    pub fn supports_links(self) -> bool {
        matches!(
            self,
            BackendKind::Local | BackendKind::Sftp | BackendKind::Smb | BackendKind::WebDav
        )
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Local => "local",
            BackendKind::S3 => "s3",
            BackendKind::Sftp => "sftp",
            BackendKind::Ftp => "ftp",
            BackendKind::Smb => "smb",
            BackendKind::Nfs => "nfs",
            BackendKind::WebDav => "webdav",
        };
        f.write_str(s)
    }
}

/// Whether the local source survives a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Copy,
    Move,
}

/// One listed child of a remote directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
}

pub type EntryFilter<'a> = &'a (dyn Fn(&Entry) -> bool + Send + Sync);

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Configured storage name, used in logs and error reports.
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    fn retention(&self) -> &RetentionPolicy;

    fn is_local(&self) -> bool {
        self.kind() == BackendKind::Local
    }

    fn supports_links(&self) -> bool {
        self.kind().supports_links()
    }

    /// Store a local file at `remote`, creating parent directories.
    async fn copy(&self, local: &Path, remote: &str, transfer: Transfer) -> Result<(), StorageError>;

    /// Make `link` resolve to the already stored `physical` object.
    async fn link(&self, physical: &str, link: &str) -> Result<(), StorageError>;

    async fn read(&self, remote: &str) -> Result<Vec<u8>, StorageError>;

    /// Immediate children of `dir`.
    async fn list(&self, dir: &str) -> Result<Vec<Entry>, StorageError>;

    /// Remove a file or a whole directory tree.
    async fn delete(&self, remote: &str) -> Result<(), StorageError>;

    /// Delete every child of `dir` accepted by `filter`.
    ///
    /// A failed listing is returned as the error; failures of individual
    /// deletions are collected and every candidate is attempted.
    async fn delete_matching(
        &self,
        dir: &str,
        filter: EntryFilter<'_>,
    ) -> Result<Vec<StorageError>, StorageError> {
        let entries = self.list(dir).await?;
        let mut failures = Vec::new();
        for entry in entries.iter().filter(|e| filter(e)) {
            let path = paths::join(dir, &entry.name);
            tracing::debug!(backend = %self.name(), path = %path, "Deleting expired entry");
            if let Err(e) = self.delete(&path).await {
                failures.push(e);
            }
        }
        Ok(failures)
    }

    async fn close(&self) -> Result<(), StorageError>;
}

/// Open the backend a job storage entry refers to.
///
/// `connection` is `None` for the reserved `local` storage.
pub async fn connect(
    name: &str,
    connection: Option<&StorageConnection>,
    root: &str,
    retention: RetentionPolicy,
    connect_timeout: Duration,
) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let backend: Arc<dyn StorageBackend> = match connection {
        None => Arc::new(filesystem::FsBackend::local(name, root, retention)),
        Some(StorageConnection::Smb(mount)) => Arc::new(
            filesystem::FsBackend::mounted(name, BackendKind::Smb, mount, root, retention, connect_timeout)
                .await?,
        ),
        Some(StorageConnection::Nfs(mount)) => Arc::new(
            filesystem::FsBackend::mounted(name, BackendKind::Nfs, mount, root, retention, connect_timeout)
                .await?,
        ),
        Some(StorageConnection::S3(cfg)) => {
            Arc::new(s3::S3Backend::connect(name, cfg, root, retention, connect_timeout).await?)
        }
        Some(StorageConnection::Sftp(cfg)) => {
            Arc::new(sftp::SftpBackend::connect(name, cfg, root, retention, connect_timeout).await?)
        }
        Some(StorageConnection::Ftp(cfg)) => {
            Arc::new(ftp::FtpBackend::connect(name, cfg, root, retention, connect_timeout).await?)
        }
        Some(StorageConnection::Webdav(cfg)) => {
            Arc::new(webdav::WebDavBackend::connect(name, cfg, root, retention, connect_timeout).await?)
        }
    };

    tracing::info!(
        storage = %name,
        kind = %backend.kind(),
        root = %root,
        "Storage connected"
    );
    Ok(backend)
}

/// Delivery order: remote backends first, local ones last so the final hop
/// can move the artifact instead of copying it.
pub fn order_for_delivery(backends: &mut [Arc<dyn StorageBackend>]) {
    backends.sort_by_key(|b| b.is_local());
}

pub fn is_local_name(name: &str) -> bool {
    name == LOCAL_STORAGE
}

/// Open `local` for an upload. Blocking; call it from the transfer thread.
pub(crate) fn open_upload(local: &Path) -> Result<std::fs::File, StorageError> {
    std::fs::File::open(local).map_err(|e| StorageError::from_io("copy", local.display().to_string(), e))
}
