//! Filesystem-backed storage: the local disk and mounted SMB/NFS shares.

use super::{paths, BackendKind, Entry, StorageBackend, Transfer};
use crate::config::MountConnection;
use crate::retention::policy::RetentionPolicy;
use crate::utils::errors::{ErrorKind, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct FsBackend {
    name: String,
    kind: BackendKind,
    root: PathBuf,
    retention: RetentionPolicy,
}

impl FsBackend {
    pub fn local(name: &str, root: &str, retention: RetentionPolicy) -> Self {
        Self {
            name: name.to_string(),
            kind: BackendKind::Local,
            root: PathBuf::from(root),
            retention,
        }
    }

    /// Backend rooted inside a mounted network share.
    ///
    /// The mount point must answer within `connect_timeout`; a hung NFS or
    /// CIFS mount otherwise blocks every later call.
    pub async fn mounted(
        name: &str,
        kind: BackendKind,
        mount: &MountConnection,
        root: &str,
        retention: RetentionPolicy,
        connect_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let mount_point = mount.mount_point.clone();
        let display = mount_point.display().to_string();

        let meta = tokio::time::timeout(connect_timeout, tokio::fs::metadata(&mount_point))
            .await
            .map_err(|_| {
                StorageError::new(ErrorKind::Transient, "connect", &display, "mount point timed out")
            })?
            .map_err(|e| StorageError::from_io("connect", &display, e))?;

        if !meta.is_dir() {
            return Err(StorageError::new(
                ErrorKind::Fatal,
                "connect",
                display,
                "mount point is not a directory",
            ));
        }

        Ok(Self {
            name: name.to_string(),
            kind,
            root: mount_point.join(root.trim_start_matches('/')),
            retention,
        })
    }

    fn resolve(&self, remote: &str) -> PathBuf {
        let remote = remote.trim_start_matches('/');
        if remote.is_empty() {
            self.root.clone()
        } else {
            self.root.join(remote)
        }
    }

    async fn prepare_destination(&self, dest: &Path, remote: &str, op: &'static str) -> Result<(), StorageError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(op, remote, e))?;
        }
        // Never write through a link left at the destination
        if let Ok(meta) = tokio::fs::symlink_metadata(dest).await {
            if meta.file_type().is_symlink() {
                tokio::fs::remove_file(dest)
                    .await
                    .map_err(|e| StorageError::from_io(op, remote, e))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    async fn copy(&self, local: &Path, remote: &str, transfer: Transfer) -> Result<(), StorageError> {
        let dest = self.resolve(remote);
        self.prepare_destination(&dest, remote, "copy").await?;

        if transfer == Transfer::Move {
            match tokio::fs::rename(local, &dest).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // Crossing filesystems: fall back to copy + remove
                    tracing::debug!(
                        storage = %self.name,
                        error = %e,
                        "Rename failed, copying instead"
                    );
                }
            }
        }

        tokio::fs::copy(local, &dest)
            .await
            .map_err(|e| StorageError::from_io("copy", remote, e))?;

        if transfer == Transfer::Move {
            tokio::fs::remove_file(local)
                .await
                .map_err(|e| StorageError::from_io("copy", local.display().to_string(), e))?;
        }
        Ok(())
    }

    async fn link(&self, physical: &str, link: &str) -> Result<(), StorageError> {
        let target = paths::relative_link(link, physical).ok_or_else(|| {
            StorageError::new(ErrorKind::Fatal, "link", link, "no relative path to the stored copy")
        })?;
        let dest = self.resolve(link);
        self.prepare_destination(&dest, link, "link").await?;

        tokio::fs::symlink(&target, &dest)
            .await
            .map_err(|e| StorageError::from_io("link", link, e))
    }

    async fn read(&self, remote: &str) -> Result<Vec<u8>, StorageError> {
        tokio::fs::read(self.resolve(remote))
            .await
            .map_err(|e| StorageError::from_io("read", remote, e))
    }

    async fn list(&self, dir: &str) -> Result<Vec<Entry>, StorageError> {
        let map = |e: io::Error| StorageError::from_io("list", dir, e);
        let mut reader = tokio::fs::read_dir(self.resolve(dir)).await.map_err(map)?;

        let mut entries = Vec::new();
        while let Some(item) = reader.next_entry().await.map_err(map)? {
            let meta = tokio::fs::symlink_metadata(item.path()).await.map_err(map)?;
            let modified = meta.modified().map_err(map)?;
            entries.push(Entry {
                name: item.file_name().to_string_lossy().into_owned(),
                modified: DateTime::<Utc>::from(modified),
                is_dir: meta.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn delete(&self, remote: &str) -> Result<(), StorageError> {
        let path = self.resolve(remote);
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| StorageError::from_io("delete", remote, e))?;

        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        result.map_err(|e| StorageError::from_io("delete", remote, e))
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
