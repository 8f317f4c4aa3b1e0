//! FTP storage over a `suppaftp` control connection.

use super::{open_upload, paths, BackendKind, Entry, StorageBackend, Transfer};
use crate::config::FtpConnection;
use crate::retention::policy::RetentionPolicy;
use crate::utils::errors::{ErrorKind, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::ToSocketAddrs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Status};

pub struct FtpBackend {
    name: String,
    root: String,
    retention: RetentionPolicy,
    stream: Arc<Mutex<Option<FtpStream>>>,
}

impl FtpBackend {
    pub async fn connect(
        name: &str,
        cfg: &FtpConnection,
        root: &str,
        retention: RetentionPolicy,
        connect_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let cfg = cfg.clone();
        let stream = tokio::task::spawn_blocking(move || open_stream(&cfg, connect_timeout))
            .await
            .map_err(|e| StorageError::new(ErrorKind::Fatal, "connect", name, e))??;

        Ok(Self {
            name: name.to_string(),
            root: root.trim_end_matches('/').to_string(),
            retention,
            stream: Arc::new(Mutex::new(Some(stream))),
        })
    }

    fn remote_path(&self, remote: &str) -> String {
        paths::join(&self.root, remote)
    }

    async fn with_stream<T, F>(&self, op: &'static str, remote: &str, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T, FtpError> + Send + 'static,
    {
        let stream = self.stream.clone();
        let path = remote.to_string();
        tokio::task::spawn_blocking(move || {
            let mut guard = stream
                .lock()
                .map_err(|_| StorageError::new(ErrorKind::Fatal, op, &path, "connection lock poisoned"))?;
            let ftp = guard
                .as_mut()
                .ok_or_else(|| StorageError::new(ErrorKind::Fatal, op, &path, "connection closed"))?;
            f(ftp).map_err(|e| map_error(op, &path, e))
        })
        .await
        .map_err(|e| StorageError::new(ErrorKind::Fatal, op, remote, e))?
    }
}

fn open_stream(cfg: &FtpConnection, connect_timeout: Duration) -> Result<FtpStream, StorageError> {
    let endpoint = format!("{}:{}", cfg.host, cfg.port);
    let addr = endpoint
        .to_socket_addrs()
        .map_err(|e| StorageError::from_io("connect", &endpoint, e))?
        .next()
        .ok_or_else(|| StorageError::new(ErrorKind::Fatal, "connect", &endpoint, "host did not resolve"))?;

    let map = |e: FtpError| map_error("connect", &endpoint, e);
    let mut ftp = FtpStream::connect_timeout(addr, connect_timeout).map_err(map)?;
    ftp.login(&cfg.user, &cfg.password).map_err(map)?;
    ftp.transfer_type(FileType::Binary).map_err(map)?;
    Ok(ftp)
}

fn map_error(op: &'static str, path: &str, err: FtpError) -> StorageError {
    let kind = match &err {
        FtpError::UnexpectedResponse(resp) => match resp.status {
            Status::FileUnavailable => ErrorKind::NotFound,
            Status::NotLoggedIn => ErrorKind::PermissionDenied,
            _ => ErrorKind::Transient,
        },
        FtpError::BadResponse | FtpError::InvalidAddress(_) => ErrorKind::Fatal,
        _ => ErrorKind::Transient,
    };
    StorageError::new(kind, op, path, err)
}

/// `mkdir -p`; already existing levels are answered with 550 and ignored.
fn create_dirs(ftp: &mut FtpStream, dir: &str) {
    let mut current = String::new();
    for part in dir.split('/').filter(|p| !p.is_empty()) {
        if !current.is_empty() || dir.starts_with('/') {
            current.push('/');
        }
        current.push_str(part);
        let _ = ftp.mkdir(&current);
    }
}

fn list_dir(ftp: &mut FtpStream, dir: &str) -> Result<Vec<suppaftp::list::File>, FtpError> {
    let lines = ftp.list(Some(dir))?;
    Ok(lines
        .iter()
        .filter_map(|line| suppaftp::list::File::from_str(line).ok())
        .filter(|f| f.name() != "." && f.name() != "..")
        .collect())
}

fn remove_tree(ftp: &mut FtpStream, path: &str) -> Result<(), FtpError> {
    if ftp.rm(path).is_ok() {
        return Ok(());
    }
    for child in list_dir(ftp, path)? {
        remove_tree(ftp, &paths::join(path, child.name()))?;
    }
    ftp.rmdir(path)
}

#[async_trait]
impl StorageBackend for FtpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Ftp
    }

    fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    async fn copy(&self, local: &Path, remote: &str, transfer: Transfer) -> Result<(), StorageError> {
        let source_path = local.to_path_buf();
        let dest = self.remote_path(remote);

        self.with_stream("copy", remote, move |ftp| {
            let mut source = match open_upload(&source_path) {
                Ok(file) => file,
                Err(e) => return Ok(Err(e)),
            };
            create_dirs(ftp, paths::parent(&dest));
            ftp.put_file(&dest, &mut source).map(|_| Ok(()))
        })
        .await??;

        if transfer == Transfer::Move {
            tokio::fs::remove_file(local)
                .await
                .map_err(|e| StorageError::from_io("copy", local.display().to_string(), e))?;
        }
        Ok(())
    }

    async fn link(&self, _physical: &str, link: &str) -> Result<(), StorageError> {
        Err(StorageError::unsupported("link", link))
    }

    async fn read(&self, remote: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.remote_path(remote);
        self.with_stream("read", remote, move |ftp| {
            ftp.retr_as_buffer(&path).map(|cursor| cursor.into_inner())
        })
        .await
    }

    async fn list(&self, dir: &str) -> Result<Vec<Entry>, StorageError> {
        let path = self.remote_path(dir);
        let files = self.with_stream("list", dir, move |ftp| list_dir(ftp, &path)).await?;

        let mut entries: Vec<Entry> = files
            .iter()
            .map(|f| Entry {
                name: f.name().to_string(),
                modified: DateTime::<Utc>::from(f.modified()),
                is_dir: f.is_directory(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn delete(&self, remote: &str) -> Result<(), StorageError> {
        let path = self.remote_path(remote);
        self.with_stream("delete", remote, move |ftp| remove_tree(ftp, &path))
            .await
    }

    async fn close(&self) -> Result<(), StorageError> {
        let stream = self.stream.clone();
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let taken = stream.lock().ok().and_then(|mut guard| guard.take());
            if let Some(mut ftp) = taken {
                ftp.quit().map_err(|e| map_error("close", &name, e))?;
            }
            Ok::<(), StorageError>(())
        })
        .await
        .map_err(|e| StorageError::new(ErrorKind::Fatal, "close", &self.name, e))?
    }
}
