//! SFTP storage over an `ssh2` session.
//!
//! `ssh2` is blocking, so every call takes the session lock inside
//! `spawn_blocking`. The session is opened once and reused until `close`.

use super::{open_upload, paths, BackendKind, Entry, StorageBackend, Transfer};
use crate::config::SftpConnection;
use crate::retention::policy::RetentionPolicy;
use crate::utils::errors::{ErrorKind, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ssh2::{Session, Sftp};
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// SFTP status codes (draft-ietf-secsh-filexfer)
const SSH_FX_NO_SUCH_FILE: i32 = 2;
const SSH_FX_PERMISSION_DENIED: i32 = 3;

struct Connection {
    session: Session,
    sftp: Sftp,
}

pub struct SftpBackend {
    name: String,
    root: String,
    retention: RetentionPolicy,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SftpBackend {
    pub async fn connect(
        name: &str,
        cfg: &SftpConnection,
        root: &str,
        retention: RetentionPolicy,
        connect_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let cfg = cfg.clone();
        let conn = tokio::task::spawn_blocking(move || open_session(&cfg, connect_timeout))
            .await
            .map_err(|e| StorageError::new(ErrorKind::Fatal, "connect", name, e))??;

        Ok(Self {
            name: name.to_string(),
            root: root.trim_end_matches('/').to_string(),
            retention,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    fn remote_path(&self, remote: &str) -> PathBuf {
        PathBuf::from(paths::join(&self.root, remote))
    }

    /// Run `f` against the live SFTP channel on the blocking pool.
    async fn with_sftp<T, F>(&self, op: &'static str, remote: &str, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T, ssh2::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        let path = remote.to_string();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StorageError::new(ErrorKind::Fatal, op, &path, "session lock poisoned"))?;
            let conn = guard
                .as_ref()
                .ok_or_else(|| StorageError::new(ErrorKind::Fatal, op, &path, "session closed"))?;
            f(&conn.sftp).map_err(|e| map_error(op, &path, e))
        })
        .await
        .map_err(|e| StorageError::new(ErrorKind::Fatal, op, remote, e))?
    }
}

fn open_session(cfg: &SftpConnection, connect_timeout: Duration) -> Result<Connection, StorageError> {
    let endpoint = format!("{}:{}", cfg.host, cfg.port);
    let io_err = |e: io::Error| StorageError::from_io("connect", &endpoint, e);

    let addr = endpoint
        .to_socket_addrs()
        .map_err(io_err)?
        .next()
        .ok_or_else(|| StorageError::new(ErrorKind::Fatal, "connect", &endpoint, "host did not resolve"))?;
    let tcp = TcpStream::connect_timeout(&addr, connect_timeout).map_err(io_err)?;

    let ssh_err = |e: ssh2::Error| map_error("connect", &endpoint, e);
    let mut session = Session::new().map_err(ssh_err)?;
    session.set_tcp_stream(tcp);
    // Bound the handshake and auth only; transfers run without a timeout
    session.set_timeout(connect_timeout.as_millis().min(u128::from(u32::MAX)) as u32);
    session.handshake().map_err(ssh_err)?;

    match (&cfg.key_file, &cfg.password) {
        (Some(key), passphrase) => session
            .userauth_pubkey_file(&cfg.user, None, key, passphrase.as_deref())
            .map_err(ssh_err)?,
        (None, Some(password)) => session.userauth_password(&cfg.user, password).map_err(ssh_err)?,
        (None, None) => session.userauth_agent(&cfg.user).map_err(ssh_err)?,
    }
    if !session.authenticated() {
        return Err(StorageError::new(
            ErrorKind::PermissionDenied,
            "connect",
            &endpoint,
            "authentication rejected",
        ));
    }

    let sftp = session.sftp().map_err(ssh_err)?;
    session.set_timeout(0);
    Ok(Connection { session, sftp })
}

fn map_error(op: &'static str, path: &str, err: ssh2::Error) -> StorageError {
    let kind = match err.code() {
        ssh2::ErrorCode::SFTP(SSH_FX_NO_SUCH_FILE) => ErrorKind::NotFound,
        ssh2::ErrorCode::SFTP(SSH_FX_PERMISSION_DENIED) => ErrorKind::PermissionDenied,
        _ => ErrorKind::Transient,
    };
    StorageError::new(kind, op, path, err)
}

/// `mkdir -p` over SFTP.
fn create_dirs(sftp: &Sftp, dir: &Path) -> Result<(), ssh2::Error> {
    let mut current = PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if sftp.stat(&current).is_err() {
            sftp.mkdir(&current, 0o755)?;
        }
    }
    Ok(())
}

fn remove_tree(sftp: &Sftp, path: &Path) -> Result<(), ssh2::Error> {
    let stat = sftp.lstat(path)?;
    if !stat.is_dir() {
        return sftp.unlink(path);
    }
    for (child, _) in sftp.readdir(path)? {
        remove_tree(sftp, &child)?;
    }
    sftp.rmdir(path)
}

#[async_trait]
impl StorageBackend for SftpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Sftp
    }

    fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    async fn copy(&self, local: &Path, remote: &str, transfer: Transfer) -> Result<(), StorageError> {
        let source_path = local.to_path_buf();
        let remote_name = remote.to_string();
        let dest = self.remote_path(remote);

        let written = self
            .with_sftp("copy", remote, move |sftp| {
                let mut source = match open_upload(&source_path) {
                    Ok(file) => file,
                    Err(e) => return Ok(Err(e)),
                };
                if let Some(parent) = dest.parent() {
                    create_dirs(sftp, parent)?;
                }
                let mut file = sftp.create(&dest)?;
                Ok(io::copy(&mut source, &mut file).map_err(|e| StorageError::from_io("copy", remote_name, e)))
            })
            .await?;
        written?;

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
        let dest = self.remote_path(link);

        self.with_sftp("link", link, move |sftp| {
            if let Some(parent) = dest.parent() {
                create_dirs(sftp, parent)?;
            }
            // libssh2 takes (existing path, new link) in OpenSSH argument order
            sftp.symlink(Path::new(&target), &dest)
        })
        .await
    }

    async fn read(&self, remote: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.remote_path(remote);
        let data = self
            .with_sftp("read", remote, move |sftp| {
                let mut file = sftp.open(&path)?;
                let mut buf = Vec::new();
                Ok(file.read_to_end(&mut buf).map(|_| buf))
            })
            .await?;
        data.map_err(|e| StorageError::from_io("read", remote, e))
    }

    async fn list(&self, dir: &str) -> Result<Vec<Entry>, StorageError> {
        let path = self.remote_path(dir);
        let listing = self.with_sftp("list", dir, move |sftp| sftp.readdir(&path)).await?;

        let mut entries: Vec<Entry> = listing
            .into_iter()
            .filter_map(|(child, stat)| {
                let name = child.file_name()?.to_string_lossy().into_owned();
                let modified = stat
                    .mtime
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0))
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                Some(Entry {
                    name,
                    modified,
                    is_dir: stat.is_dir(),
                })
            })
            .filter(|e| e.name != "." && e.name != "..")
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn delete(&self, remote: &str) -> Result<(), StorageError> {
        let path = self.remote_path(remote);
        self.with_sftp("delete", remote, move |sftp| remove_tree(sftp, &path))
            .await
    }

    async fn close(&self) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let taken = conn.lock().ok().and_then(|mut guard| guard.take());
            if let Some(Connection { session, sftp }) = taken {
                drop(sftp);
                session
                    .disconnect(None, "backup finished", None)
                    .map_err(|e| map_error("close", &name, e))?;
            }
            Ok::<(), StorageError>(())
        })
        .await
        .map_err(|e| StorageError::new(ErrorKind::Fatal, "close", &self.name, e))?
    }
}
