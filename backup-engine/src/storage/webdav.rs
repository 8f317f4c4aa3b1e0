//! WebDAV storage over HTTP.
//!
//! Collections are created with `MKCOL`, listed with a depth-1 `PROPFIND`,
//! and bucket duplicates are made with a server-side `COPY` since WebDAV has
//! no symbolic links.

use super::{BackendKind, Entry, StorageBackend, Transfer};
use crate::config::WebDavConnection;
use crate::retention::policy::RetentionPolicy;
use crate::utils::errors::{ErrorKind, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Body, Client, Method, RequestBuilder, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use url::Url;

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:getlastmodified/><d:resourcetype/></d:prop></d:propfind>"#;

pub struct WebDavBackend {
    name: String,
    base: Url,
    root: String,
    user: Option<String>,
    password: Option<String>,
    retention: RetentionPolicy,
    client: Client,
}

impl WebDavBackend {
    pub async fn connect(
        name: &str,
        cfg: &WebDavConnection,
        root: &str,
        retention: RetentionPolicy,
        connect_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let base = Url::parse(&cfg.url)
            .map_err(|e| StorageError::new(ErrorKind::Fatal, "connect", &cfg.url, e))?;
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| StorageError::new(ErrorKind::Fatal, "connect", &cfg.url, e))?;

        let backend = Self {
            name: name.to_string(),
            base,
            root: root.trim_matches('/').to_string(),
            user: cfg.user.clone(),
            password: cfg.password.clone(),
            retention,
            client,
        };

        let check = backend
            .request(dav_method("PROPFIND")?, backend.base.clone())
            .header("Depth", "0")
            .send()
            .await
            .map_err(|e| transport_error("connect", &cfg.url, e))?;
        let status = check.status();
        if status.is_server_error() || status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(status_error("connect", &cfg.url, status));
        }

        Ok(backend)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.user {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    /// URL of `remote` below the root; collections get a trailing slash.
    fn url(&self, remote: &str, collection: bool) -> Url {
        resource_url(&self.base, &self.root, remote, collection)
    }

    /// `MKCOL` every missing ancestor collection of `remote`.
    async fn ensure_parents(&self, remote: &str, op: &'static str) -> Result<(), StorageError> {
        let full = join_segments(&self.root, remote);
        let segments: Vec<&str> = full.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 2 {
            return Ok(());
        }

        let mut url = self.base.clone();
        for depth in 1..segments.len() {
            url = collection_url(&self.base, &segments[..depth]);
            let resp = self
                .request(dav_method("MKCOL")?, url.clone())
                .send()
                .await
                .map_err(|e| transport_error(op, remote, e))?;
            let status = resp.status();
            // 405: the collection already exists
            if !status.is_success() && status != StatusCode::METHOD_NOT_ALLOWED {
                return Err(status_error(op, url.path(), status));
            }
        }
        tracing::trace!(storage = %self.name, collection = %url, "Collections ready");
        Ok(())
    }
}

/// A WebDAV extension method such as `PROPFIND`.
fn dav_method(name: &'static str) -> Result<Method, StorageError> {
    Method::from_bytes(name.as_bytes()).map_err(|e| StorageError::new(ErrorKind::Fatal, "request", name, e))
}

fn join_segments(root: &str, remote: &str) -> String {
    super::paths::join(root, remote.trim_matches('/'))
}

fn collection_url(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments).push("");
    }
    url
}

pub(crate) fn resource_url(base: &Url, root: &str, remote: &str, collection: bool) -> Url {
    let full = join_segments(root, remote);
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(full.split('/').filter(|s| !s.is_empty()));
        if collection {
            path.push("");
        }
    }
    url
}

fn transport_error(op: &'static str, path: &str, err: reqwest::Error) -> StorageError {
    let kind = if err.is_builder() {
        ErrorKind::Fatal
    } else {
        ErrorKind::Transient
    };
    StorageError::new(kind, op, path, err)
}

fn status_error(op: &'static str, path: &str, status: StatusCode) -> StorageError {
    let kind = match status {
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::PermissionDenied,
        s if s.is_server_error() => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    };
    StorageError::new(kind, op, path, format!("server answered {}", status))
}

fn decoded_path(href: &str) -> String {
    let path = match Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.to_string(),
    };
    percent_decode_str(path.trim_end_matches('/'))
        .decode_utf8_lossy()
        .into_owned()
}

#[derive(Default)]
struct PendingEntry {
    href: String,
    modified: Option<DateTime<Utc>>,
    is_dir: bool,
}

/// Children listed in a depth-1 `PROPFIND` multistatus answer for `dir_path`.
pub(crate) fn parse_multistatus(xml: &str, dir_path: &str) -> Result<Vec<Entry>, quick_xml::Error> {
    let own_path = decoded_path(dir_path);
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<PendingEntry> = None;
    let mut field: Option<&'static str> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"response" => current = Some(PendingEntry::default()),
                b"href" => field = Some("href"),
                b"getlastmodified" => field = Some("modified"),
                b"collection" => {
                    if let Some(entry) = current.as_mut() {
                        entry.is_dir = true;
                    }
                }
                _ => {}
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(entry) = current.as_mut() {
                        entry.is_dir = true;
                    }
                }
            }
            Event::Text(text) => {
                let value = text.unescape()?.into_owned();
                if let (Some(entry), Some(name)) = (current.as_mut(), field) {
                    match name {
                        "href" => entry.href = value,
                        _ => {
                            entry.modified = DateTime::parse_from_rfc2822(&value)
                                .ok()
                                .map(|dt| dt.with_timezone(&Utc));
                        }
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"href" | b"getlastmodified" => field = None,
                b"response" => {
                    if let Some(entry) = current.take() {
                        let path = decoded_path(&entry.href);
                        if path == own_path {
                            continue;
                        }
                        let name = path.rsplit('/').next().unwrap_or_default().to_string();
                        if !name.is_empty() {
                            entries.push(Entry {
                                name,
                                modified: entry.modified.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                                is_dir: entry.is_dir,
                            });
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[async_trait]
impl StorageBackend for WebDavBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::WebDav
    }

    fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    async fn copy(&self, local: &Path, remote: &str, transfer: Transfer) -> Result<(), StorageError> {
        let file = tokio::fs::File::open(local)
            .await
            .map_err(|e| StorageError::from_io("copy", local.display().to_string(), e))?;
        self.ensure_parents(remote, "copy").await?;

        let resp = self
            .request(Method::PUT, self.url(remote, false))
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|e| transport_error("copy", remote, e))?;
        if !resp.status().is_success() {
            return Err(status_error("copy", remote, resp.status()));
        }

        if transfer == Transfer::Move {
            tokio::fs::remove_file(local)
                .await
                .map_err(|e| StorageError::from_io("copy", local.display().to_string(), e))?;
        }
        Ok(())
    }

    async fn link(&self, physical: &str, link: &str) -> Result<(), StorageError> {
        self.ensure_parents(link, "link").await?;

        let resp = self
            .request(dav_method("COPY")?, self.url(physical, false))
            .header("Destination", self.url(link, false).as_str())
            .header("Overwrite", "T")
            .send()
            .await
            .map_err(|e| transport_error("link", link, e))?;
        if !resp.status().is_success() {
            return Err(status_error("link", link, resp.status()));
        }
        Ok(())
    }

    async fn read(&self, remote: &str) -> Result<Vec<u8>, StorageError> {
        let resp = self
            .request(Method::GET, self.url(remote, false))
            .send()
            .await
            .map_err(|e| transport_error("read", remote, e))?;
        if !resp.status().is_success() {
            return Err(status_error("read", remote, resp.status()));
        }
        let body = resp.bytes().await.map_err(|e| transport_error("read", remote, e))?;
        Ok(body.to_vec())
    }

    async fn list(&self, dir: &str) -> Result<Vec<Entry>, StorageError> {
        let url = self.url(dir, true);
        let resp = self
            .request(dav_method("PROPFIND")?, url.clone())
            .header("Depth", "1")
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(|e| transport_error("list", dir, e))?;
        if resp.status() != StatusCode::MULTI_STATUS {
            return Err(status_error("list", dir, resp.status()));
        }

        let text = resp.text().await.map_err(|e| transport_error("list", dir, e))?;
        parse_multistatus(&text, url.path())
            .map_err(|e| StorageError::new(ErrorKind::Fatal, "list", dir, e))
    }

    async fn delete(&self, remote: &str) -> Result<(), StorageError> {
        let resp = self
            .request(Method::DELETE, self.url(remote, false))
            .send()
            .await
            .map_err(|e| transport_error("delete", remote, e))?;
        if !resp.status().is_success() {
            return Err(status_error("delete", remote, resp.status()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
