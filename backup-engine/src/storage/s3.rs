//! S3 and S3-compatible object storage through `object_store`.
//!
//! Object stores have no directories: a "directory" is a key prefix, listed
//! with a `/` delimiter. Deleting a prefix streams the matching keys into a
//! channel that feeds the store's batched delete.

use super::{paths, BackendKind, Entry, EntryFilter, StorageBackend, Transfer};
use crate::config::S3Connection;
use crate::retention::policy::RetentionPolicy;
use crate::utils::errors::{ErrorKind, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Keys buffered between the lister and the batched delete.
const DELETE_QUEUE: usize = 1000;

pub struct S3Backend {
    name: String,
    root: String,
    retention: RetentionPolicy,
    store: Arc<dyn ObjectStore>,
}

impl S3Backend {
    pub async fn connect(
        name: &str,
        cfg: &S3Connection,
        root: &str,
        retention: RetentionPolicy,
        connect_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&cfg.bucket)
            .with_region(&cfg.region)
            .with_client_options(ClientOptions::new().with_connect_timeout(connect_timeout));

        if let Some(endpoint) = &cfg.endpoint {
            // Path-style requests for MinIO and friends
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if let Some(key) = &cfg.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &cfg.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::new(ErrorKind::Fatal, "connect", &cfg.bucket, e))?;

        let backend = Self {
            name: name.to_string(),
            root: root.trim_matches('/').to_string(),
            retention,
            store: Arc::new(store),
        };

        let root_prefix = backend.key("");
        tokio::time::timeout(connect_timeout, backend.store.list_with_delimiter(Some(&root_prefix)))
            .await
            .map_err(|_| StorageError::new(ErrorKind::Transient, "connect", &cfg.bucket, "connection timed out"))?
            .map_err(|e| map_error("connect", &cfg.bucket, e))?;

        Ok(backend)
    }

    fn key(&self, remote: &str) -> ObjectPath {
        object_path(&self.root, remote)
    }

    /// Stream every key under `prefixes` (and the exact `objects`) into the
    /// batched delete, returning how many were removed and what failed.
    async fn delete_pipeline(
        &self,
        objects: Vec<ObjectPath>,
        prefixes: Vec<ObjectPath>,
        op_path: &str,
    ) -> (usize, Vec<StorageError>) {
        let (tx, rx) = mpsc::channel::<ObjectPath>(DELETE_QUEUE);

        let producer = async move {
            let mut failures = Vec::new();
            for location in objects {
                if tx.send(location).await.is_err() {
                    return failures;
                }
            }
            for prefix in prefixes {
                let mut listing = self.store.list(Some(&prefix));
                while let Some(item) = listing.next().await {
                    match item {
                        Ok(meta) => {
                            if tx.send(meta.location).await.is_err() {
                                return failures;
                            }
                        }
                        Err(e) => failures.push(map_error("list", prefix.as_ref(), e)),
                    }
                }
            }
            failures
        };

        let consumer = async {
            let locations = ReceiverStream::new(rx)
                .map(Ok::<ObjectPath, object_store::Error>)
                .boxed();
            let mut results = self.store.delete_stream(locations);
            let mut deleted = 0;
            let mut failures = Vec::new();
            while let Some(result) = results.next().await {
                match result {
                    Ok(_) => deleted += 1,
                    Err(e) => failures.push(map_error("delete", op_path, e)),
                }
            }
            (deleted, failures)
        };

        let (mut listing_failures, (deleted, delete_failures)) = tokio::join!(producer, consumer);
        listing_failures.extend(delete_failures);
        (deleted, listing_failures)
    }
}

pub(crate) fn object_path(root: &str, remote: &str) -> ObjectPath {
    ObjectPath::from(paths::join(root, remote.trim_matches('/')).as_str())
}

fn map_error(op: &'static str, path: &str, err: object_store::Error) -> StorageError {
    let kind = match &err {
        object_store::Error::NotFound { .. } => ErrorKind::NotFound,
        object_store::Error::NotSupported { .. }
        | object_store::Error::NotImplemented
        | object_store::Error::InvalidPath { .. } => ErrorKind::Fatal,
        _ => ErrorKind::Transient,
    };
    StorageError::new(kind, op, path, err)
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    async fn copy(&self, local: &Path, remote: &str, transfer: Transfer) -> Result<(), StorageError> {
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| StorageError::from_io("copy", local.display().to_string(), e))?;

        let mut writer = BufWriter::new(self.store.clone(), self.key(remote));
        tokio::io::copy(&mut file, &mut writer)
            .await
            .map_err(|e| StorageError::from_io("copy", remote, e))?;
        writer
            .shutdown()
            .await
            .map_err(|e| StorageError::from_io("copy", remote, e))?;

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
        let object = self
            .store
            .get(&self.key(remote))
            .await
            .map_err(|e| map_error("read", remote, e))?;
        let bytes = object.bytes().await.map_err(|e| map_error("read", remote, e))?;
        Ok(bytes.to_vec())
    }

    async fn list(&self, dir: &str) -> Result<Vec<Entry>, StorageError> {
        let listing = self
            .store
            .list_with_delimiter(Some(&self.key(dir)))
            .await
            .map_err(|e| map_error("list", dir, e))?;

        let mut entries: Vec<Entry> = listing
            .common_prefixes
            .iter()
            .filter_map(|prefix| {
                prefix.filename().map(|name| Entry {
                    name: name.to_string(),
                    // Prefixes carry no timestamp
                    modified: DateTime::<Utc>::UNIX_EPOCH,
                    is_dir: true,
                })
            })
            .collect();
        entries.extend(listing.objects.iter().filter_map(|meta| {
            meta.location.filename().map(|name| Entry {
                name: name.to_string(),
                modified: meta.last_modified,
                is_dir: false,
            })
        }));
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn delete(&self, remote: &str) -> Result<(), StorageError> {
        let key = self.key(remote);
        let (objects, prefixes) = match self.store.head(&key).await {
            Ok(_) => (vec![key], Vec::new()),
            Err(object_store::Error::NotFound { .. }) => (Vec::new(), vec![key]),
            Err(e) => return Err(map_error("delete", remote, e)),
        };

        let (deleted, mut failures) = self.delete_pipeline(objects, prefixes, remote).await;
        if !failures.is_empty() {
            return Err(failures.remove(0));
        }
        if deleted == 0 {
            return Err(StorageError::new(ErrorKind::NotFound, "delete", remote, "no such object or prefix"));
        }
        Ok(())
    }

    async fn delete_matching(
        &self,
        dir: &str,
        filter: EntryFilter<'_>,
    ) -> Result<Vec<StorageError>, StorageError> {
        let base = self.key(dir);
        let mut objects = Vec::new();
        let mut prefixes = Vec::new();
        for entry in self.list(dir).await?.iter().filter(|e| filter(e)) {
            let location = base.child(entry.name.as_str());
            if entry.is_dir {
                prefixes.push(location);
            } else {
                objects.push(location);
            }
        }
        if objects.is_empty() && prefixes.is_empty() {
            return Ok(Vec::new());
        }

        let (deleted, failures) = self.delete_pipeline(objects, prefixes, dir).await;
        tracing::debug!(storage = %self.name, dir = %dir, deleted, "Expired objects removed");
        Ok(failures)
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
