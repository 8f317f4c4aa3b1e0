//! Delivery of produced artifacts to every storage backend.
//!
//! Backends are visited in delivery order (local last). Each backend gets a
//! placement plan: bucketed objects go to every bucket due today, with link
//! capable backends storing one physical copy and linking the rest;
//! incremental archives go to their month directory and replace the
//! generation metadata. On the final local backend the last use of each
//! temporary file is a move. Failures never stop the remaining placements,
//! except that generation metadata is only replaced once the archive itself
//! is stored on that backend.

use crate::executor::dumped::DumpedObject;
use crate::layout::{self, Layout};
use crate::storage::{paths, StorageBackend, Transfer};
use crate::utils::errors::{BackupError, ErrorKind, StorageError};
use chrono::{Datelike, NaiveDate};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Copy,
    Move,
    /// Point at an already placed physical copy
    Link { physical: String },
}

/// One local file to place at one remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub local: PathBuf,
    pub remote: String,
    pub action: Action,
    /// Replaces a generation metadata file
    pub metadata: bool,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Placements for `object` on `backend`, in execution order.
pub fn plan(object: &DumpedObject, backend: &dyn StorageBackend, final_local: bool, today: NaiveDate) -> Vec<Placement> {
    let mut copies = Vec::new();
    let mut links = Vec::new();

    match object.layout {
        Layout::Bucketed => {
            let name = file_name(&object.artifact);
            let mut first: Option<String> = None;
            for bucket in backend.retention().due_buckets(today) {
                let remote = paths::join(&layout::bucket_dir(&object.object_key, bucket), &name);
                let link_to = if backend.supports_links() { first.clone() } else { None };
                match link_to {
                    Some(physical) => links.push(Placement {
                        local: object.artifact.clone(),
                        remote,
                        action: Action::Link { physical },
                        metadata: false,
                    }),
                    None => {
                        if first.is_none() {
                            first = Some(remote.clone());
                        }
                        copies.push(Placement {
                            local: object.artifact.clone(),
                            remote,
                            action: Action::Copy,
                            metadata: false,
                        });
                    }
                }
            }
        }
        Layout::Generational => {
            let month_dir = layout::month_dir(&object.object_key, today.year(), today.month());
            for local in object.local_files() {
                copies.push(Placement {
                    local: local.to_path_buf(),
                    remote: paths::join(&month_dir, &file_name(local)),
                    action: Action::Copy,
                    metadata: false,
                });
            }
            if let Some(sidecar) = &object.sidecar {
                for generation in &object.generations {
                    copies.push(Placement {
                        local: sidecar.clone(),
                        remote: layout::meta_file(&object.object_key, today.year(), *generation),
                        action: Action::Copy,
                        metadata: true,
                    });
                }
            }
        }
    }

    if final_local {
        // The last physical use of each temporary file can consume it
        for local in object.local_files() {
            if let Some(last) = copies.iter_mut().rev().find(|p| p.local == local) {
                last.action = Action::Move;
            }
        }
        // Links (and their copy fallbacks) must run while the files still exist
        links.extend(copies);
        links
    } else {
        copies.extend(links);
        copies
    }
}

/// Deliver `object` to every backend, returning all failures.
pub async fn deliver(object: &DumpedObject, backends: &[Arc<dyn StorageBackend>], today: NaiveDate) -> Vec<BackupError> {
    let mut errors = Vec::new();

    for (idx, backend) in backends.iter().enumerate() {
        let final_local = idx + 1 == backends.len() && backend.is_local();
        let placements = plan(object, backend.as_ref(), final_local, today);
        if placements.is_empty() {
            tracing::debug!(
                storage = %backend.name(),
                object_key = %object.object_key,
                "No bucket due today"
            );
            continue;
        }

        let mut archive_failed = false;
        let mut held_back: Option<&str> = None;

        for placement in &placements {
            if placement.metadata && archive_failed {
                held_back.get_or_insert(&placement.remote);
                continue;
            }
            if let Err(e) = place(backend.as_ref(), placement).await {
                archive_failed |= !placement.metadata;
                tracing::error!(
                    storage = %backend.name(),
                    object_key = %object.object_key,
                    remote = %placement.remote,
                    error = %e,
                    "Delivery failed"
                );
                errors.push(BackupError::Delivery {
                    object_key: object.object_key.clone(),
                    backend: backend.name().to_string(),
                    source: e,
                });
            }
        }

        if let Some(remote) = held_back {
            tracing::warn!(
                storage = %backend.name(),
                object_key = %object.object_key,
                "Archive not stored, generation metadata left unchanged"
            );
            errors.push(BackupError::Delivery {
                object_key: object.object_key.clone(),
                backend: backend.name().to_string(),
                source: StorageError::new(
                    ErrorKind::Fatal,
                    "copy",
                    remote,
                    "archive was not stored, generation metadata left unchanged",
                ),
            });
            continue;
        }

        tracing::info!(
            storage = %backend.name(),
            object_key = %object.object_key,
            placements = placements.len(),
            "Object delivered"
        );
    }

    errors
}

async fn place(backend: &dyn StorageBackend, placement: &Placement) -> Result<(), StorageError> {
    match &placement.action {
        Action::Copy => backend.copy(&placement.local, &placement.remote, Transfer::Copy).await,
        Action::Move => backend.copy(&placement.local, &placement.remote, Transfer::Move).await,
        Action::Link { physical } => match backend.link(physical, &placement.remote).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    storage = %backend.name(),
                    link = %placement.remote,
                    error = %e,
                    "Link failed, storing an independent copy"
                );
                backend.copy(&placement.local, &placement.remote, Transfer::Copy).await
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConnection;
    use crate::retention::{self, policy::RetentionPolicy};
    use crate::snapshot::Generation;
    use crate::storage::filesystem::FsBackend;
    use crate::storage::{BackendKind, Entry};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn all_buckets() -> RetentionPolicy {
        RetentionPolicy { days: 7, weeks: 4, months: 6 }
    }

    fn local(dir: &TempDir, retention: RetentionPolicy) -> Arc<dyn StorageBackend> {
        Arc::new(FsBackend::local("local", &dir.path().to_string_lossy(), retention))
    }

    async fn nfs(dir: &TempDir, retention: RetentionPolicy) -> Arc<dyn StorageBackend> {
        let mount = MountConnection {
            mount_point: dir.path().to_path_buf(),
        };
        Arc::new(
            FsBackend::mounted("nas", BackendKind::Nfs, &mount, "share", retention, Duration::from_secs(5))
                .await
                .unwrap(),
        )
    }

    fn artifact(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("db_2026-03-01_02-00-00.sql.gz");
        fs::write(&path, b"dump").unwrap();
        path
    }

    #[tokio::test]
    async fn test_links_only_on_capable_backends() {
        let tmp = TempDir::new().unwrap();
        let nas_dir = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        let object = DumpedObject::bucketed("db", artifact(&tmp));

        // 2026-03-01 is a Sunday and a month anchor: all three buckets are due
        let nas = nfs(&nas_dir, all_buckets()).await;
        let nas_plan = plan(&object, nas.as_ref(), false, date(2026, 3, 1));
        assert_eq!(nas_plan.len(), 3);
        assert!(nas_plan.iter().all(|p| p.action == Action::Copy));

        let local_backend = local(&local_dir, all_buckets());
        let local_plan = plan(&object, local_backend.as_ref(), true, date(2026, 3, 1));
        let actions: Vec<_> = local_plan.iter().map(|p| p.action.clone()).collect();
        // The monthly copy is kept longest, so it is the physical one
        let physical = "db/monthly/db_2026-03-01_02-00-00.sql.gz".to_string();
        assert_eq!(
            actions,
            vec![
                Action::Link { physical: physical.clone() },
                Action::Link { physical: physical.clone() },
                Action::Move,
            ]
        );
        assert_eq!(local_plan[0].remote, "db/weekly/db_2026-03-01_02-00-00.sql.gz");
        assert_eq!(local_plan[1].remote, "db/daily/db_2026-03-01_02-00-00.sql.gz");
        assert_eq!(local_plan[2].remote, physical);
    }

    #[tokio::test]
    async fn test_local_last_moves_artifact() {
        let tmp = TempDir::new().unwrap();
        let nas_dir = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        let path = artifact(&tmp);
        let object = DumpedObject::bucketed("db", path.clone());

        let backends = vec![nfs(&nas_dir, all_buckets()).await, local(&local_dir, all_buckets())];
        let errors = deliver(&object, &backends, date(2026, 3, 1)).await;
        assert!(errors.is_empty(), "{:?}", errors);
        assert!(!path.exists());

        for bucket in ["daily", "weekly", "monthly"] {
            let stored = nas_dir.path().join("share/db").join(bucket).join(file_name(&path));
            assert_eq!(fs::read(&stored).unwrap(), b"dump");
            let linked = local_dir.path().join("db").join(bucket).join(file_name(&path));
            assert_eq!(fs::read(&linked).unwrap(), b"dump");
        }
        for bucket in ["daily", "weekly"] {
            let linked = local_dir.path().join("db").join(bucket).join(file_name(&path));
            assert!(fs::symlink_metadata(&linked).unwrap().file_type().is_symlink());
        }
        let monthly = local_dir.path().join("db/monthly").join(file_name(&path));
        assert!(fs::symlink_metadata(&monthly).unwrap().is_file());
    }

    #[tokio::test]
    async fn test_daily_expiry_keeps_longer_copies_readable() {
        let tmp = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        let path = artifact(&tmp);
        let name = file_name(&path);
        let object = DumpedObject::bucketed("db", path);

        let backend = local(&local_dir, all_buckets());
        let errors = deliver(&object, std::slice::from_ref(&backend), date(2026, 3, 1)).await;
        assert!(errors.is_empty(), "{:?}", errors);

        // Stored copies carry today's mtime; one day past the daily period
        let now = Utc::now() + chrono::Duration::days(8);
        let errors = retention::sweep_bucketed(backend.as_ref(), "db", now).await;
        assert!(errors.is_empty(), "{:?}", errors);

        assert!(fs::symlink_metadata(local_dir.path().join("db/daily").join(&name)).is_err());
        for bucket in ["weekly", "monthly"] {
            let stored = backend.read(&format!("db/{}/{}", bucket, name)).await.unwrap();
            assert_eq!(stored, b"dump");
        }
    }

    /// A local backend whose links always fail.
    struct NoLinks(FsBackend);

    #[async_trait]
    impl StorageBackend for NoLinks {
        fn name(&self) -> &str {
            self.0.name()
        }

        fn kind(&self) -> BackendKind {
            self.0.kind()
        }

        fn retention(&self) -> &RetentionPolicy {
            self.0.retention()
        }

        async fn copy(&self, local: &Path, remote: &str, transfer: Transfer) -> Result<(), StorageError> {
            self.0.copy(local, remote, transfer).await
        }

        async fn link(&self, _physical: &str, link: &str) -> Result<(), StorageError> {
            Err(StorageError::new(ErrorKind::PermissionDenied, "link", link, "links not permitted"))
        }

        async fn read(&self, remote: &str) -> Result<Vec<u8>, StorageError> {
            self.0.read(remote).await
        }

        async fn list(&self, dir: &str) -> Result<Vec<Entry>, StorageError> {
            self.0.list(dir).await
        }

        async fn delete(&self, remote: &str) -> Result<(), StorageError> {
            self.0.delete(remote).await
        }

        async fn close(&self) -> Result<(), StorageError> {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn test_failed_link_falls_back_to_copy() {
        let tmp = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        let path = artifact(&tmp);
        let object = DumpedObject::bucketed("db", path.clone());

        let backend: Arc<dyn StorageBackend> = Arc::new(NoLinks(FsBackend::local(
            "local",
            &local_dir.path().to_string_lossy(),
            all_buckets(),
        )));
        let errors = deliver(&object, &[backend], date(2026, 3, 1)).await;
        assert!(errors.is_empty(), "{:?}", errors);
        assert!(!path.exists());

        for bucket in ["daily", "weekly", "monthly"] {
            let stored = local_dir.path().join("db").join(bucket).join(file_name(&path));
            assert!(fs::symlink_metadata(&stored).unwrap().is_file(), "{}", bucket);
            assert_eq!(fs::read(&stored).unwrap(), b"dump");
        }
    }

    #[tokio::test]
    async fn test_without_local_artifact_remains() {
        let tmp = TempDir::new().unwrap();
        let nas_dir = TempDir::new().unwrap();
        let path = artifact(&tmp);
        let object = DumpedObject::bucketed("db", path.clone());

        let backends = vec![nfs(&nas_dir, all_buckets()).await];
        let errors = deliver(&object, &backends, date(2026, 3, 2)).await;
        assert!(errors.is_empty());
        assert!(path.exists());
        assert!(nas_dir.path().join("share/db/daily").join(file_name(&path)).exists());
        assert!(!nas_dir.path().join("share/db/weekly").exists());
    }

    #[tokio::test]
    async fn test_generational_placements() {
        let tmp = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        let artifact = tmp.path().join("svc_s.tar.gz");
        let sidecar = tmp.path().join("svc_s.inc");
        let marker = tmp.path().join("svc_s.init");
        fs::write(&artifact, b"tar").unwrap();
        fs::write(&sidecar, b"{}").unwrap();
        fs::write(&marker, b"").unwrap();

        let object = DumpedObject {
            object_key: "svc".into(),
            layout: Layout::Generational,
            artifact: artifact.clone(),
            sidecar: Some(sidecar.clone()),
            init_marker: Some(marker.clone()),
            generations: vec![Generation::Year, Generation::Month, Generation::Day],
            delivered: false,
        };

        let backends = vec![local(&local_dir, RetentionPolicy { days: 0, weeks: 0, months: 3 })];
        let errors = deliver(&object, &backends, date(2026, 1, 1)).await;
        assert!(errors.is_empty());

        let root = local_dir.path().join("svc/2026");
        assert!(root.join("month_01/svc_s.tar.gz").exists());
        assert!(root.join("month_01/svc_s.inc").exists());
        assert!(root.join("month_01/svc_s.init").exists());
        for meta in ["year.inc", "month.inc", "day.inc"] {
            assert_eq!(fs::read(root.join("inc_meta_info").join(meta)).unwrap(), b"{}");
        }
        assert!(!artifact.exists());
        assert!(!sidecar.exists());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_failed_archive_leaves_generation_metadata() {
        let tmp = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        let artifact = tmp.path().join("svc_s.tar.gz");
        let sidecar = tmp.path().join("svc_s.inc");
        fs::write(&artifact, b"tar").unwrap();
        fs::write(&sidecar, b"{\"new\": 1}").unwrap();

        let root = local_dir.path().join("svc/2026");
        fs::create_dir_all(root.join("inc_meta_info")).unwrap();
        fs::write(root.join("inc_meta_info/day.inc"), b"{}").unwrap();
        // A file where the month directory should be
        fs::write(root.join("month_01"), b"in the way").unwrap();

        let object = DumpedObject {
            object_key: "svc".into(),
            layout: Layout::Generational,
            artifact,
            sidecar: Some(sidecar),
            init_marker: None,
            generations: vec![Generation::Month, Generation::Day],
            delivered: false,
        };

        let backends = vec![local(&local_dir, RetentionPolicy { days: 0, weeks: 0, months: 3 })];
        let errors = deliver(&object, &backends, date(2026, 1, 1)).await;
        assert!(!errors.is_empty());
        assert!(errors.iter().all(|e| matches!(e, BackupError::Delivery { backend, .. } if backend == "local")));

        assert_eq!(fs::read(root.join("inc_meta_info/day.inc")).unwrap(), b"{}");
        assert!(!root.join("inc_meta_info/month.inc").exists());
    }

    #[tokio::test]
    async fn test_remote_failure_does_not_block_local() {
        let tmp = TempDir::new().unwrap();
        let nas_dir = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        let path = artifact(&tmp);
        let object = DumpedObject::bucketed("db", path.clone());

        let nas = nfs(&nas_dir, all_buckets()).await;
        // A file where the bucket directory should be makes every copy fail
        fs::create_dir_all(nas_dir.path().join("share")).unwrap();
        fs::write(nas_dir.path().join("share/db"), b"in the way").unwrap();

        let backends = vec![nas, local(&local_dir, all_buckets())];
        let errors = deliver(&object, &backends, date(2026, 3, 2)).await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], BackupError::Delivery { backend, .. } if backend == "nas"));
        assert!(local_dir.path().join("db/daily").join(file_name(&path)).exists());
    }
}
