//! Application context: the loaded configuration and the factory that turns
//! job configuration into runnable jobs.

use crate::config::{Config, JobConfig, JobType};
use crate::executor::{Job, JobKind, Source, Unit};
use crate::retention::policy::RetentionPolicy;
use crate::storage::{self, StorageBackend};
use crate::targets::{self, ExcludeSyntax};
use crate::utils::errors::{BackupError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub struct AppContext {
    pub config: Config,
}

impl AppContext {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeouts.connect_secs)
    }

    /// Resolve targets, validate retention and open every storage of `job`.
    ///
    /// Invalid patterns, retention values, storage references and colliding
    /// object keys fail the whole job. A storage that cannot be reached is
    /// left out and recorded in the job's `init_errors`, so the remaining
    /// storages still receive the backup.
    pub async fn build_job(&self, job: &JobConfig) -> Result<Job> {
        let (kind, syntax) = match job.job_type {
            JobType::DescFiles => (JobKind::DescFiles, ExcludeSyntax::Glob),
            JobType::IncFiles => (JobKind::IncFiles, ExcludeSyntax::Regex),
        };

        let mut sources = Vec::with_capacity(job.sources.len());
        for source in &job.sources {
            let units = targets::resolve(source, syntax)?
                .into_iter()
                .map(Unit::Target)
                .collect();
            sources.push(Source {
                name: source.name.clone(),
                units,
            });
        }
        targets::ensure_unique_keys(
            sources
                .iter()
                .flat_map(|s| s.units.iter().map(Unit::object_key)),
        )?;

        let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::with_capacity(job.storages.len());
        let mut init_errors = Vec::new();

        for entry in &job.storages {
            let retention = RetentionPolicy::new(
                entry.retention.days,
                entry.retention.weeks,
                entry.retention.months,
            )?;
            let connection = if storage::is_local_name(&entry.storage) {
                None
            } else {
                let storage = self.config.storage(&entry.storage).ok_or_else(|| {
                    BackupError::Config(format!(
                        "job '{}' refers to unknown storage '{}'",
                        job.name, entry.storage
                    ))
                })?;
                Some(&storage.connection)
            };

            match storage::connect(
                &entry.storage,
                connection,
                &entry.backup_path,
                retention,
                self.connect_timeout(),
            )
            .await
            {
                Ok(backend) => backends.push(backend),
                Err(e) => {
                    error!(job = %job.name, storage = %entry.storage, error = %e, "Storage unavailable");
                    init_errors.push(BackupError::Storage {
                        backend: entry.storage.clone(),
                        source: e,
                    });
                }
            }
        }
        storage::order_for_delivery(&mut backends);

        let tmp_dir = job
            .tmp_dir
            .clone()
            .unwrap_or_else(|| self.config.tmp_dir.join(&job.name));

        info!(
            job = %job.name,
            units = sources.iter().map(|s| s.units.len()).sum::<usize>(),
            storages = backends.len(),
            "Job ready"
        );

        Ok(Job {
            name: job.name.clone(),
            kind,
            sources,
            tmp_dir,
            backends,
            safety_backup: job.safety_backup,
            deferred_copying_level: job.deferred_copying_level,
            init_errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn config(root: &TempDir, extra_storage: &str) -> Config {
        let data = root.path().join("data");
        fs::create_dir_all(data.join("svc-a")).unwrap();
        fs::create_dir_all(data.join("svc-b")).unwrap();

        Config::from_toml(&format!(
            r#"
tmp_dir = "{tmp}"

[[storage]]
name = "nas"
type = "nfs"
mount_point = "{root}/missing-mount"

[[job]]
name = "files"
type = "desc_files"

[[job.sources]]
name = "services"
targets = ["{data}/svc-*"]

[[job.storages]]
storage = "local"
backup_path = "{root}/local"
retention = {{ days = 7 }}

[[job.storages]]
storage = "{extra}"
backup_path = "share"
retention = {{ days = 3 }}
"#,
            tmp = root.path().join("tmp").display(),
            root = root.path().display(),
            data = data.display(),
            extra = extra_storage,
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_unreachable_storage_is_recorded() {
        let root = TempDir::new().unwrap();
        let ctx = AppContext::new(config(&root, "nas"));

        let job = ctx.build_job(&ctx.config.jobs[0]).await.unwrap();
        assert_eq!(job.sources[0].units.len(), 2);
        assert_eq!(job.sources[0].units[0].object_key(), "svc-a");
        assert_eq!(job.backends.len(), 1);
        assert!(job.backends[0].is_local());
        assert_eq!(job.init_errors.len(), 1);
        assert!(matches!(&job.init_errors[0], BackupError::Storage { backend, .. } if backend == "nas"));
        assert_eq!(job.tmp_dir, root.path().join("tmp/files"));
    }

    #[tokio::test]
    async fn test_unknown_storage_fails_job() {
        let root = TempDir::new().unwrap();
        let ctx = AppContext::new(config(&root, "tape-library"));

        let err = ctx.build_job(&ctx.config.jobs[0]).await.err().unwrap();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[tokio::test]
    async fn test_negative_retention_fails_job() {
        let root = TempDir::new().unwrap();
        let mut config = config(&root, "nas");
        config.jobs[0].storages[0].retention.days = -1;
        let ctx = AppContext::new(config);

        assert!(matches!(
            ctx.build_job(&ctx.config.jobs[0]).await,
            Err(BackupError::Config(_))
        ));
    }
}
