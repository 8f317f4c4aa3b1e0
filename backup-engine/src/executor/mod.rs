//! Job orchestration.
//!
//! A job walks its sources in order, produces one artifact per unit and
//! hands the artifacts to the delivery pipeline, then applies retention on
//! every backend. Nothing a single unit or backend does aborts the job;
//! failures are collected into the [`JobReport`].

pub mod dumped;
pub mod producer;

use crate::archive::{self, ArchiveMode, ArchiveOutput};
use crate::delivery;
use crate::layout::Layout;
use crate::retention;
use crate::snapshot::{self, Generation};
use crate::storage::StorageBackend;
use crate::targets::Target;
use crate::utils::calendar;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use dumped::DumpedObject;
use producer::ArtifactProducer;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a job produces for each unit.
#[derive(Clone)]
pub enum JobKind {
    /// Full archives of file targets, rotated in buckets
    DescFiles,
    /// Incremental archives of file targets, kept by year and month
    IncFiles,
    /// Artifacts made by an external producer, rotated in buckets
    Dump(Arc<dyn ArtifactProducer>),
}

impl JobKind {
    pub fn layout(&self) -> Layout {
        match self {
            JobKind::IncFiles => Layout::Generational,
            JobKind::DescFiles | JobKind::Dump(_) => Layout::Bucketed,
        }
    }
}

/// One thing a job backs up under its own object key.
#[derive(Debug, Clone)]
pub enum Unit {
    Target(Target),
    /// Object key handed to the job's producer
    Dump(String),
}

impl Unit {
    pub fn object_key(&self) -> &str {
        match self {
            Unit::Target(target) => &target.object_key,
            Unit::Dump(key) => key,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Source {
    pub name: String,
    pub units: Vec<Unit>,
}

/// Outcome of one job run.
#[derive(Debug, Default)]
pub struct JobReport {
    pub job: String,
    /// No backend had a bucket due, nothing was done
    pub skipped: bool,
    /// How many times pending objects were handed to delivery
    pub delivery_rounds: usize,
    /// Objects every backend accepted
    pub delivered: usize,
    pub errors: Vec<BackupError>,
}

impl JobReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Points in the unit loop where pending objects may be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Unit,
    Source,
    Job,
}

fn flushes_at(deferred_copying_level: u32, stage: Stage) -> bool {
    match stage {
        Stage::Unit => deferred_copying_level == 0,
        Stage::Source => deferred_copying_level == 1,
        Stage::Job => true,
    }
}

pub struct Job {
    pub name: String,
    pub kind: JobKind,
    pub sources: Vec<Source>,
    /// Scratch directory for artifacts awaiting delivery
    pub tmp_dir: PathBuf,
    /// Backends in delivery order (local last)
    pub backends: Vec<Arc<dyn StorageBackend>>,
    /// Sweep only after the new backup was delivered
    pub safety_backup: bool,
    /// 0 delivers after each unit, 1 after each source, 2+ once per job
    pub deferred_copying_level: u32,
    /// Failures hit while building the job, reported with its first run
    pub init_errors: Vec<BackupError>,
}

impl Job {
    pub async fn run(&mut self) -> JobReport {
        self.run_at(Local::now()).await
    }

    /// Run the job as if the clock read `now`.
    pub async fn run_at(&mut self, now: DateTime<Local>) -> JobReport {
        let today = now.date_naive();
        let now_utc = now.with_timezone(&Utc);
        let mut report = JobReport {
            job: self.name.clone(),
            ..Default::default()
        };
        report.errors.append(&mut self.init_errors);

        if !self.need_to_make_backup(today) {
            info!(job = %self.name, "No retention bucket due today, skipping");
            report.skipped = true;
            return report;
        }

        let layout = self.kind.layout();
        if !self.safety_backup {
            for source in &self.sources {
                for unit in &source.units {
                    self.sweep_object(unit.object_key(), layout, now_utc, &mut report.errors)
                        .await;
                }
            }
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.tmp_dir).await {
            error!(job = %self.name, tmp_dir = %self.tmp_dir.display(), error = %e, "Cannot create temp dir");
            report.errors.push(e.into());
            return report;
        }

        let stamp = calendar::artifact_stamp(now);
        let mut pending = Vec::new();
        let mut finished = Vec::new();

        for source in &self.sources {
            info!(job = %self.name, source = %source.name, units = source.units.len(), "Processing source");

            for unit in &source.units {
                match self.produce(unit, today, now_utc, &stamp, &mut report.errors).await {
                    Ok(object) => pending.push(object),
                    Err(e) => {
                        error!(
                            job = %self.name,
                            object_key = %unit.object_key(),
                            error = %e,
                            "Backup failed"
                        );
                        report.errors.push(e);
                    }
                }
                if flushes_at(self.deferred_copying_level, Stage::Unit) {
                    self.flush(&mut pending, &mut finished, today, &mut report).await;
                }
            }

            if flushes_at(self.deferred_copying_level, Stage::Source) {
                self.flush(&mut pending, &mut finished, today, &mut report).await;
            }
        }
        if flushes_at(self.deferred_copying_level, Stage::Job) {
            self.flush(&mut pending, &mut finished, today, &mut report).await;
        }

        if self.safety_backup {
            for object in finished.iter().filter(|o| o.delivered) {
                self.sweep_object(&object.object_key, layout, now_utc, &mut report.errors)
                    .await;
            }
        }

        self.cleanup(&finished).await;
        report.delivered = finished.iter().filter(|o| o.delivered).count();

        if report.is_clean() {
            info!(
                job = %self.name,
                delivered = report.delivered,
                rounds = report.delivery_rounds,
                "Job finished"
            );
        } else {
            warn!(
                job = %self.name,
                delivered = report.delivered,
                errors = report.errors.len(),
                "Job finished with errors"
            );
        }
        report
    }

    /// Whether today's run has anything to do. Incremental chains need a
    /// link every day; bucketed jobs only when some bucket is due.
    pub fn need_to_make_backup(&self, today: NaiveDate) -> bool {
        matches!(self.kind, JobKind::IncFiles)
            || self.backends.iter().any(|b| b.retention().is_due(today))
    }

    /// Close every backend connection.
    pub async fn close(&self) -> Vec<BackupError> {
        let mut errors = Vec::new();
        for backend in &self.backends {
            if let Err(e) = backend.close().await {
                warn!(job = %self.name, storage = %backend.name(), error = %e, "Closing storage failed");
                errors.push(BackupError::Storage {
                    backend: backend.name().to_string(),
                    source: e,
                });
            }
        }
        errors
    }

    async fn produce(
        &self,
        unit: &Unit,
        today: NaiveDate,
        now_utc: DateTime<Utc>,
        stamp: &str,
        errors: &mut Vec<BackupError>,
    ) -> Result<DumpedObject> {
        match (unit, &self.kind) {
            (Unit::Dump(key), JobKind::Dump(producer)) => {
                let artifact = producer.produce(key, &self.tmp_dir, stamp).await?;
                debug!(job = %self.name, object_key = %key, artifact = %artifact.display(), "Dump produced");
                Ok(DumpedObject::bucketed(key.clone(), artifact))
            }
            (Unit::Dump(key), _) => Err(BackupError::Dump {
                object_key: key.clone(),
                message: format!("job '{}' has no artifact producer", self.name),
            }),
            (Unit::Target(target), JobKind::IncFiles) => {
                self.build_incremental(target, today, now_utc, stamp, errors).await
            }
            (Unit::Target(target), _) => {
                let output = self.build_archive(target, ArchiveMode::Full, stamp).await?;
                Ok(DumpedObject::from_full_archive(target.object_key.clone(), output))
            }
        }
    }

    async fn build_incremental(
        &self,
        target: &Target,
        today: NaiveDate,
        now_utc: DateTime<Utc>,
        stamp: &str,
        errors: &mut Vec<BackupError>,
    ) -> Result<DumpedObject> {
        let prior = snapshot::load_prior(&self.backends, &target.object_key, today).await?;

        if prior.reinit && !self.safety_backup {
            self.sweep_object(&target.object_key, Layout::Generational, now_utc, errors)
                .await;
        }

        let generations = Generation::written_on(today, prior.reinit);
        let mode = ArchiveMode::Incremental {
            prior: prior.metadata,
            reinit: prior.reinit,
        };
        let output = self.build_archive(target, mode, stamp).await?;
        Ok(DumpedObject::from_incremental_archive(
            target.object_key.clone(),
            output,
            generations,
        ))
    }

    async fn build_archive(&self, target: &Target, mode: ArchiveMode, stamp: &str) -> Result<ArchiveOutput> {
        let owned = target.clone();
        let out_dir = self.tmp_dir.clone();
        let stamp = stamp.to_string();

        // Walking and compressing are blocking
        tokio::task::spawn_blocking(move || archive::build(&owned, &mode, &out_dir, &stamp))
            .await
            .map_err(|e| BackupError::archive(&target.object_key, io::Error::other(e)))?
    }

    async fn flush(
        &self,
        pending: &mut Vec<DumpedObject>,
        finished: &mut Vec<DumpedObject>,
        today: NaiveDate,
        report: &mut JobReport,
    ) {
        if pending.is_empty() {
            return;
        }
        report.delivery_rounds += 1;

        for mut object in pending.drain(..) {
            let failures = delivery::deliver(&object, &self.backends, today).await;
            object.delivered = failures.is_empty();
            report.errors.extend(failures);
            finished.push(object);
        }
    }

    async fn sweep_object(
        &self,
        object_key: &str,
        layout: Layout,
        now: DateTime<Utc>,
        errors: &mut Vec<BackupError>,
    ) {
        for backend in &self.backends {
            errors.extend(retention::sweep(backend.as_ref(), object_key, layout, now).await);
        }
    }

    /// Remove temporary files left after delivery, then the temp dir if it
    /// ended up empty.
    async fn cleanup(&self, objects: &[DumpedObject]) {
        for object in objects {
            for path in object.local_files() {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => debug!(path = %path.display(), "Removed temp file"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "Cannot remove temp file"),
                }
            }
        }

        // Fails while anything is left inside
        if tokio::fs::remove_dir(&self.tmp_dir).await.is_ok() {
            debug!(tmp_dir = %self.tmp_dir.display(), "Removed empty temp dir");
        }
    }
}
