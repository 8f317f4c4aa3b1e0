//! Snapshot metadata for incremental archives.
//!
//! A snapshot maps every archived file's absolute path to the mtime it had
//! when captured. Three generations are kept per year: `year.inc` holds the
//! yearly baseline, `month.inc` the monthly one and `day.inc` the previous
//! run. Which one an archive diffs against depends on the calendar.

use crate::layout;
use crate::storage::StorageBackend;
use crate::utils::calendar;
use crate::utils::errors::{BackupError, Result, StorageError};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Absolute file path to mtime in fractional seconds since the epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotMetadata(BTreeMap<String, f64>);

impl SnapshotMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, mtime: f64) {
        self.0.insert(path.into(), mtime);
    }

    pub fn get(&self, path: &str) -> Option<f64> {
        self.0.get(path).copied()
    }

    /// Whether `path` was captured before with exactly this mtime.
    pub fn is_unchanged(&self, path: &str, mtime: f64) -> bool {
        self.get(path) == Some(mtime)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Day,
    Month,
    Year,
}

impl Generation {
    pub fn file_name(self) -> &'static str {
        match self {
            Generation::Day => "day.inc",
            Generation::Month => "month.inc",
            Generation::Year => "year.inc",
        }
    }

    /// Generation an archive made on `today` diffs against.
    ///
    /// Ordinary days read the day generation and decade days read the month
    /// generation (the year one in January). The first of a month also reads
    /// the year generation instead of the day one: that run rewrites
    /// `month.inc`, and the month's decade-day archives must diff against a
    /// full month of changes since the yearly baseline, not a single day.
    pub fn base_for(today: NaiveDate) -> Generation {
        if calendar::is_month_anchor(today) {
            Generation::Year
        } else if calendar::is_decade_day(today) {
            if today.month() == 1 {
                Generation::Year
            } else {
                Generation::Month
            }
        } else {
            Generation::Day
        }
    }

    /// Generations the new snapshot replaces.
    pub fn written_on(today: NaiveDate, reinit: bool) -> Vec<Generation> {
        if reinit {
            vec![Generation::Year, Generation::Month, Generation::Day]
        } else if calendar::is_month_anchor(today) {
            vec![Generation::Month, Generation::Day]
        } else {
            vec![Generation::Day]
        }
    }
}

/// What an incremental archive builds on.
#[derive(Debug, Clone)]
pub struct PriorSnapshot {
    /// Start a new chain from a full baseline
    pub reinit: bool,
    pub metadata: SnapshotMetadata,
    /// Generation `metadata` was read from; `None` on reinit
    pub base: Option<Generation>,
}

impl PriorSnapshot {
    fn reinit() -> Self {
        Self {
            reinit: true,
            metadata: SnapshotMetadata::new(),
            base: None,
        }
    }
}

/// Decide between a new baseline and an increment, loading the snapshot the
/// increment diffs against.
///
/// `backends` are queried in delivery order, so remote copies are preferred.
/// When no backend has yearly metadata the chain restarts; any other failure
/// to find or parse the selected generation is an error for this target.
pub async fn load_prior(
    backends: &[Arc<dyn StorageBackend>],
    object_key: &str,
    today: NaiveDate,
) -> Result<PriorSnapshot> {
    if calendar::is_reinit_day(today) {
        tracing::info!(object_key = %object_key, "Yearly reinit day, starting a new baseline");
        return Ok(PriorSnapshot::reinit());
    }

    let year = today.year();
    let year_file = layout::meta_file(object_key, year, Generation::Year);
    let mut read_errors: Vec<(String, StorageError)> = Vec::new();
    let mut source = None;

    for backend in backends {
        match backend.read(&year_file).await {
            Ok(data) => {
                source = Some((backend, data));
                break;
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(storage = %backend.name(), path = %year_file, "No yearly metadata");
            }
            Err(e) => read_errors.push((backend.name().to_string(), e)),
        }
    }

    let Some((backend, year_data)) = source else {
        if let Some((storage, err)) = read_errors.into_iter().next() {
            return Err(BackupError::metadata(
                object_key,
                format!("yearly metadata unavailable on '{}': {}", storage, err),
            ));
        }
        tracing::info!(object_key = %object_key, "No yearly metadata on any storage, starting a new baseline");
        return Ok(PriorSnapshot::reinit());
    };

    let base = Generation::base_for(today);
    let data = if base == Generation::Year {
        year_data
    } else {
        let path = layout::meta_file(object_key, year, base);
        backend.read(&path).await.map_err(|e| {
            BackupError::metadata(object_key, format!("reading {} from '{}': {}", path, backend.name(), e))
        })?
    };

    let metadata = SnapshotMetadata::from_json(&data).map_err(|e| {
        BackupError::metadata(object_key, format!("parsing {}: {}", base.file_name(), e))
    })?;

    tracing::debug!(
        object_key = %object_key,
        storage = %backend.name(),
        generation = base.file_name(),
        files = metadata.len(),
        "Loaded prior snapshot"
    );

    Ok(PriorSnapshot {
        reinit: false,
        metadata,
        base: Some(base),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retention::policy::RetentionPolicy;
    use crate::storage::filesystem::FsBackend;
    use std::fs;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn local(dir: &TempDir) -> Arc<dyn StorageBackend> {
        Arc::new(FsBackend::local(
            "local",
            &dir.path().to_string_lossy(),
            RetentionPolicy::default(),
        ))
    }

    fn write_meta(dir: &TempDir, generation: Generation, body: &str) {
        let path = dir
            .path()
            .join(layout::meta_file("svc", 2026, generation));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn test_base_generation_calendar() {
        assert_eq!(Generation::base_for(date(2026, 10, 16)), Generation::Day);
        assert_eq!(Generation::base_for(date(2026, 10, 11)), Generation::Month);
        assert_eq!(Generation::base_for(date(2026, 10, 21)), Generation::Month);
        assert_eq!(Generation::base_for(date(2026, 1, 21)), Generation::Year);
        assert_eq!(Generation::base_for(date(2026, 10, 1)), Generation::Year);
    }

    #[test]
    fn test_written_generations() {
        assert_eq!(
            Generation::written_on(date(2026, 1, 1), true),
            vec![Generation::Year, Generation::Month, Generation::Day]
        );
        assert_eq!(
            Generation::written_on(date(2026, 3, 1), false),
            vec![Generation::Month, Generation::Day]
        );
        assert_eq!(Generation::written_on(date(2026, 3, 2), false), vec![Generation::Day]);
    }

    #[test]
    fn test_metadata_json_shape() {
        let mut meta = SnapshotMetadata::new();
        meta.insert("/srv/app-1/data/a.txt", 1767225600.25);
        let json = String::from_utf8(meta.to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"/srv/app-1/data/a.txt":1767225600.25}"#);

        let parsed = SnapshotMetadata::from_json(json.as_bytes()).unwrap();
        assert!(parsed.is_unchanged("/srv/app-1/data/a.txt", 1767225600.25));
        assert!(!parsed.is_unchanged("/srv/app-1/data/a.txt", 1767225601.0));
    }

    #[tokio::test]
    async fn test_reinit_day_ignores_existing_metadata() {
        let store = TempDir::new().unwrap();
        write_meta(&store, Generation::Year, "{}");

        let prior = load_prior(&[local(&store)], "svc", date(2026, 1, 1)).await.unwrap();
        assert!(prior.reinit);
        assert!(prior.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_missing_year_metadata_forces_reinit() {
        let store = TempDir::new().unwrap();
        let prior = load_prior(&[local(&store)], "svc", date(2026, 10, 16)).await.unwrap();
        assert!(prior.reinit);
        assert_eq!(prior.base, None);
    }

    #[tokio::test]
    async fn test_ordinary_day_reads_day_generation() {
        let store = TempDir::new().unwrap();
        write_meta(&store, Generation::Year, r#"{"/a":1.0}"#);
        write_meta(&store, Generation::Month, r#"{"/a":2.0}"#);
        write_meta(&store, Generation::Day, r#"{"/a":3.0}"#);

        let prior = load_prior(&[local(&store)], "svc", date(2026, 10, 16)).await.unwrap();
        assert!(!prior.reinit);
        assert_eq!(prior.base, Some(Generation::Day));
        assert_eq!(prior.metadata.get("/a"), Some(3.0));

        let decade = load_prior(&[local(&store)], "svc", date(2026, 10, 21)).await.unwrap();
        assert_eq!(decade.metadata.get("/a"), Some(2.0));
    }

    #[tokio::test]
    async fn test_remote_copy_preferred() {
        let remote = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        write_meta(&remote, Generation::Year, "{}");
        write_meta(&remote, Generation::Day, r#"{"/a":7.0}"#);
        write_meta(&local_dir, Generation::Year, "{}");
        write_meta(&local_dir, Generation::Day, r#"{"/a":1.0}"#);

        let nas: Arc<dyn StorageBackend> = Arc::new(FsBackend::local(
            "nas",
            &remote.path().to_string_lossy(),
            RetentionPolicy::default(),
        ));
        let prior = load_prior(&[nas, local(&local_dir)], "svc", date(2026, 10, 16))
            .await
            .unwrap();
        assert_eq!(prior.metadata.get("/a"), Some(7.0));
    }

    #[tokio::test]
    async fn test_corrupt_base_generation_is_error() {
        let store = TempDir::new().unwrap();
        write_meta(&store, Generation::Year, "{}");
        write_meta(&store, Generation::Day, "not json");

        let err = load_prior(&[local(&store)], "svc", date(2026, 10, 16)).await.unwrap_err();
        assert!(matches!(err, BackupError::Metadata { .. }));
    }

    #[tokio::test]
    async fn test_missing_base_generation_is_error() {
        let store = TempDir::new().unwrap();
        write_meta(&store, Generation::Year, "{}");

        let err = load_prior(&[local(&store)], "svc", date(2026, 10, 16)).await.unwrap_err();
        assert!(matches!(err, BackupError::Metadata { .. }));
    }
}
