//! Retention sweeps.
//!
//! Bucketed backups age out file by file; incremental archives age out a
//! whole `month_NN` generation directory at a time. Every deletion is
//! attempted independently and failures are returned together.

pub mod policy;

use crate::layout::{self, Layout};
use crate::storage::{Entry, StorageBackend};
use crate::utils::errors::{BackupError, StorageError};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use policy::{is_expired, Bucket};

/// Apply the backend's policy to everything stored under `object_key`.
pub async fn sweep(
    backend: &dyn StorageBackend,
    object_key: &str,
    layout: Layout,
    now: DateTime<Utc>,
) -> Vec<BackupError> {
    match layout {
        Layout::Bucketed => sweep_bucketed(backend, object_key, now).await,
        Layout::Generational => sweep_generational(backend, object_key, now.date_naive()).await,
    }
}

pub async fn sweep_bucketed(
    backend: &dyn StorageBackend,
    object_key: &str,
    now: DateTime<Utc>,
) -> Vec<BackupError> {
    let mut errors = Vec::new();

    for bucket in Bucket::ALL {
        let count = backend.retention().count(bucket);
        if count == 0 {
            continue;
        }

        let dir = layout::bucket_dir(object_key, bucket);
        let expired = move |entry: &Entry| !entry.is_dir && is_expired(entry.modified, bucket, count, now);

        match backend.delete_matching(&dir, &expired).await {
            Ok(failures) => errors.extend(failures.into_iter().map(|e| retention_error(backend, object_key, e))),
            Err(e) if e.is_not_found() => {
                tracing::debug!(storage = %backend.name(), dir = %dir, "Bucket not created yet");
            }
            Err(e) => errors.push(retention_error(backend, object_key, e)),
        }
    }

    errors
}

/// First month still kept on `today` when `months` months are retained.
pub fn generational_cutoff(today: NaiveDate, months: u32) -> (i32, u32) {
    let mut year = today.year();
    let mut month = today.month() as i64 - i64::from(months);
    while month <= 0 {
        month += 12;
        year -= 1;
    }
    (year, month as u32)
}

pub async fn sweep_generational(
    backend: &dyn StorageBackend,
    object_key: &str,
    today: NaiveDate,
) -> Vec<BackupError> {
    let months = backend.retention().months;
    if months == 0 {
        return Vec::new();
    }
    let (cutoff_year, cutoff_month) = generational_cutoff(today, months);
    let mut errors = Vec::new();

    // Year directories older than the cutoff year go as a whole
    let stale_year = move |entry: &Entry| {
        entry.is_dir && layout::parse_year_dir(&entry.name).is_some_and(|y| y < cutoff_year)
    };
    match backend.delete_matching(object_key, &stale_year).await {
        Ok(failures) => errors.extend(failures.into_iter().map(|e| retention_error(backend, object_key, e))),
        Err(e) if e.is_not_found() => return errors,
        Err(e) => errors.push(retention_error(backend, object_key, e)),
    }

    let year_dir = layout::year_dir(object_key, cutoff_year);
    let stale_month = move |entry: &Entry| {
        entry.is_dir && layout::parse_month_dir(&entry.name).is_some_and(|m| m < cutoff_month)
    };
    match backend.delete_matching(&year_dir, &stale_month).await {
        Ok(failures) => errors.extend(failures.into_iter().map(|e| retention_error(backend, object_key, e))),
        Err(e) if e.is_not_found() => {}
        Err(e) => errors.push(retention_error(backend, object_key, e)),
    }

    errors
}

fn retention_error(backend: &dyn StorageBackend, object_key: &str, source: StorageError) -> BackupError {
    tracing::warn!(
        storage = %backend.name(),
        object_key = %object_key,
        error = %source,
        "Retention deletion failed"
    );
    BackupError::Retention {
        object_key: object_key.to_string(),
        backend: backend.name().to_string(),
        source,
    }
}
