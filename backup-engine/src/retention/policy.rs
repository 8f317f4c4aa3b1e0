//! Retention policies and the calendar buckets they govern.

use crate::utils::calendar;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use std::cmp::Reverse;

/// Retention class of a descriptive or dump backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Daily,
    Weekly,
    Monthly,
}

impl Bucket {
    /// Longest kept first when retention periods tie.
    pub const ALL: [Bucket; 3] = [Bucket::Monthly, Bucket::Weekly, Bucket::Daily];

    pub fn dir_name(self) -> &'static str {
        match self {
            Bucket::Daily => "daily",
            Bucket::Weekly => "weekly",
            Bucket::Monthly => "monthly",
        }
    }

    /// Whether the calendar lets this bucket receive a copy today.
    pub fn is_due(self, today: NaiveDate) -> bool {
        match self {
            Bucket::Daily => true,
            Bucket::Weekly => calendar::is_week_anchor(today),
            Bucket::Monthly => calendar::is_month_anchor(today),
        }
    }
}

/// How long each bucket keeps its copies. Zero disables a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub days: u32,
    pub weeks: u32,
    pub months: u32,
}

impl RetentionPolicy {
    /// Validate raw configuration values; negative counts are rejected.
    pub fn new(days: i64, weeks: i64, months: i64) -> Result<Self> {
        Ok(Self {
            days: non_negative("days", days)?,
            weeks: non_negative("weeks", weeks)?,
            months: non_negative("months", months)?,
        })
    }

    pub fn count(&self, bucket: Bucket) -> u32 {
        match bucket {
            Bucket::Daily => self.days,
            Bucket::Weekly => self.weeks,
            Bucket::Monthly => self.months,
        }
    }

    /// Buckets that receive a copy today, the one keeping it longest first.
    ///
    /// The first bucket holds the physical copy and the others may link to
    /// it, so a link never outlives the file it points at.
    pub fn due_buckets(&self, today: NaiveDate) -> Vec<Bucket> {
        let mut due: Vec<Bucket> = Bucket::ALL
            .into_iter()
            .filter(|b| self.count(*b) > 0 && b.is_due(today))
            .collect();
        due.sort_by_key(|b| Reverse(keep_until(today, *b, self.count(*b)).unwrap_or(NaiveDate::MAX)));
        due
    }

    pub fn is_due(&self, today: NaiveDate) -> bool {
        !self.due_buckets(today).is_empty()
    }
}

fn non_negative(field: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        BackupError::Config(format!(
            "retention {} must be a non-negative integer, got {}",
            field, value
        ))
    })
}

/// Last day on which a copy stored at `modified` is still kept.
pub fn retention_date(modified: DateTime<Utc>, bucket: Bucket, count: u32) -> Option<NaiveDate> {
    keep_until(modified.date_naive(), bucket, count)
}

fn keep_until(stored: NaiveDate, bucket: Bucket, count: u32) -> Option<NaiveDate> {
    match bucket {
        Bucket::Daily => stored.checked_add_days(Days::new(u64::from(count))),
        Bucket::Weekly => stored.checked_add_days(Days::new(u64::from(count) * 7)),
        Bucket::Monthly => stored.checked_add_months(Months::new(count)),
    }
}

/// A copy expires once today is strictly after its retention date.
pub fn is_expired(modified: DateTime<Utc>, bucket: Bucket, count: u32, now: DateTime<Utc>) -> bool {
    match retention_date(modified, bucket, count) {
        Some(last_day) => now.date_naive() > last_day,
        None => false,
    }
}
