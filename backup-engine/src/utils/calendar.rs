//! Calendar anchors that gate generations and retention buckets.

use chrono::{DateTime, Datelike, Local, NaiveDate, Weekday};

/// Day of the year on which incremental chains restart from a full baseline.
pub const REINIT_DAY_OF_YEAR: u32 = 1;

/// Day of the month on which monthly copies are stored.
pub const MONTH_ANCHOR_DAY: u32 = 1;

/// Day of the week on which weekly copies are stored.
pub const WEEK_ANCHOR_DAY: Weekday = Weekday::Sun;

/// Mid-month days on which incremental backups diff against the month baseline.
pub const DECADE_DAYS: [u32; 2] = [11, 21];

pub fn is_reinit_day(date: NaiveDate) -> bool {
    date.ordinal() == REINIT_DAY_OF_YEAR
}

pub fn is_month_anchor(date: NaiveDate) -> bool {
    date.day() == MONTH_ANCHOR_DAY
}

pub fn is_week_anchor(date: NaiveDate) -> bool {
    date.weekday() == WEEK_ANCHOR_DAY
}

pub fn is_decade_day(date: NaiveDate) -> bool {
    DECADE_DAYS.contains(&date.day())
}

/// Timestamp embedded in artifact file names.
pub fn artifact_stamp(now: DateTime<Local>) -> String {
    now.format("%Y-%m-%d_%H-%M-%S").to_string()
}
