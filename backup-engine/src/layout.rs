//! Remote path conventions shared by delivery, retention and metadata.
//!
//! Descriptive and dump backups live in `<key>/<bucket>/<file>`;
//! incremental archives in `<key>/<year>/month_NN/<file>` with the generation
//! metadata next to them in `<key>/<year>/inc_meta_info/{day,month,year}.inc`.

use crate::retention::policy::Bucket;
use crate::snapshot::Generation;
use crate::storage::paths::join;

/// Directory holding the generation metadata of one year.
pub const META_DIR: &str = "inc_meta_info";

/// How a job's artifacts are laid out on every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Bucketed,
    Generational,
}

pub fn bucket_dir(object_key: &str, bucket: Bucket) -> String {
    join(object_key, bucket.dir_name())
}

pub fn year_dir(object_key: &str, year: i32) -> String {
    join(object_key, &year.to_string())
}

pub fn month_dir_name(month: u32) -> String {
    format!("month_{:02}", month)
}

pub fn month_dir(object_key: &str, year: i32, month: u32) -> String {
    join(&year_dir(object_key, year), &month_dir_name(month))
}

/// Parse `month_NN` back into its month number.
pub fn parse_month_dir(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("month_")?;
    if digits.len() != 2 {
        return None;
    }
    digits.parse().ok().filter(|m| (1..=12).contains(m))
}

/// Parse a year directory name.
pub fn parse_year_dir(name: &str) -> Option<i32> {
    if name.len() == 4 && name.bytes().all(|b| b.is_ascii_digit()) {
        name.parse().ok()
    } else {
        None
    }
}

pub fn meta_file(object_key: &str, year: i32, generation: Generation) -> String {
    join(&join(&year_dir(object_key, year), META_DIR), generation.file_name())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(bucket_dir("svcA", Bucket::Weekly), "svcA/weekly");
        assert_eq!(month_dir("svcA", 2026, 3), "svcA/2026/month_03");
        assert_eq!(
            meta_file("svcA", 2026, Generation::Year),
            "svcA/2026/inc_meta_info/year.inc"
        );
    }

    #[test]
    fn test_parse_dirs() {
        assert_eq!(parse_month_dir("month_09"), Some(9));
        assert_eq!(parse_month_dir("month_13"), None);
        assert_eq!(parse_month_dir("month_9"), None);
        assert_eq!(parse_month_dir("inc_meta_info"), None);

        assert_eq!(parse_year_dir("2025"), Some(2025));
        assert_eq!(parse_year_dir("20x5"), None);
        assert_eq!(parse_year_dir("daily"), None);
    }
}
