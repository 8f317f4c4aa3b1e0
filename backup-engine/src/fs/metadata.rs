//! File metadata captured for archive headers and snapshots.
//!
//! Timestamps keep their nanoseconds so the PAX `mtime`/`atime`/`ctime`
//! records and the snapshot mtimes survive a round trip unchanged.

use std::fs::{self, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// A point in time as seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timespec {
    pub secs: i64,
    pub nanos: u32,
}

impl Timespec {
    pub fn new(secs: i64, nanos: i64) -> Self {
        Self {
            secs,
            nanos: nanos.clamp(0, 999_999_999) as u32,
        }
    }

    /// Fractional seconds, the form stored in snapshot metadata.
    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + f64::from(self.nanos) / 1e9
    }

    /// Decimal PAX time value: whole seconds, or seconds with the fraction
    /// trimmed of trailing zeros.
    pub fn pax_value(&self) -> String {
        if self.nanos == 0 {
            return self.secs.to_string();
        }
        let (sign, secs, nanos) = if self.secs < 0 {
            ("-", -(self.secs + 1), 1_000_000_000 - self.nanos)
        } else {
            ("", self.secs, self.nanos)
        };
        let fraction = format!("{:09}", nanos);
        format!("{}{}.{}", sign, secs, fraction.trim_end_matches('0'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTimes {
    pub mtime: Timespec,
    pub atime: Timespec,
    pub ctime: Timespec,
}

impl FileTimes {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            mtime: Timespec::new(meta.mtime(), meta.mtime_nsec()),
            atime: Timespec::new(meta.atime(), meta.atime_nsec()),
            ctime: Timespec::new(meta.ctime(), meta.ctime_nsec()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
    /// Sockets, fifos and devices; never archived
    Other,
}

/// Metadata of one walked entry, without following symlinks.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub times: FileTimes,
}

impl FileMetadata {
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        Ok(Self::from_metadata(&fs::symlink_metadata(path)?))
    }

    pub fn from_metadata(meta: &Metadata) -> Self {
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };

        Self {
            kind,
            size: meta.size(),
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            times: FileTimes::from_metadata(meta),
        }
    }
}
