//! PAX extended records written ahead of archive entries.

use crate::fs::metadata::FileTimes;

pub const DUMPDIR_KEY: &str = "GNU.dumpdir";

/// Change status of one child in a GNU dumpdir record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpdirStatus {
    /// Subdirectory
    Dir,
    /// New or modified since the prior snapshot; its body is in the archive
    Changed,
    /// Unchanged; restore keeps the copy from an earlier archive
    Unchanged,
}

impl DumpdirStatus {
    pub fn code(self) -> u8 {
        match self {
            DumpdirStatus::Dir => b'D',
            DumpdirStatus::Changed => b'Y',
            DumpdirStatus::Unchanged => b'N',
        }
    }
}

/// `mtime`, `atime` and `ctime` records with sub-second precision.
pub fn time_records(times: &FileTimes) -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("mtime", times.mtime.pax_value().into_bytes()),
        ("atime", times.atime.pax_value().into_bytes()),
        ("ctime", times.ctime.pax_value().into_bytes()),
    ]
}

/// Encode dumpdir tokens: `<status><name>\0` per child, closed by an empty
/// token.
pub fn dumpdir_value<'a, I>(children: I) -> Vec<u8>
where
    I: IntoIterator<Item = (DumpdirStatus, &'a str)>,
{
    let mut value = Vec::new();
    for (status, name) in children {
        value.push(status.code());
        value.extend_from_slice(name.as_bytes());
        value.push(0);
    }
    value.push(0);
    value
}

/// Decode a dumpdir value back into its tokens.
pub fn parse_dumpdir(value: &[u8]) -> Vec<(u8, String)> {
    value
        .split(|b| *b == 0)
        .filter(|token| !token.is_empty())
        .map(|token| (token[0], String::from_utf8_lossy(&token[1..]).into_owned()))
        .collect()
}
