//! Archive builder.
//!
//! Walks one target and writes a PAX tar (optionally gzipped). In
//! incremental mode every directory carries a `GNU.dumpdir` record listing
//! its children, unchanged files are left out of the archive, and a new
//! snapshot of all file mtimes is written next to it. Headers are collected
//! for the whole walk before the archive is opened.

pub mod pax;

use crate::fs::metadata::{EntryKind, FileMetadata};
use crate::fs::walker::{walk_tree, WalkEntry};
use crate::snapshot::SnapshotMetadata;
use crate::targets::Target;
use crate::utils::errors::{BackupError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use pax::{dumpdir_value, time_records, DumpdirStatus, DUMPDIR_KEY};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Read, Take, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};

/// What the archive captures.
#[derive(Debug, Clone)]
pub enum ArchiveMode {
    /// Every file, no change records
    Full,
    /// Files changed since `prior`, with dumpdir records
    Incremental {
        prior: SnapshotMetadata,
        reinit: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ArchiveOutput {
    pub artifact: PathBuf,
    /// New snapshot (`.inc`); incremental only
    pub sidecar: Option<PathBuf>,
    /// Zero-byte `.init` marker; reinit only
    pub init_marker: Option<PathBuf>,
    pub stats: ArchiveStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub entries: usize,
    pub changed_files: usize,
    pub unchanged_files: usize,
}

/// A header waiting to be written once the walk is complete.
struct PendingEntry {
    name: PathBuf,
    kind: EntryKind,
    metadata: FileMetadata,
    records: Vec<(&'static str, Vec<u8>)>,
    /// File body to stream, or the symlink target
    source: Option<PathBuf>,
}

/// Base name (without extension) of the files one run produces.
pub fn artifact_stem(object_key: &str, stamp: &str) -> String {
    format!("{}_{}", object_key, stamp)
}

/// Build the archive for `target` into `out_dir`.
///
/// Blocking; callers run it on the blocking pool. On error no partial
/// output is left behind.
pub fn build(target: &Target, mode: &ArchiveMode, out_dir: &Path, stamp: &str) -> Result<ArchiveOutput> {
    let stem = artifact_stem(&target.object_key, stamp);
    let artifact = out_dir.join(format!("{}.tar{}", stem, if target.gzip { ".gz" } else { "" }));
    let sidecar = out_dir.join(format!("{}.inc", stem));
    let init_marker = out_dir.join(format!("{}.init", stem));

    let result = build_into(target, mode, &artifact, &sidecar, &init_marker);
    if result.is_err() {
        for path in [&artifact, &sidecar, &init_marker] {
            let _ = std::fs::remove_file(path);
        }
    }
    result.map_err(|e| BackupError::archive(&target.object_key, e))
}

fn build_into(
    target: &Target,
    mode: &ArchiveMode,
    artifact: &Path,
    sidecar: &Path,
    init_marker: &Path,
) -> io::Result<ArchiveOutput> {
    let excluded = |p: &Path| target.excludes.is_excluded(p);
    let walked = walk_tree(&target.path, excluded)?;

    let children = match mode {
        ArchiveMode::Incremental { prior, .. } => dumpdir_children(&walked, prior),
        ArchiveMode::Full => HashMap::new(),
    };

    let mut snapshot = SnapshotMetadata::new();
    let mut stats = ArchiveStats::default();
    let mut pending = Vec::with_capacity(walked.len());

    for entry in &walked {
        let mut records = time_records(&entry.metadata.times);
        let mut source = None;

        match entry.metadata.kind {
            EntryKind::Dir => {
                if let ArchiveMode::Incremental { .. } = mode {
                    let tokens = children.get(entry.path.as_path()).map(Vec::as_slice).unwrap_or_default();
                    records.push((DUMPDIR_KEY, dumpdir_value(tokens.iter().map(|(s, n)| (*s, n.as_str())))));
                }
            }
            EntryKind::File => {
                let path = entry.path.to_string_lossy().into_owned();
                let mtime = entry.metadata.times.mtime.as_secs_f64();
                snapshot.insert(path.clone(), mtime);

                if let ArchiveMode::Incremental { prior, .. } = mode {
                    if prior.is_unchanged(&path, mtime) {
                        stats.unchanged_files += 1;
                        continue;
                    }
                }
                stats.changed_files += 1;
                source = Some(entry.path.clone());
            }
            EntryKind::Symlink => {
                source = Some(std::fs::read_link(&entry.path)?);
            }
            EntryKind::Other => {
                tracing::debug!(path = %entry.path.display(), "Skipping special file");
                continue;
            }
        }

        pending.push(PendingEntry {
            name: archive_name(target, entry),
            kind: entry.metadata.kind,
            metadata: entry.metadata.clone(),
            records,
            source,
        });
    }

    stats.entries = pending.len();

    let file = File::create(artifact)?;
    if target.gzip {
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        write_entries(&mut builder, &pending)?;
        builder.into_inner()?.finish()?.sync_all()?;
    } else {
        let mut builder = Builder::new(BufWriter::new(file));
        write_entries(&mut builder, &pending)?;
        builder.into_inner()?.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    }

    let (sidecar, init_marker) = match mode {
        ArchiveMode::Full => (None, None),
        ArchiveMode::Incremental { reinit, .. } => {
            let json = snapshot.to_json().map_err(io::Error::from)?;
            std::fs::write(sidecar, json)?;
            let marker = if *reinit {
                File::create(init_marker)?;
                Some(init_marker.to_path_buf())
            } else {
                None
            };
            (Some(sidecar.to_path_buf()), marker)
        }
    };

    tracing::info!(
        object_key = %target.object_key,
        entries = stats.entries,
        changed = stats.changed_files,
        unchanged = stats.unchanged_files,
        artifact = %artifact.display(),
        "Archive built"
    );

    Ok(ArchiveOutput {
        artifact: artifact.to_path_buf(),
        sidecar,
        init_marker,
        stats,
    })
}

/// Dumpdir tokens of every walked directory, keyed by directory path.
///
/// Built from the walk itself so the records agree with the archive members
/// and the new snapshot even when the tree changes while it is archived.
fn dumpdir_children<'a>(
    walked: &'a [WalkEntry],
    prior: &SnapshotMetadata,
) -> HashMap<&'a Path, Vec<(DumpdirStatus, String)>> {
    let mut children: HashMap<&Path, Vec<(DumpdirStatus, String)>> = HashMap::new();

    for entry in walked.iter().filter(|e| e.depth > 0) {
        let (Some(parent), Some(name)) = (entry.path.parent(), entry.path.file_name()) else {
            continue;
        };
        let status = match entry.metadata.kind {
            EntryKind::Dir => DumpdirStatus::Dir,
            EntryKind::Symlink => DumpdirStatus::Changed,
            EntryKind::File => {
                let mtime = entry.metadata.times.mtime.as_secs_f64();
                if prior.is_unchanged(&entry.path.to_string_lossy(), mtime) {
                    DumpdirStatus::Unchanged
                } else {
                    DumpdirStatus::Changed
                }
            }
            EntryKind::Other => continue,
        };
        children
            .entry(parent)
            .or_default()
            .push((status, name.to_string_lossy().into_owned()));
    }

    children
}

/// Name of `entry` inside the archive.
fn archive_name(target: &Target, entry: &WalkEntry) -> PathBuf {
    if target.save_abs_path {
        return entry
            .path
            .strip_prefix("/")
            .unwrap_or(&entry.path)
            .to_path_buf();
    }

    let base = target
        .path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&target.object_key));
    if entry.relative_path.as_os_str().is_empty() {
        base
    } else {
        base.join(&entry.relative_path)
    }
}

fn write_entries<W: Write>(builder: &mut Builder<W>, pending: &[PendingEntry]) -> io::Result<()> {
    builder.follow_symlinks(false);

    for entry in pending {
        builder.append_pax_extensions(entry.records.iter().map(|(k, v)| (*k, v.as_slice())))?;

        let meta = &entry.metadata;
        let mut header = Header::new_ustar();
        header.set_mode(meta.mode);
        header.set_uid(u64::from(meta.uid));
        header.set_gid(u64::from(meta.gid));
        header.set_mtime(meta.times.mtime.secs.max(0) as u64);

        match (entry.kind, &entry.source) {
            (EntryKind::File, Some(path)) => {
                header.set_entry_type(EntryType::Regular);
                header.set_size(meta.size);
                let reader = ExactReader::open(path, meta.size)?;
                builder.append_data(&mut header, &entry.name, reader)?;
            }
            (EntryKind::Symlink, Some(link_target)) => {
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                builder.append_link(&mut header, &entry.name, link_target)?;
            }
            _ => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, &entry.name, io::empty())?;
            }
        }
    }

    builder.finish()
}

/// Reads exactly the size recorded in the header; a file that shrank after
/// it was stat'ed fails instead of corrupting the stream.
struct ExactReader {
    inner: Take<File>,
    remaining: u64,
}

impl ExactReader {
    fn open(path: &Path, size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: File::open(path)?.take(size),
            remaining: size,
        })
    }
}

impl Read for ExactReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && self.remaining > 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shrank while being archived",
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}
