//! Target resolution.
//!
//! A source lists glob patterns; every path a pattern matches becomes one
//! backup target with a stable object key derived from the part of the path
//! the wildcards matched.

use crate::config::SourceConfig;
use crate::utils::errors::{BackupError, Result};
use glob::Pattern;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Separator between the differing segments of an object key.
const KEY_SEPARATOR: &str = "___";

/// How exclude patterns are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcludeSyntax {
    /// Unanchored regular expressions (incremental backups)
    Regex,
    /// Shell globs (descriptive backups)
    Glob,
}

#[derive(Debug, Clone)]
pub enum ExcludeSet {
    Regex(Vec<Regex>),
    Glob(Vec<Pattern>),
}

impl ExcludeSet {
    pub fn new(patterns: &[String], syntax: ExcludeSyntax) -> Result<Self> {
        match syntax {
            ExcludeSyntax::Regex => patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        BackupError::Config(format!("invalid exclude regex '{}': {}", p, e))
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(ExcludeSet::Regex),
            ExcludeSyntax::Glob => patterns
                .iter()
                .map(|p| {
                    Pattern::new(p).map_err(|e| {
                        BackupError::Config(format!("invalid exclude pattern '{}': {}", p, e))
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(ExcludeSet::Glob),
        }
    }

    pub fn empty() -> Self {
        ExcludeSet::Glob(Vec::new())
    }

    /// Whether any pattern matches the full path.
    pub fn is_excluded(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        match self {
            ExcludeSet::Regex(set) => set.iter().any(|re| re.is_match(&path)),
            ExcludeSet::Glob(set) => set.iter().any(|p| p.matches(&path)),
        }
    }
}

/// One concrete path to back up.
#[derive(Debug, Clone)]
pub struct Target {
    /// Name of the source that listed the pattern
    pub source: String,
    pub object_key: String,
    pub path: PathBuf,
    pub excludes: Arc<ExcludeSet>,
    pub save_abs_path: bool,
    pub gzip: bool,
}

/// Stable key for `path` as matched by `pattern`: the path segments that
/// differ from the pattern, joined, or the basename when none differ.
pub fn object_key(pattern: &str, path: &Path) -> String {
    let pattern_parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_str = path.to_string_lossy();
    let path_parts: Vec<&str> = path_str.split('/').filter(|s| !s.is_empty()).collect();

    let differing: Vec<&str> = pattern_parts
        .iter()
        .zip(path_parts.iter())
        .filter(|(pat, seg)| pat != seg)
        .map(|(_, seg)| *seg)
        .collect();

    if differing.is_empty() {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path_str.trim_matches('/').replace('/', KEY_SEPARATOR))
    } else {
        differing.join(KEY_SEPARATOR)
    }
}

/// Expand every pattern of `source` into targets.
pub fn resolve(source: &SourceConfig, syntax: ExcludeSyntax) -> Result<Vec<Target>> {
    let excludes = Arc::new(ExcludeSet::new(&source.excludes, syntax)?);
    let mut targets = Vec::new();

    for raw in &source.targets {
        let pattern = match raw.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        // Keys come from comparing segments with the matches, which are absolute
        let pattern = std::path::absolute(pattern)?.to_string_lossy().into_owned();
        let matches = glob::glob(&pattern).map_err(|e| {
            BackupError::Config(format!("invalid target pattern '{}': {}", raw, e))
        })?;

        let mut matched = 0;
        for entry in matches {
            let path = match entry {
                Ok(path) => std::path::absolute(&path)?,
                Err(e) => {
                    tracing::warn!(source = %source.name, error = %e, "Skipping unreadable match");
                    continue;
                }
            };
            matched += 1;

            if excludes.is_excluded(&path) {
                tracing::debug!(source = %source.name, path = %path.display(), "Target excluded");
                continue;
            }

            targets.push(Target {
                source: source.name.clone(),
                object_key: object_key(&pattern, &path),
                path,
                excludes: excludes.clone(),
                save_abs_path: source.save_abs_path,
                gzip: source.gzip,
            });
        }

        if matched == 0 {
            tracing::warn!(source = %source.name, pattern = %raw, "Target pattern matched nothing");
        }
    }

    Ok(targets)
}

/// Reject two units of one job writing under the same object key.
pub fn ensure_unique_keys<'a, I>(keys: I) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    for key in keys {
        if !seen.insert(key) {
            return Err(BackupError::Config(format!(
                "object key '{}' is produced by more than one target",
                key
            )));
        }
    }
    Ok(())
}
