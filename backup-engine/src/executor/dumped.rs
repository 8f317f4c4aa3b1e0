//! Artifacts produced during a run and waiting for delivery.

use crate::archive::ArchiveOutput;
use crate::layout::Layout;
use crate::snapshot::Generation;
use std::path::{Path, PathBuf};

/// One produced artifact plus its sidecars, tracked until job cleanup.
#[derive(Debug, Clone)]
pub struct DumpedObject {
    pub object_key: String,
    pub layout: Layout,
    pub artifact: PathBuf,
    /// Snapshot written with an incremental archive
    pub sidecar: Option<PathBuf>,
    /// Generation marker written on reinit
    pub init_marker: Option<PathBuf>,
    /// Metadata generations the sidecar replaces on every backend
    pub generations: Vec<Generation>,
    /// Set once every backend received the object without error
    pub delivered: bool,
}

impl DumpedObject {
    /// A dump handed over by an external producer, rotated in buckets.
    pub fn bucketed(object_key: impl Into<String>, artifact: PathBuf) -> Self {
        Self {
            object_key: object_key.into(),
            layout: Layout::Bucketed,
            artifact,
            sidecar: None,
            init_marker: None,
            generations: Vec::new(),
            delivered: false,
        }
    }

    /// A full file archive, rotated in buckets.
    pub fn from_full_archive(object_key: impl Into<String>, output: ArchiveOutput) -> Self {
        Self::bucketed(object_key, output.artifact)
    }

    /// An incremental archive stored by year and month.
    pub fn from_incremental_archive(
        object_key: impl Into<String>,
        output: ArchiveOutput,
        generations: Vec<Generation>,
    ) -> Self {
        Self {
            object_key: object_key.into(),
            layout: Layout::Generational,
            artifact: output.artifact,
            sidecar: output.sidecar,
            init_marker: output.init_marker,
            generations,
            delivered: false,
        }
    }

    /// Every local file belonging to this object.
    pub fn local_files(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.artifact.as_path())
            .chain(self.sidecar.as_deref())
            .chain(self.init_marker.as_deref())
    }
}
