//! Hook for collaborators that produce artifacts themselves (database dumps).

use crate::utils::errors::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Produces one finished local artifact per object key. The engine then
/// delivers and rotates it exactly like a file archive.
#[async_trait]
pub trait ArtifactProducer: Send + Sync {
    /// Write the artifact for `object_key` into `tmp_dir`, naming it with
    /// `stamp`, and return its path.
    async fn produce(&self, object_key: &str, tmp_dir: &Path, stamp: &str) -> Result<PathBuf>;
}
