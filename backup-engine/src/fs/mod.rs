//! Filesystem helpers shared by the archive builder.

pub mod metadata;
pub mod walker;
