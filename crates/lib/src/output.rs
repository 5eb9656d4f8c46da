//! Writing artifacts to the output directory.
//!
//! A target `<package>+<local>` (or `<package>:<local>`) lands at
//! `<out>/<package>/<local>`. The graph rejects declarations whose outputs
//! would share a path or nest inside each other. Files are written to a
//! temporary sibling first and renamed into place, so a reader never observes
//! a partially written image.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::artifact::Artifact;
use crate::target::QualifiedName;

/// Output location of `name` relative to the output directory.
pub fn relative_path(name: &QualifiedName) -> PathBuf {
  let mut path = PathBuf::new();
  for component in name.package().split('/').filter(|c| !c.is_empty() && *c != ".") {
    path.push(component);
  }
  path.push(name.local());
  path
}

/// Output location of `name` below `out_dir`.
pub fn artifact_path(out_dir: &Path, name: &QualifiedName) -> PathBuf {
  out_dir.join(relative_path(name))
}

/// Atomically write `artifact` for `name` and return where it went.
pub fn write_artifact(out_dir: &Path, name: &QualifiedName, artifact: &Artifact) -> std::io::Result<PathBuf> {
  let path = artifact_path(out_dir, name);
  let parent = path.parent().unwrap_or(out_dir);
  std::fs::create_dir_all(parent)?;

  let mut temp = NamedTempFile::new_in(parent)?;
  temp.write_all(artifact.bytes())?;
  temp.as_file().sync_all()?;
  temp.persist(&path).map_err(|e| e.error)?;

  debug!(target = %name, path = %path.display(), bytes = artifact.len(), "wrote artifact");
  Ok(path)
}
