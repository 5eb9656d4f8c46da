mod build;
mod list;
mod order;

use std::path::Path;

use anyhow::{Context, Result};

use imgforge_lib::eval::load_graph;
use imgforge_lib::graph::BuildGraph;

pub use build::{BuildOptions, cmd_build};
pub use list::cmd_list;
pub use order::cmd_order;

/// Evaluate the build script at `file` and resolve its graph.
fn load(file: &Path) -> Result<BuildGraph> {
  load_graph(file).with_context(|| format!("Failed to evaluate build script: {}", file.display()))
}

/// Directory source references are relative to.
fn project_root(file: &Path) -> &Path {
  match file.parent() {
    Some(parent) if !parent.as_os_str().is_empty() => parent,
    _ => Path::new("."),
  }
}
