//! Shared helpers for library integration tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use imgforge_lib::eval::load_graph;
use imgforge_lib::execute::{Engine, EngineConfig};
use imgforge_lib::graph::BuildGraph;
use imgforge_lib::rule::toolchain::{FlatToolchain, SourceUnit, Toolchain, ToolchainError};
use tempfile::TempDir;

/// A throwaway project directory with a `build.lua` at its root.
pub struct Project {
  pub temp: TempDir,
}

impl Project {
  pub fn new(build_lua: &str) -> Self {
    let project = Self {
      temp: TempDir::new().unwrap(),
    };
    project.write("build.lua", build_lua);
    project
  }

  pub fn root(&self) -> &Path {
    self.temp.path()
  }

  /// Write a file relative to the project root.
  pub fn write(&self, relative_path: &str, content: impl AsRef<[u8]>) {
    let path = self.root().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  pub fn build_file(&self) -> PathBuf {
    self.root().join("build.lua")
  }

  pub fn graph(&self) -> BuildGraph {
    load_graph(&self.build_file()).unwrap()
  }

  pub fn engine(&self) -> Engine {
    Engine::new(self.graph(), EngineConfig::new(self.root()).with_parallelism(4))
  }

  pub fn engine_with(&self, toolchain: Arc<dyn Toolchain>) -> Engine {
    Engine::with_toolchain(
      self.graph(),
      EngineConfig::new(self.root()).with_parallelism(4),
      toolchain,
    )
  }
}

/// Flat toolchain that counts how often it runs.
#[derive(Debug, Default)]
pub struct CountingToolchain {
  pub assembled: AtomicUsize,
  pub linked: AtomicUsize,
}

impl CountingToolchain {
  pub fn assembled(&self) -> usize {
    self.assembled.load(Ordering::SeqCst)
  }

  pub fn linked(&self) -> usize {
    self.linked.load(Ordering::SeqCst)
  }
}

impl Toolchain for CountingToolchain {
  fn id(&self) -> String {
    FlatToolchain.id()
  }

  fn assemble(
    &self,
    sources: &[SourceUnit],
    flags: &[String],
    headers: &BTreeMap<String, Arc<[u8]>>,
  ) -> Result<Vec<u8>, ToolchainError> {
    self.assembled.fetch_add(1, Ordering::SeqCst);
    FlatToolchain.assemble(sources, flags, headers)
  }

  fn link(&self, objects: &[Vec<u8>], script: Option<&str>) -> Result<Vec<u8>, ToolchainError> {
    self.linked.fetch_add(1, Ordering::SeqCst);
    FlatToolchain.link(objects, script)
  }
}
