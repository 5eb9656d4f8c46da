//! Types for target evaluation.
//!
//! This module defines the error, report and configuration types used by the
//! [`Engine`](super::Engine).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::artifact::Artifact;
use crate::consts::{ENV_CC, ENV_JOBS};
use crate::rule::RuleError;
use crate::rule::toolchain::{CommandToolchain, FlatToolchain, Toolchain};
use crate::target::QualifiedName;

/// A rule failure attributed to the target that raised it.
#[derive(Debug, Error)]
#[error("{target}: {kind}")]
pub struct EvalError {
  pub target: QualifiedName,
  #[source]
  pub kind: RuleError,
}

/// Outcome of evaluating a set of targets.
#[derive(Debug, Default)]
pub struct BuildReport {
  /// Artifacts of every target that evaluated successfully.
  pub built: BTreeMap<QualifiedName, Artifact>,

  /// Targets whose own evaluation failed, in the order they failed.
  pub failed: Vec<EvalError>,

  /// Targets that were not evaluated because a dependency failed.
  /// Maps skipped target -> the failed (or skipped) dependency.
  pub skipped: BTreeMap<QualifiedName, QualifiedName>,

  /// Rule bodies actually run.
  pub evaluated: usize,

  /// Targets answered from the artifact cache.
  pub cached: usize,
}

impl BuildReport {
  /// Returns true if no target failed or was skipped.
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty()
  }

  pub fn artifact(&self, name: &QualifiedName) -> Option<&Artifact> {
    self.built.get(name)
  }

  /// Look up an artifact by its textual qualified name.
  pub fn artifact_str(&self, name: &str) -> Option<&Artifact> {
    let name: QualifiedName = name.parse().ok()?;
    self.built.get(&name)
  }

  pub fn error(&self, name: &QualifiedName) -> Option<&EvalError> {
    self.failed.iter().find(|e| &e.target == name)
  }

  /// Returns the total number of targets processed.
  pub fn total(&self) -> usize {
    self.built.len() + self.failed.len() + self.skipped.len()
  }
}

/// Which toolchain assembles and links sources.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolchainConfig {
  /// Sources are pre-assembled blobs; linking concatenates.
  #[default]
  Flat,
  /// An external compiler driver.
  Command { cc: String },
}

impl ToolchainConfig {
  pub fn instantiate(&self) -> Arc<dyn Toolchain> {
    match self {
      ToolchainConfig::Flat => Arc::new(FlatToolchain),
      ToolchainConfig::Command { cc } => Arc::new(CommandToolchain::new(cc.clone())),
    }
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("{var} must be a positive integer, got '{value}'")]
  InvalidJobs { var: &'static str, value: String },
}

/// Configuration for target evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
  /// Directory that source file references are relative to.
  pub root: PathBuf,

  /// Maximum number of targets to evaluate in parallel.
  pub parallelism: usize,

  pub toolchain: ToolchainConfig,
}

impl EngineConfig {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      parallelism: num_cpus(),
      toolchain: ToolchainConfig::Flat,
    }
  }

  /// Defaults for `root`, overridden by `IMGFORGE_JOBS` and `IMGFORGE_CC`.
  pub fn from_env(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
    let mut config = Self::new(root);
    if let Ok(value) = std::env::var(ENV_JOBS) {
      config.parallelism = parse_jobs(&value)?;
    }
    if let Ok(cc) = std::env::var(ENV_CC)
      && !cc.trim().is_empty()
    {
      config.toolchain = ToolchainConfig::Command { cc: cc.trim().to_string() };
    }
    Ok(config)
  }

  pub fn with_parallelism(mut self, parallelism: usize) -> Self {
    self.parallelism = parallelism.max(1);
    self
  }

  pub fn with_toolchain(mut self, toolchain: ToolchainConfig) -> Self {
    self.toolchain = toolchain;
    self
  }
}

fn parse_jobs(value: &str) -> Result<usize, ConfigError> {
  match value.trim().parse::<usize>() {
    Ok(n) if n > 0 => Ok(n),
    _ => Err(ConfigError::InvalidJobs {
      var: ENV_JOBS,
      value: value.to_string(),
    }),
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}
