//! Implementation of the `imgforge build` command.
//!
//! This command evaluates the build script, builds the requested targets and
//! writes their artifacts to the output directory as `<out>/<package>/<name>`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use imgforge_lib::execute::{BuildReport, Engine, EngineConfig, ToolchainConfig};
use imgforge_lib::graph::{BuildGraph, TargetId};
use imgforge_lib::output::{artifact_path, write_artifact};

use crate::output::{OutputFormat, format_duration, print_built, print_failed, print_json, print_skipped, print_stat};

/// Command-line overrides for the engine configuration.
#[derive(Debug, Default)]
pub struct BuildOptions {
  pub out_dir: Option<PathBuf>,
  pub jobs: Option<usize>,
  pub cc: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum Status {
  Built,
  Failed,
  Skipped,
  WriteFailed,
}

#[derive(Debug, Serialize)]
struct TargetOutcome {
  target: String,
  status: Status,
  #[serde(skip_serializing_if = "Option::is_none")]
  size: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  path: Option<PathBuf>,
  #[serde(skip_serializing_if = "Option::is_none")]
  error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  failed_dependency: Option<String>,
}

#[derive(Debug, Serialize)]
struct BuildSummary {
  success: bool,
  targets: Vec<TargetOutcome>,
  evaluated: usize,
  cached: usize,
  elapsed_ms: u128,
}

/// Execute the build command.
///
/// Returns `Ok(false)` when any target failed, was skipped or could not be
/// written; only the artifacts of the requested targets are written.
pub fn cmd_build(file: &Path, targets: &[String], options: &BuildOptions, format: OutputFormat) -> Result<bool> {
  let graph = super::load(file)?;
  let root = super::project_root(file);
  let config = engine_config(root, options)?;
  let roots = resolve_roots(&graph, targets)?;
  let out_dir = options.out_dir.clone().unwrap_or_else(|| root.join("out"));

  let engine = Engine::new(graph, config);
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let start = Instant::now();
  let report = rt.block_on(engine.build(&roots));
  let elapsed = start.elapsed();

  let outcomes = collect_outcomes(engine.graph(), &roots, &report, &out_dir);
  let write_failures = outcomes.iter().filter(|o| matches!(o.status, Status::WriteFailed)).count();
  info!(
    built = report.built.len(),
    failed = report.failed.len(),
    skipped = report.skipped.len(),
    write_failures,
    "build finished"
  );

  let summary = BuildSummary {
    success: report.is_success() && write_failures == 0,
    targets: outcomes,
    evaluated: report.evaluated,
    cached: report.cached,
    elapsed_ms: elapsed.as_millis(),
  };

  if format.is_json() {
    print_json(&summary)?;
  } else {
    print_summary(&summary, &out_dir, elapsed);
  }

  Ok(summary.success)
}

fn engine_config(root: &Path, options: &BuildOptions) -> Result<EngineConfig> {
  let mut config = EngineConfig::from_env(root).context("Invalid environment configuration")?;
  if let Some(jobs) = options.jobs {
    if jobs == 0 {
      bail!("--jobs must be a positive integer");
    }
    config = config.with_parallelism(jobs);
  }
  if let Some(cc) = &options.cc {
    config = config.with_toolchain(ToolchainConfig::Command { cc: cc.clone() });
  }
  Ok(config)
}

fn resolve_roots(graph: &BuildGraph, targets: &[String]) -> Result<Vec<TargetId>> {
  if targets.is_empty() {
    return Ok(graph.top_level());
  }
  targets
    .iter()
    .map(|raw| graph.lookup(raw).with_context(|| format!("Cannot build '{}'", raw)))
    .collect()
}

/// One outcome per target of the build, in evaluation order.
///
/// A failed write is recorded against its target and the remaining artifacts
/// are still written.
fn collect_outcomes(
  graph: &BuildGraph,
  roots: &[TargetId],
  report: &BuildReport,
  out_dir: &Path,
) -> Vec<TargetOutcome> {
  let mut outcomes = Vec::new();
  for id in graph.build_order(roots) {
    let name = graph.name(id);
    let mut outcome = TargetOutcome {
      target: name.to_string(),
      status: Status::Built,
      size: None,
      path: None,
      error: None,
      failed_dependency: None,
    };

    if let Some(artifact) = report.artifact(name) {
      outcome.size = Some(artifact.len());
      if roots.contains(&id) {
        match write_artifact(out_dir, name, artifact) {
          Ok(path) => outcome.path = Some(path),
          Err(err) => {
            let path = artifact_path(out_dir, name);
            warn!(target = %name, path = %path.display(), error = %err, "failed to write artifact");
            outcome.status = Status::WriteFailed;
            outcome.error = Some(format!("cannot write {}: {}", path.display(), err));
            outcome.path = Some(path);
          }
        }
      }
    } else if let Some(err) = report.error(name) {
      outcome.status = Status::Failed;
      outcome.error = Some(err.kind.to_string());
    } else if let Some(dep) = report.skipped.get(name) {
      outcome.status = Status::Skipped;
      outcome.failed_dependency = Some(dep.to_string());
    } else {
      continue;
    }
    outcomes.push(outcome);
  }
  outcomes
}

fn print_summary(summary: &BuildSummary, out_dir: &Path, elapsed: std::time::Duration) {
  for outcome in &summary.targets {
    match outcome.status {
      Status::Built => print_built(&outcome.target, outcome.size.unwrap_or_default(), outcome.path.as_deref()),
      Status::Failed | Status::WriteFailed => {
        print_failed(&outcome.target, outcome.error.as_deref().unwrap_or_default())
      }
      Status::Skipped => print_skipped(&outcome.target, outcome.failed_dependency.as_deref().unwrap_or_default()),
    }
  }

  println!();
  print_stat("Targets", &summary.targets.len().to_string());
  print_stat("Evaluated", &summary.evaluated.to_string());
  print_stat("Cached", &summary.cached.to_string());
  print_stat("Output", &out_dir.display().to_string());
  print_stat("Elapsed", &format_duration(elapsed));
}
