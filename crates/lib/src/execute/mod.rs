//! Target evaluation.
//!
//! This module provides the [`Engine`], which evaluates a resolved
//! [`BuildGraph`]. It handles:
//! - wave ordering from the graph
//! - parallel evaluation of independent targets on a bounded pool
//! - memoization through the [`ArtifactCache`]
//! - failure propagation and skip tracking

pub mod types;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::artifact::Artifact;
use crate::cache::{ArtifactCache, cache_key};
use crate::graph::{BuildGraph, TargetId};
use crate::rule::toolchain::Toolchain;
use crate::rule::{InputSet, RuleError};

pub use types::{BuildReport, ConfigError, EngineConfig, EvalError, ToolchainConfig};

/// Evaluates targets of one build graph.
///
/// The cache lives as long as the engine, so repeated builds with the same
/// engine reuse artifacts whose inputs did not change.
#[derive(Debug)]
pub struct Engine {
  graph: Arc<BuildGraph>,
  config: EngineConfig,
  toolchain: Arc<dyn Toolchain>,
  cache: Arc<ArtifactCache>,
}

impl Engine {
  pub fn new(graph: BuildGraph, config: EngineConfig) -> Self {
    let toolchain = config.toolchain.instantiate();
    Self::with_toolchain(graph, config, toolchain)
  }

  /// Use `toolchain` instead of the one named by the configuration.
  pub fn with_toolchain(graph: BuildGraph, config: EngineConfig, toolchain: Arc<dyn Toolchain>) -> Self {
    Self {
      graph: Arc::new(graph),
      config,
      toolchain,
      cache: Arc::new(ArtifactCache::new()),
    }
  }

  pub fn graph(&self) -> &BuildGraph {
    &self.graph
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn cache(&self) -> &ArtifactCache {
    &self.cache
  }

  /// Evaluate every target nothing else depends on.
  pub async fn build_all(&self) -> BuildReport {
    let roots = self.graph.top_level();
    self.build(&roots).await
  }

  /// Evaluate `roots` and everything they depend on.
  ///
  /// Evaluation proceeds wave by wave. A failing target never stops
  /// unrelated targets; its dependents are recorded as skipped.
  pub async fn build(&self, roots: &[TargetId]) -> BuildReport {
    let waves = self.graph.waves(roots);
    info!(
      targets = waves.iter().map(Vec::len).sum::<usize>(),
      waves = waves.len(),
      parallelism = self.config.parallelism,
      toolchain = %self.toolchain.id(),
      "starting evaluation"
    );

    let hits_before = self.cache.hits();
    let evaluations_before = self.cache.evaluations();

    let mut report = BuildReport::default();
    let mut completed: HashMap<TargetId, Artifact> = HashMap::new();
    let mut blocked: HashSet<TargetId> = HashSet::new();
    let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));

    for (wave_idx, wave) in waves.iter().enumerate() {
      debug!(wave = wave_idx, targets = wave.len(), "evaluating wave");

      let mut ready = Vec::new();
      for &id in wave {
        match self.find_blocked_dependency(id, &blocked) {
          Some(dep) => {
            let name = self.graph.name(id).clone();
            let dep_name = self.graph.name(dep).clone();
            warn!(target = %name, failed_dep = %dep_name, "skipping target due to failed dependency");
            report.skipped.insert(name, dep_name);
            blocked.insert(id);
          }
          None => ready.push(id),
        }
      }

      if ready.is_empty() {
        continue;
      }

      for (id, result) in self.evaluate_wave(&ready, &completed, Arc::clone(&semaphore)).await {
        let name = self.graph.name(id).clone();
        match result {
          Ok(artifact) => {
            info!(target = %name, bytes = artifact.len(), hash = %artifact.hash, "target built");
            report.built.insert(name, artifact.clone());
            completed.insert(id, artifact);
          }
          Err(kind) => {
            error!(target = %name, error = %kind, "target failed");
            blocked.insert(id);
            report.failed.push(EvalError { target: name, kind });
          }
        }
      }
    }

    report.cached = self.cache.hits() - hits_before;
    report.evaluated = self.cache.evaluations() - evaluations_before;

    info!(
      built = report.built.len(),
      failed = report.failed.len(),
      skipped = report.skipped.len(),
      evaluated = report.evaluated,
      cached = report.cached,
      "evaluation complete"
    );
    report
  }

  fn find_blocked_dependency(&self, id: TargetId, blocked: &HashSet<TargetId>) -> Option<TargetId> {
    self.graph.dependencies(id).into_iter().find(|dep| blocked.contains(dep))
  }

  /// Evaluate one wave in parallel. Every target in `targets` gets exactly one
  /// result, in `targets` order.
  async fn evaluate_wave(
    &self,
    targets: &[TargetId],
    completed: &HashMap<TargetId, Artifact>,
    semaphore: Arc<Semaphore>,
  ) -> Vec<(TargetId, Result<Artifact, RuleError>)> {
    let mut join_set = JoinSet::new();

    for &id in targets {
      let artifacts: HashMap<TargetId, Artifact> = self
        .graph
        .dependencies(id)
        .into_iter()
        .filter_map(|dep| completed.get(&dep).map(|a| (dep, a.clone())))
        .collect();
      let task = TargetTask {
        id,
        graph: Arc::clone(&self.graph),
        toolchain: Arc::clone(&self.toolchain),
        cache: Arc::clone(&self.cache),
        root: self.config.root.clone(),
        artifacts,
      };
      let semaphore = Arc::clone(&semaphore);

      join_set.spawn(async move {
        // Acquire semaphore permit inside the task
        let Ok(_permit) = semaphore.acquire().await else {
          return (id, Err(RuleError::Task("worker pool closed".to_string())));
        };
        (id, task.run().await)
      });
    }

    let mut results: HashMap<TargetId, Result<Artifact, RuleError>> = HashMap::new();
    while let Some(join_result) = join_set.join_next().await {
      match join_result {
        Ok((id, result)) => {
          results.insert(id, result);
        }
        Err(e) => {
          // Task panicked; the target is reported below
          error!(error = %e, "evaluation task panicked");
        }
      }
    }

    let ordered: BTreeSet<TargetId> = targets.iter().copied().collect();
    ordered
      .into_iter()
      .map(|id| {
        let result = results
          .remove(&id)
          .unwrap_or_else(|| Err(RuleError::Task("evaluation task panicked".to_string())));
        (id, result)
      })
      .collect()
  }
}

/// Everything one target needs to evaluate off the engine.
struct TargetTask {
  id: TargetId,
  graph: Arc<BuildGraph>,
  toolchain: Arc<dyn Toolchain>,
  cache: Arc<ArtifactCache>,
  root: PathBuf,
  artifacts: HashMap<TargetId, Artifact>,
}

impl TargetTask {
  async fn run(self) -> Result<Artifact, RuleError> {
    let TargetTask {
      id,
      graph,
      toolchain,
      cache,
      root,
      artifacts,
    } = self;

    let inputs = {
      let graph = Arc::clone(&graph);
      tokio::task::spawn_blocking(move || InputSet::gather(graph.rule(id), &artifacts, &root))
        .await
        .map_err(|e| RuleError::Task(e.to_string()))??
    };
    let key = cache_key(graph.rule(id), &inputs, &toolchain.id())?;
    debug!(target = %graph.name(id), key = %key, "resolved cache key");

    cache
      .get_or_try_init(&key, || async move {
        info!(target = %graph.name(id), kind = %graph.rule(id).kind(), "evaluating target");
        tokio::task::spawn_blocking(move || graph.rule(id).evaluate(&inputs, toolchain.as_ref()))
          .await
          .map_err(|e| RuleError::Task(e.to_string()))?
      })
      .await
  }
}
