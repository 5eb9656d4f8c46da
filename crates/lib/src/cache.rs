//! Memoized artifacts.
//!
//! Keys are derived from a target's resolved rule plus the content hashes of
//! everything it reads, so two targets with identical rules and inputs share
//! one evaluation. Each key owns an async `OnceCell`: concurrent requests for
//! the same key wait for a single construction, and a failed construction
//! leaves the cell empty.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use tracing::trace;

use crate::artifact::Artifact;
use crate::rule::{InputSet, Rule, RuleError};
use crate::util::hash::{Hashable, KeyHasher, ObjectHash};

/// Cache key for evaluating `rule` over `inputs` with the toolchain `toolchain_id`.
pub fn cache_key(rule: &Rule, inputs: &InputSet, toolchain_id: &str) -> Result<ObjectHash, RuleError> {
  let rule_hash = rule
    .compute_hash()
    .map_err(|e| RuleError::Task(format!("cannot fingerprint rule: {}", e)))?;
  let mut hasher = KeyHasher::new();
  hasher.update(rule_hash.0.as_bytes()).update(toolchain_id.as_bytes());
  for input in rule.inputs() {
    hasher.update(inputs.content_hash(&input)?.0.as_bytes());
  }
  Ok(hasher.finish())
}

#[derive(Debug, Default)]
pub struct ArtifactCache {
  cells: Mutex<HashMap<ObjectHash, Arc<OnceCell<Artifact>>>>,
  hits: AtomicUsize,
  evaluations: AtomicUsize,
}

impl ArtifactCache {
  pub fn new() -> Self {
    Self::default()
  }

  fn cell(&self, key: &ObjectHash) -> Arc<OnceCell<Artifact>> {
    let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(cells.entry(key.clone()).or_default())
  }

  /// A completed artifact for `key`, if any.
  pub fn get(&self, key: &ObjectHash) -> Option<Artifact> {
    let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
    cells.get(key).and_then(|cell| cell.get().cloned())
  }

  /// Return the artifact for `key`, running `init` only if no construction
  /// has succeeded yet.
  pub async fn get_or_try_init<F, Fut, E>(&self, key: &ObjectHash, init: F) -> Result<Artifact, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Artifact, E>>,
  {
    let cell = self.cell(key);
    if let Some(artifact) = cell.get() {
      self.hits.fetch_add(1, Ordering::Relaxed);
      trace!(key = %key, "cache hit");
      return Ok(artifact.clone());
    }

    let mut constructed = false;
    let artifact = cell
      .get_or_try_init(|| {
        constructed = true;
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        init()
      })
      .await?;
    if !constructed {
      self.hits.fetch_add(1, Ordering::Relaxed);
    }
    Ok(artifact.clone())
  }

  /// Lookups answered without evaluating.
  pub fn hits(&self) -> usize {
    self.hits.load(Ordering::Relaxed)
  }

  /// Constructions started, successful or not.
  pub fn evaluations(&self) -> usize {
    self.evaluations.load(Ordering::Relaxed)
  }

  /// Number of completed artifacts.
  pub fn len(&self) -> usize {
    let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
    cells.values().filter(|cell| cell.initialized()).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
