//! The target registry.
//!
//! Holds every declared target in declaration order, keyed by qualified name.
//! Declaration order is significant: it is the tie-breaker for evaluation
//! order and the source of [`TargetId`](crate::graph::TargetId)s.

use std::collections::HashMap;

use tracing::debug;

use crate::graph::{BuildGraph, GraphError};
use crate::target::{QualifiedName, RuleArgs, RuleKind, TargetDecl};

#[derive(Debug, Default, Clone)]
pub struct Registry {
  targets: Vec<TargetDecl>,
  index: HashMap<QualifiedName, usize>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a target. Fails with `DuplicateName` if the name is taken.
  pub fn declare(&mut self, target: TargetDecl) -> Result<QualifiedName, GraphError> {
    if self.index.contains_key(&target.name) {
      return Err(GraphError::DuplicateName {
        name: target.name.to_string(),
      });
    }
    let name = target.name.clone();
    debug!(target_name = %name, kind = %target.rule.kind(), "declared target");
    self.index.insert(name.clone(), self.targets.len());
    self.targets.push(target);
    Ok(name)
  }

  /// Declare `package+name` (or `package:attr` for a name written `:attr`)
  /// from raw rule options.
  pub fn declare_rule(
    &mut self,
    package: &str,
    kind: RuleKind,
    name: &str,
    args: RuleArgs,
  ) -> Result<QualifiedName, GraphError> {
    let decl = args.into_decl(kind, package, name)?;
    self.declare(decl)
  }

  /// Look up a declared target. Fails with `UnknownTarget` if undeclared.
  pub fn resolve(&self, name: &QualifiedName) -> Result<&TargetDecl, GraphError> {
    self
      .position(name)
      .map(|idx| &self.targets[idx])
      .ok_or_else(|| GraphError::UnknownTarget {
        reference: name.to_string(),
        from: "<root>".to_string(),
      })
  }

  /// Parse `raw` as a qualified name and look it up.
  pub fn resolve_str(&self, raw: &str) -> Result<&TargetDecl, GraphError> {
    let name: QualifiedName = raw.parse().map_err(|source| GraphError::InvalidName {
      target: raw.to_string(),
      source,
    })?;
    self.resolve(&name)
  }

  /// Declaration index of `name`.
  pub fn position(&self, name: &QualifiedName) -> Option<usize> {
    self.index.get(name).copied()
  }

  pub fn contains(&self, name: &QualifiedName) -> bool {
    self.index.contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.targets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.targets.is_empty()
  }

  /// Targets in declaration order.
  pub fn iter(&self) -> impl Iterator<Item = &TargetDecl> {
    self.targets.iter()
  }

  pub fn targets(&self) -> &[TargetDecl] {
    &self.targets
  }

  /// Transitive closure of `root` in evaluation order.
  ///
  /// Every dependency precedes its dependents; ties are broken by
  /// declaration order.
  pub fn build_order(&self, root: &str) -> Result<Vec<QualifiedName>, GraphError> {
    let graph = BuildGraph::from_registry(self)?;
    let id = graph.lookup(root)?;
    Ok(graph.build_order(&[id]).into_iter().map(|id| graph.name(id).clone()).collect())
  }
}
