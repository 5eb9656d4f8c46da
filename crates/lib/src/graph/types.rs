//! Graph identifiers and declaration-phase errors.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::items::ItemError;
use crate::target::NameError;

/// Strong identifier of a declared target: its declaration index.
///
/// Ordering by id is declaration order, which is used to break ties
/// deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetId(pub usize);

impl fmt::Display for TargetId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Errors raised while declaring targets or resolving the graph.
///
/// All of these are reported before any evaluation begins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  /// Two targets share a qualified name.
  #[error("duplicate target name: {name}")]
  DuplicateName { name: String },

  /// A reference names a target that was never declared.
  #[error("unknown target '{reference}' referenced from {from}")]
  UnknownTarget { reference: String, from: String },

  /// A target transitively depends on itself.
  #[error("dependency cycle detected: {}", chain.join(" -> "))]
  CyclicDependency { chain: Vec<String> },

  /// A name or reference could not be parsed.
  #[error("in {target}: {source}")]
  InvalidName {
    target: String,
    #[source]
    source: NameError,
  },

  /// An item key could not be parsed.
  #[error("in {target}: invalid item '{key}': {source}")]
  InvalidItem {
    target: String,
    key: String,
    #[source]
    source: ItemError,
  },

  /// The same destination appears twice in one item mapping.
  #[error("in {target}: duplicate item destination '{destination}'")]
  DuplicateItem { target: String, destination: String },

  /// The rule declaration is inconsistent with its kind.
  #[error("in {target}: {message}")]
  InvalidRule { target: String, message: String },

  /// Two targets would write to the same output path, or one target's
  /// output would have to be a directory holding another's.
  #[error("output of {target} at '{path}' collides with {other}")]
  OutputCollision { target: String, other: String, path: String },
}

impl GraphError {
  pub(crate) fn item(target: &str, key: &str, err: ItemError) -> Self {
    match err {
      ItemError::Duplicate { destination } => GraphError::DuplicateItem {
        target: target.to_string(),
        destination,
      },
      other => GraphError::InvalidItem {
        target: target.to_string(),
        key: key.to_string(),
        source: other,
      },
    }
  }

  pub(crate) fn invalid_rule(target: &str, message: impl Into<String>) -> Self {
    GraphError::InvalidRule {
      target: target.to_string(),
      message: message.into(),
    }
  }
}
