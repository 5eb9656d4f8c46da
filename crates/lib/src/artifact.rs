//! Evaluation outputs.

use std::sync::Arc;

use serde::Serialize;

use crate::util::hash::{ContentHash, hash_bytes};

/// The immutable output of evaluating one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
  #[serde(skip)]
  bytes: Arc<[u8]>,
  /// Meaningful length of the payload; for relocatable programs this is the
  /// code size without the trailing relocation tables.
  pub logical_size: usize,
  pub hash: ContentHash,
}

impl Artifact {
  pub fn new(bytes: Vec<u8>) -> Self {
    let logical_size = bytes.len();
    Self::with_logical_size(bytes, logical_size)
  }

  pub fn with_logical_size(bytes: Vec<u8>, logical_size: usize) -> Self {
    let hash = hash_bytes(&bytes);
    Self {
      bytes: bytes.into(),
      logical_size,
      hash,
    }
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn shared(&self) -> Arc<[u8]> {
    Arc::clone(&self.bytes)
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }
}
