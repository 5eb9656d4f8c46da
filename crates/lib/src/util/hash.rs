//! Hashing utilities for artifact identity and cache keys.
//!
//! This module provides:
//! - `ObjectHash`: A truncated 20-character hash used as a cache key
//! - `ContentHash`: A full 64-character hash of artifact bytes
//! - `Hashable`: Fingerprinting of any serializable declaration

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::consts::OBJ_HASH_PREFIX_LEN;

pub type HashError = serde_json::Error;

/// A truncated hash identifying a unique evaluation.
///
/// # Format
///
/// The hash is a lowercase hexadecimal string, e.g., `"a1b2c3d4e5f6789012ab"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ObjectHash, HashError> {
    let serialized = serde_json::to_string(self)?;
    Ok(truncate(Sha256::digest(serialized.as_bytes()).as_slice()))
  }
}

/// A full 64-character SHA-256 hash of artifact content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash(hex::encode(Sha256::digest(data)))
}

/// Incremental builder for cache keys.
///
/// Parts are length-prefixed so that `["ab", "c"]` and `["a", "bc"]` never
/// collide.
#[derive(Default)]
pub struct KeyHasher {
  hasher: Sha256,
}

impl KeyHasher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn update(&mut self, part: &[u8]) -> &mut Self {
    self.hasher.update((part.len() as u64).to_le_bytes());
    self.hasher.update(part);
    self
  }

  pub fn finish(self) -> ObjectHash {
    truncate(self.hasher.finalize().as_slice())
  }
}

fn truncate(digest: &[u8]) -> ObjectHash {
  let full = hex::encode(digest);
  ObjectHash(full[..OBJ_HASH_PREFIX_LEN].to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Serialize)]
  struct Decl {
    name: String,
    size: u64,
  }

  impl Hashable for Decl {}

  #[test]
  fn object_hash_is_truncated() {
    let hash = Decl {
      name: "a".to_string(),
      size: 1,
    }
    .compute_hash()
    .unwrap();
    assert_eq!(hash.0.len(), OBJ_HASH_PREFIX_LEN);
  }

  #[test]
  fn object_hash_changes_with_fields() {
    let a = Decl {
      name: "a".to_string(),
      size: 1,
    };
    let b = Decl {
      name: "a".to_string(),
      size: 2,
    };
    assert_ne!(a.compute_hash().unwrap(), b.compute_hash().unwrap());
  }

  #[test]
  fn content_hash_is_full_length() {
    let hash = hash_bytes(b"hello world");
    assert_eq!(hash.0.len(), 64);
    assert_eq!(hash, hash_bytes(b"hello world"));
  }

  #[test]
  fn key_parts_are_length_prefixed() {
    let mut a = KeyHasher::new();
    a.update(b"ab").update(b"c");
    let mut b = KeyHasher::new();
    b.update(b"a").update(b"bc");
    assert_ne!(a.finish(), b.finish());
  }
}
