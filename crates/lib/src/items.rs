//! Ordered item mappings.
//!
//! An item mapping associates destination paths inside an image or archive
//! with the sources that fill them. Keys use the grammar
//! `<destinationPath>[@<attribute>]`; the attribute is interpreted by the
//! format that consumes the mapping (for CP/M images, `sr` marks an entry as
//! system + read-only).
//!
//! Insertion order is preserved because it decides on-disk directory order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
  #[error("item key '{key}' has an empty destination")]
  EmptyDestination { key: String },

  #[error("item key '{key}' has an empty attribute")]
  EmptyAttribute { key: String },

  #[error("duplicate destination '{destination}'")]
  Duplicate { destination: String },
}

/// A parsed `<destination>[@<attribute>]` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
  pub destination: String,
  pub attribute: Option<String>,
}

impl ItemKey {
  pub fn new(destination: &str) -> Self {
    Self {
      destination: destination.to_string(),
      attribute: None,
    }
  }
}

impl FromStr for ItemKey {
  type Err = ItemError;

  fn from_str(key: &str) -> Result<Self, Self::Err> {
    let (destination, attribute) = match key.rsplit_once('@') {
      Some((dest, attr)) => {
        if attr.is_empty() {
          return Err(ItemError::EmptyAttribute { key: key.to_string() });
        }
        (dest, Some(attr.to_string()))
      }
      None => (key, None),
    };
    if destination.is_empty() {
      return Err(ItemError::EmptyDestination { key: key.to_string() });
    }
    Ok(Self {
      destination: destination.to_string(),
      attribute,
    })
  }
}

impl fmt::Display for ItemKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.attribute {
      Some(attr) => write!(f, "{}@{}", self.destination, attr),
      None => write!(f, "{}", self.destination),
    }
  }
}

/// One entry of an item mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item<V> {
  pub key: ItemKey,
  pub source: V,
}

/// An ordered mapping from destinations to sources.
///
/// Destinations are unique. The attribute is not part of the identity, so an
/// overlay may change the attribute of an existing destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMapping<V> {
  entries: Vec<Item<V>>,
}

impl<V> Default for ItemMapping<V> {
  fn default() -> Self {
    Self { entries: Vec::new() }
  }
}

impl<V> ItemMapping<V> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append an entry; fails if the destination is already mapped.
  pub fn insert(&mut self, key: ItemKey, source: V) -> Result<(), ItemError> {
    if self.position(&key.destination).is_some() {
      return Err(ItemError::Duplicate {
        destination: key.destination,
      });
    }
    self.entries.push(Item { key, source });
    Ok(())
  }

  /// Parse `key` and append it.
  pub fn insert_str(&mut self, key: &str, source: V) -> Result<(), ItemError> {
    self.insert(key.parse()?, source)
  }

  /// Merge `overlay` into `self`, last write wins.
  ///
  /// A destination present in both keeps its original position but takes the
  /// overlay's key and source. Destinations only in `overlay` are appended in
  /// overlay order.
  pub fn union(mut self, overlay: ItemMapping<V>) -> Self {
    for item in overlay.entries {
      match self.position(&item.key.destination) {
        Some(idx) => self.entries[idx] = item,
        None => self.entries.push(item),
      }
    }
    self
  }

  pub fn get(&self, destination: &str) -> Option<&Item<V>> {
    self.position(destination).map(|idx| &self.entries[idx])
  }

  pub fn iter(&self) -> impl Iterator<Item = &Item<V>> {
    self.entries.iter()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Convert every source, preserving order and keys.
  pub fn try_map<W, E>(&self, mut f: impl FnMut(&V) -> Result<W, E>) -> Result<ItemMapping<W>, E> {
    let entries = self
      .entries
      .iter()
      .map(|item| {
        Ok(Item {
          key: item.key.clone(),
          source: f(&item.source)?,
        })
      })
      .collect::<Result<Vec<_>, E>>()?;
    Ok(ItemMapping { entries })
  }

  fn position(&self, destination: &str) -> Option<usize> {
    self.entries.iter().position(|item| item.key.destination == destination)
  }
}

impl<V> IntoIterator for ItemMapping<V> {
  type Item = Item<V>;
  type IntoIter = std::vec::IntoIter<Item<V>>;

  fn into_iter(self) -> Self::IntoIter {
    self.entries.into_iter()
  }
}
