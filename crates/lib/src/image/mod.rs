//! Bit-exact storage image formats.
//!
//! - [`cpmfs`]: CP/M 2.2 filesystems laid out by a [`DiskDef`]
//! - [`d64`]: Commodore 1541 disk images, including the CP/M region overlay
//! - [`imd`]: ImageDisk serialization of a flat sector image

pub mod cpmfs;
pub mod d64;
mod diskdef;
pub mod imd;

pub use diskdef::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Physical layout of a flat sector image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
  pub sector_size: usize,
  pub sectors_per_track: usize,
  pub track_count: usize,
}

impl Geometry {
  pub fn total(&self) -> usize {
    self.sector_size * self.sectors_per_track * self.track_count
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
  #[error("boot image is {size} bytes but only {reserved} bytes are reserved")]
  BootImageTooLarge { size: usize, reserved: usize },

  #[error("image full: needed {needed} {resource}, {available} available")]
  ImageFull {
    resource: &'static str,
    needed: usize,
    available: usize,
  },

  #[error("unsupported geometry: {0}")]
  UnsupportedGeometry(String),

  #[error("invalid item '{key}': {reason}")]
  InvalidItem { key: String, reason: String },

  #[error("corrupt image: {0}")]
  Corrupt(String),
}
