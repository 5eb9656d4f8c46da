use serde::Serialize;

use super::Geometry;

/// Fixed CP/M layout constants of a disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DiskDef {
  pub name: &'static str,
  pub seclen: usize,
  pub tracks: usize,
  pub sectrk: usize,
  pub blocksize: usize,
  pub maxdir: usize,
  pub boottrk: usize,
  pub skew: usize,
}

/// Built-in disk definitions.
pub const DISK_DEFS: [DiskDef; 4] = [
  DiskDef {
    name: "ibm-3740",
    seclen: 128,
    tracks: 77,
    sectrk: 26,
    blocksize: 1024,
    maxdir: 64,
    boottrk: 2,
    skew: 6,
  },
  DiskDef {
    name: "k-1013",
    seclen: 256,
    tracks: 77,
    sectrk: 26,
    blocksize: 2048,
    maxdir: 64,
    boottrk: 1,
    skew: 0,
  },
  DiskDef {
    name: "sdcard",
    seclen: 512,
    tracks: 4096,
    sectrk: 16,
    blocksize: 4096,
    maxdir: 512,
    boottrk: 1,
    skew: 0,
  },
  DiskDef {
    name: "c1541",
    seclen: 256,
    tracks: 17,
    sectrk: 17,
    blocksize: 1024,
    maxdir: 64,
    boottrk: 0,
    skew: 0,
  },
];

/// Size of one CP/M directory entry.
pub const DIR_ENTRY_SIZE: usize = 32;

/// Size of one CP/M record.
pub const RECORD_SIZE: usize = 128;

impl DiskDef {
  pub fn lookup(name: &str) -> Option<DiskDef> {
    DISK_DEFS.iter().find(|def| def.name == name).copied()
  }

  pub fn geometry(&self) -> Geometry {
    Geometry {
      sector_size: self.seclen,
      sectors_per_track: self.sectrk,
      track_count: self.tracks,
    }
  }

  pub fn total_size(&self) -> usize {
    self.geometry().total()
  }

  /// Bytes reserved for the boot image.
  pub fn reserved_bytes(&self) -> usize {
    self.boottrk * self.sectrk * self.seclen
  }

  /// Number of allocation blocks in the data area.
  pub fn block_count(&self) -> usize {
    (self.tracks - self.boottrk) * self.sectrk * self.seclen / self.blocksize
  }

  /// Blocks occupied by the directory, always the first ones.
  pub fn directory_blocks(&self) -> usize {
    (self.maxdir * DIR_ENTRY_SIZE).div_ceil(self.blocksize)
  }

  /// Block pointers are 16-bit once DSM no longer fits a byte.
  pub fn wide_pointers(&self) -> bool {
    self.block_count() > 256
  }

  /// Block pointers held by one directory entry.
  pub fn pointers_per_entry(&self) -> usize {
    if self.wide_pointers() { 8 } else { 16 }
  }

  /// Extent mask: logical 16K extents per directory entry, minus one.
  pub fn extent_mask(&self) -> usize {
    (self.pointers_per_entry() * self.blocksize / 16384).saturating_sub(1)
  }

  pub fn records_per_block(&self) -> usize {
    self.blocksize / RECORD_SIZE
  }

  /// Logical to physical sector translation for one track.
  pub fn skew_table(&self) -> Vec<usize> {
    let mut table: Vec<usize> = Vec::with_capacity(self.sectrk);
    let mut j = 0;
    for _ in 0..self.sectrk {
      while table.contains(&j) {
        j = (j + 1) % self.sectrk;
      }
      table.push(j);
      j = (j + self.skew) % self.sectrk;
    }
    table
  }
}
