//! CP/M 2.2 filesystem images.
//!
//! The data area starts after `boottrk` reserved tracks and is divided into
//! allocation blocks. The directory occupies the first blocks; every
//! directory entry describes one extent of a file: up to 16 8-bit (or 8
//! 16-bit) block pointers and a record count. Sectors within a track are
//! addressed through the disk definition's skew table.

use std::fmt;

use tracing::debug;

use super::{DIR_ENTRY_SIZE, DiskDef, ImageError, RECORD_SIZE};

/// Marker byte of an unused directory entry.
pub const EMPTY_ENTRY: u8 = 0xE5;

/// A CP/M filename with user area and attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpmName {
  pub user: u8,
  pub name: String,
  pub ext: String,
  pub read_only: bool,
  pub system: bool,
  pub archive: bool,
}

impl CpmName {
  /// Parse `[user:]NAME.EXT` with an optional attribute string.
  ///
  /// Attribute letters: `s` system, `r` read-only, `a` archive.
  pub fn parse(destination: &str, attribute: Option<&str>) -> Result<Self, ImageError> {
    let invalid = |reason: String| ImageError::InvalidItem {
      key: destination.to_string(),
      reason,
    };

    let (user, file) = match destination.split_once(':') {
      Some((user, file)) => {
        let user: u8 = user
          .parse()
          .map_err(|_| invalid(format!("'{}' is not a user number", user)))?;
        if user > 15 {
          return Err(invalid(format!("user {} is out of range 0-15", user)));
        }
        (user, file)
      }
      None => (0, destination),
    };

    let (name, ext) = file.split_once('.').unwrap_or((file, ""));
    let name = name.to_ascii_uppercase();
    let ext = ext.to_ascii_uppercase();
    if name.is_empty() || name.len() > 8 || ext.len() > 3 {
      return Err(invalid("filename must be 8.3".to_string()));
    }
    if let Some(c) = name
      .chars()
      .chain(ext.chars())
      .find(|c| !c.is_ascii_graphic() || "<>.,;:=?*[]%|()/\\".contains(*c))
    {
      return Err(invalid(format!("character '{}' is not allowed", c)));
    }

    let mut parsed = Self {
      user,
      name,
      ext,
      read_only: false,
      system: false,
      archive: false,
    };
    for flag in attribute.unwrap_or_default().chars() {
      match flag.to_ascii_lowercase() {
        's' => parsed.system = true,
        'r' => parsed.read_only = true,
        'a' => parsed.archive = true,
        other => return Err(invalid(format!("unknown attribute '{}'", other))),
      }
    }
    Ok(parsed)
  }

  /// Same file, regardless of attributes.
  pub fn same_file(&self, other: &CpmName) -> bool {
    self.user == other.user && self.name == other.name && self.ext == other.ext
  }

  fn encode(&self) -> [u8; 12] {
    let mut raw = [b' '; 12];
    raw[0] = self.user;
    raw[1..1 + self.name.len()].copy_from_slice(self.name.as_bytes());
    raw[9..9 + self.ext.len()].copy_from_slice(self.ext.as_bytes());
    if self.read_only {
      raw[9] |= 0x80;
    }
    if self.system {
      raw[10] |= 0x80;
    }
    if self.archive {
      raw[11] |= 0x80;
    }
    raw
  }

  fn decode(raw: &[u8]) -> Self {
    let text = |bytes: &[u8]| {
      bytes
        .iter()
        .map(|b| (b & 0x7F) as char)
        .collect::<String>()
        .trim_end()
        .to_string()
    };
    Self {
      user: raw[0],
      name: text(&raw[1..9]),
      ext: text(&raw[9..12]),
      read_only: raw[9] & 0x80 != 0,
      system: raw[10] & 0x80 != 0,
      archive: raw[11] & 0x80 != 0,
    }
  }
}

impl fmt::Display for CpmName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.ext.is_empty() {
      write!(f, "{}:{}", self.user, self.name)
    } else {
      write!(f, "{}:{}.{}", self.user, self.name, self.ext)
    }
  }
}

/// One decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
  pub name: CpmName,
  /// Logical extent number, `S2 << 5 | EX`.
  pub extent: usize,
  /// Records described by this entry.
  pub records: usize,
  pub blocks: Vec<usize>,
}

/// An in-memory CP/M filesystem.
#[derive(Debug, Clone)]
pub struct CpmImage {
  def: DiskDef,
  skew: Vec<usize>,
  data: Vec<u8>,
  allocated: Vec<bool>,
}

impl CpmImage {
  /// A zero-filled image with an empty directory.
  pub fn format(def: DiskDef) -> Self {
    let mut image = Self::blank(def, vec![0; def.total_size()]);
    let empty = vec![EMPTY_ENTRY; def.blocksize];
    for block in 0..def.directory_blocks() {
      image.write_block(block, &empty);
    }
    image
  }

  /// Load an existing image, recovering the allocation map from its directory.
  pub fn open(def: DiskDef, data: Vec<u8>) -> Result<Self, ImageError> {
    if data.len() != def.total_size() {
      return Err(ImageError::UnsupportedGeometry(format!(
        "{} image must be {} bytes, got {}",
        def.name,
        def.total_size(),
        data.len()
      )));
    }
    let mut image = Self::blank(def, data);
    let entries = image.entries()?;
    for entry in &entries {
      for &block in &entry.blocks {
        image.allocated[block] = true;
      }
    }
    Ok(image)
  }

  fn blank(def: DiskDef, data: Vec<u8>) -> Self {
    let mut allocated = vec![false; def.block_count()];
    for slot in allocated.iter_mut().take(def.directory_blocks()) {
      *slot = true;
    }
    Self {
      def,
      skew: def.skew_table(),
      data,
      allocated,
    }
  }

  pub fn def(&self) -> &DiskDef {
    &self.def
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.data
  }

  /// Place the boot image at the start of the reserved tracks.
  pub fn write_boot(&mut self, boot: &[u8]) -> Result<(), ImageError> {
    let reserved = self.def.reserved_bytes();
    if boot.len() > reserved {
      return Err(ImageError::BootImageTooLarge {
        size: boot.len(),
        reserved,
      });
    }
    self.data[..boot.len()].copy_from_slice(boot);
    Ok(())
  }

  pub fn free_blocks(&self) -> usize {
    self.allocated.iter().filter(|used| !**used).count()
  }

  pub fn free_entries(&self) -> usize {
    self.entry_slots().filter(|&slot| self.data[slot] == EMPTY_ENTRY).count()
  }

  /// Write a file, allocating blocks first-fit.
  pub fn add_file(&mut self, name: &CpmName, contents: &[u8]) -> Result<(), ImageError> {
    if self.entries()?.iter().any(|e| e.name.same_file(name)) {
      return Err(ImageError::InvalidItem {
        key: name.to_string(),
        reason: "file already exists on the image".to_string(),
      });
    }

    let blocksize = self.def.blocksize;
    let ptrs = self.def.pointers_per_entry();
    let block_count = contents.len().div_ceil(blocksize);
    let entry_count = block_count.div_ceil(ptrs).max(1);

    let available = self.free_blocks();
    if block_count > available {
      return Err(ImageError::ImageFull {
        resource: "blocks",
        needed: block_count,
        available,
      });
    }
    let slots: Vec<usize> = self
      .entry_slots()
      .filter(|&slot| self.data[slot] == EMPTY_ENTRY)
      .take(entry_count)
      .collect();
    if slots.len() < entry_count {
      return Err(ImageError::ImageFull {
        resource: "directory entries",
        needed: entry_count,
        available: self.free_entries(),
      });
    }

    let mut blocks = Vec::with_capacity(block_count);
    for (block, used) in self.allocated.iter_mut().enumerate() {
      if blocks.len() == block_count {
        break;
      }
      if !*used {
        *used = true;
        blocks.push(block);
      }
    }
    for (&block, chunk) in blocks.iter().zip(contents.chunks(blocksize)) {
      self.write_block(block, chunk);
    }

    let total_records = contents.len().div_ceil(RECORD_SIZE);
    let records_per_entry = ptrs * self.def.records_per_block();
    let exm = self.def.extent_mask();
    let encoded = name.encode();
    for (i, &slot) in slots.iter().enumerate() {
      let records = total_records.saturating_sub(i * records_per_entry).min(records_per_entry);
      let full_extents = records.saturating_sub(1) / 128;
      let extent = i * (exm + 1) + full_extents;
      let rc = records - full_extents * 128;
      let entry_blocks = blocks.iter().skip(i * ptrs).take(ptrs);

      let mut raw = [0u8; DIR_ENTRY_SIZE];
      raw[..12].copy_from_slice(&encoded);
      raw[12] = (extent & 0x1F) as u8;
      raw[13] = 0;
      raw[14] = ((extent >> 5) & 0x3F) as u8;
      raw[15] = rc as u8;
      for (p, &block) in entry_blocks.enumerate() {
        if self.def.wide_pointers() {
          raw[16 + p * 2..18 + p * 2].copy_from_slice(&(block as u16).to_le_bytes());
        } else {
          raw[16 + p] = block as u8;
        }
      }
      self.data[slot..slot + DIR_ENTRY_SIZE].copy_from_slice(&raw);
    }

    debug!(
      file = %name,
      bytes = contents.len(),
      blocks = ?blocks,
      extents = entry_count,
      "placed file"
    );
    Ok(())
  }

  /// All used directory entries in directory order.
  pub fn entries(&self) -> Result<Vec<DirEntry>, ImageError> {
    let exm = self.def.extent_mask();
    let mut entries = Vec::new();
    for slot in self.entry_slots() {
      let raw = &self.data[slot..slot + DIR_ENTRY_SIZE];
      if raw[0] > 15 {
        continue;
      }
      let ex = raw[12] as usize;
      let s2 = raw[14] as usize;
      let rc = raw[15] as usize;
      let pointers: Vec<usize> = if self.def.wide_pointers() {
        raw[16..]
          .chunks(2)
          .map(|p| u16::from_le_bytes([p[0], p[1]]) as usize)
          .collect()
      } else {
        raw[16..].iter().map(|&p| p as usize).collect()
      };
      let blocks: Vec<usize> = pointers.into_iter().filter(|&p| p != 0).collect();
      if let Some(bad) = blocks.iter().find(|&&b| b >= self.allocated.len()) {
        return Err(ImageError::Corrupt(format!(
          "directory entry at offset {} points at block {} beyond the disk",
          slot, bad
        )));
      }
      entries.push(DirEntry {
        name: CpmName::decode(raw),
        extent: (s2 << 5) | ex,
        records: (ex & exm) * 128 + rc,
        blocks,
      });
    }
    Ok(entries)
  }

  /// Read a file back as whole records. Returns `None` if it does not exist.
  pub fn read_file(&self, name: &CpmName) -> Result<Option<Vec<u8>>, ImageError> {
    let mut extents: Vec<DirEntry> = self.entries()?.into_iter().filter(|e| e.name.same_file(name)).collect();
    if extents.is_empty() {
      return Ok(None);
    }
    extents.sort_by_key(|e| e.extent);

    let mut contents = Vec::new();
    for entry in extents {
      let mut bytes = Vec::with_capacity(entry.blocks.len() * self.def.blocksize);
      for block in &entry.blocks {
        bytes.extend_from_slice(&self.read_block(*block));
      }
      bytes.truncate(entry.records * RECORD_SIZE);
      contents.extend_from_slice(&bytes);
    }
    Ok(Some(contents))
  }

  /// Byte offset of the `index`th sector of `block`.
  pub fn sector_offset(&self, block: usize, index: usize) -> usize {
    let logical = block * (self.def.blocksize / self.def.seclen) + index;
    let track = self.def.boottrk + logical / self.def.sectrk;
    let sector = self.skew[logical % self.def.sectrk];
    (track * self.def.sectrk + sector) * self.def.seclen
  }

  fn write_block(&mut self, block: usize, bytes: &[u8]) {
    let seclen = self.def.seclen;
    for index in 0..self.def.blocksize / seclen {
      let offset = self.sector_offset(block, index);
      let start = (index * seclen).min(bytes.len());
      let end = ((index + 1) * seclen).min(bytes.len());
      let sector = &mut self.data[offset..offset + seclen];
      sector.fill(0);
      sector[..end - start].copy_from_slice(&bytes[start..end]);
    }
  }

  fn read_block(&self, block: usize) -> Vec<u8> {
    let seclen = self.def.seclen;
    let mut bytes = Vec::with_capacity(self.def.blocksize);
    for index in 0..self.def.blocksize / seclen {
      let offset = self.sector_offset(block, index);
      bytes.extend_from_slice(&self.data[offset..offset + seclen]);
    }
    bytes
  }

  /// Byte offsets of every directory slot, in directory order.
  fn entry_slots(&self) -> impl Iterator<Item = usize> + '_ {
    let per_sector = self.def.seclen / DIR_ENTRY_SIZE;
    let sectors_per_block = self.def.blocksize / self.def.seclen;
    (0..self.def.maxdir).map(move |n| {
      let sector = n / per_sector;
      let block = sector / sectors_per_block;
      self.sector_offset(block, sector % sectors_per_block) + (n % per_sector) * DIR_ENTRY_SIZE
    })
  }
}
