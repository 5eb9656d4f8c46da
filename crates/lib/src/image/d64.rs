//! Commodore 1541 (`.d64`) disk images.
//!
//! 35 tracks with zoned sector counts, 256-byte sectors. Track 18 holds the
//! BAM (sector 0) and the directory chain (from sector 1). Data sectors carry
//! a two-byte link to the next sector; the last sector stores `0` and the
//! index of its last used byte instead.
//!
//! CP/M-65 uses the first 17 sectors of tracks 19-35 as a flat 289-sector
//! CP/M disk (the `c1541` disk definition). The region is reserved in the BAM
//! so Commodore DOS leaves it alone.

use tracing::debug;

use super::ImageError;

pub const TRACKS: u8 = 35;
pub const SECTOR_SIZE: usize = 256;
pub const D64_SIZE: usize = 174_848;

pub const DIR_TRACK: u8 = 18;
const DIR_INTERLEAVE: u8 = 3;
const FILE_INTERLEAVE: u8 = 10;
const DIR_ENTRIES_PER_SECTOR: usize = 8;
const DATA_PER_SECTOR: usize = SECTOR_SIZE - 2;

/// Closed PRG file.
pub const FILE_TYPE_PRG: u8 = 0x82;

pub const CPM_FIRST_TRACK: u8 = 19;
pub const CPM_SECTORS: u8 = 17;

const DISK_ID: &[u8; 2] = b"65";
const DOS_TYPE: &[u8; 2] = b"2A";
const PAD: u8 = 0xA0;

pub fn sectors_per_track(track: u8) -> u8 {
  match track {
    1..=17 => 21,
    18..=24 => 19,
    25..=30 => 18,
    _ => 17,
  }
}

fn offset(track: u8, sector: u8) -> usize {
  let before: usize = (1..track).map(|t| sectors_per_track(t) as usize).sum();
  (before + sector as usize) * SECTOR_SIZE
}

/// Tracks in the order file data is allocated: outward from the directory.
fn file_tracks() -> impl Iterator<Item = u8> {
  (1..DIR_TRACK).rev().chain(DIR_TRACK + 1..=TRACKS)
}

/// Map ASCII to the PETSCII codes Commodore DOS shows in listings.
pub fn to_petscii(text: &str) -> Vec<u8> {
  text
    .bytes()
    .map(|b| match b {
      b'a'..=b'z' => b - b'a' + 0x41,
      b'A'..=b'Z' => b - b'A' + 0xC1,
      other => other,
    })
    .collect()
}

pub fn from_petscii(bytes: &[u8]) -> String {
  bytes
    .iter()
    .map(|&b| match b {
      0x41..=0x5A => (b - 0x41 + b'a') as char,
      0xC1..=0xDA => (b - 0xC1 + b'A') as char,
      other => other as char,
    })
    .collect()
}

fn padded_name(text: &str) -> Result<[u8; 16], ImageError> {
  let bytes = to_petscii(text);
  if bytes.len() > 16 {
    return Err(ImageError::InvalidItem {
      key: text.to_string(),
      reason: "names are limited to 16 characters".to_string(),
    });
  }
  let mut name = [PAD; 16];
  name[..bytes.len()].copy_from_slice(&bytes);
  Ok(name)
}

/// State of the CP/M region according to the BAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
  Free,
  Reserved,
  Mixed,
}

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CbmFile {
  pub name: String,
  pub file_type: u8,
  pub track: u8,
  pub sector: u8,
  pub blocks: u16,
}

#[derive(Debug, Clone)]
pub struct D64 {
  data: Vec<u8>,
}

impl D64 {
  /// A freshly formatted disk.
  pub fn new(title: &str) -> Result<Self, ImageError> {
    let mut disk = Self {
      data: vec![0; D64_SIZE],
    };
    let title = padded_name(title)?;

    let bam = offset(DIR_TRACK, 0);
    disk.data[bam] = DIR_TRACK;
    disk.data[bam + 1] = 1;
    disk.data[bam + 2] = b'A';
    for track in 1..=TRACKS {
      for sector in 0..sectors_per_track(track) {
        disk.set_free(track, sector, true)?;
      }
    }
    disk.data[bam + 0x90..bam + 0xA0].copy_from_slice(&title);
    disk.data[bam + 0xA0..bam + 0xAB].fill(PAD);
    disk.data[bam + 0xA2..bam + 0xA4].copy_from_slice(DISK_ID);
    disk.data[bam + 0xA5..bam + 0xA7].copy_from_slice(DOS_TYPE);
    disk.set_free(DIR_TRACK, 0, false)?;

    disk.set_free(DIR_TRACK, 1, false)?;
    let dir = offset(DIR_TRACK, 1);
    disk.data[dir] = 0;
    disk.data[dir + 1] = 0xFF;
    Ok(disk)
  }

  pub fn open(data: Vec<u8>) -> Result<Self, ImageError> {
    if data.len() != D64_SIZE {
      return Err(ImageError::UnsupportedGeometry(format!(
        "a 35-track D64 is {} bytes, got {}",
        D64_SIZE,
        data.len()
      )));
    }
    Ok(Self { data })
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.data
  }

  pub fn title(&self) -> String {
    let bam = offset(DIR_TRACK, 0);
    let raw = &self.data[bam + 0x90..bam + 0xA0];
    let end = raw.iter().position(|&b| b == PAD).unwrap_or(raw.len());
    from_petscii(&raw[..end])
  }

  pub fn is_free(&self, track: u8, sector: u8) -> bool {
    let entry = offset(DIR_TRACK, 0) + 4 * track as usize;
    self.data[entry + 1 + sector as usize / 8] & (1 << (sector % 8)) != 0
  }

  /// Flip one BAM bit and keep the track's free count in step with it.
  fn set_free(&mut self, track: u8, sector: u8, free: bool) -> Result<(), ImageError> {
    if self.is_free(track, sector) == free {
      return Ok(());
    }
    let entry = offset(DIR_TRACK, 0) + 4 * track as usize;
    let count = self.data[entry];
    let updated = if free { count.checked_add(1) } else { count.checked_sub(1) };
    let Some(updated) = updated else {
      return Err(ImageError::Corrupt(format!(
        "BAM free count {} of track {} disagrees with its bitmap",
        count, track
      )));
    };
    let bit = 1 << (sector % 8);
    if free {
      self.data[entry + 1 + sector as usize / 8] |= bit;
    } else {
      self.data[entry + 1 + sector as usize / 8] &= !bit;
    }
    self.data[entry] = updated;
    Ok(())
  }

  /// Free sectors available for file data.
  pub fn free_sectors(&self) -> usize {
    file_tracks()
      .map(|t| (0..sectors_per_track(t)).filter(|&s| self.is_free(t, s)).count())
      .sum()
  }

  /// Write a closed PRG file.
  pub fn add_file(&mut self, name: &str, contents: &[u8]) -> Result<(), ImageError> {
    let encoded = padded_name(name)?;
    let needed = contents.len().div_ceil(DATA_PER_SECTOR).max(1);
    let available = self.free_sectors();
    if needed > available {
      return Err(ImageError::ImageFull {
        resource: "sectors",
        needed,
        available,
      });
    }
    let slot = self.free_dir_slot()?;

    let sectors = self.allocate(needed)?;
    let mut chunks = contents.chunks(DATA_PER_SECTOR);
    for (i, &(track, sector)) in sectors.iter().enumerate() {
      let chunk = chunks.next().unwrap_or_default();
      let at = offset(track, sector);
      let block = &mut self.data[at..at + SECTOR_SIZE];
      block.fill(0);
      match sectors.get(i + 1) {
        Some(&(next_track, next_sector)) => {
          block[0] = next_track;
          block[1] = next_sector;
        }
        None => {
          block[0] = 0;
          block[1] = (chunk.len() + 1) as u8;
        }
      }
      block[2..2 + chunk.len()].copy_from_slice(chunk);
    }

    let (first_track, first_sector) = sectors[0];
    let entry = &mut self.data[slot..slot + 30];
    entry[0] = FILE_TYPE_PRG;
    entry[1] = first_track;
    entry[2] = first_sector;
    entry[3..19].copy_from_slice(&encoded);
    entry[19..28].fill(0);
    entry[28..30].copy_from_slice(&(needed as u16).to_le_bytes());

    debug!(file = name, bytes = contents.len(), sectors = needed, "placed cbm file");
    Ok(())
  }

  /// Allocate `count` sectors with the file interleave.
  fn allocate(&mut self, count: usize) -> Result<Vec<(u8, u8)>, ImageError> {
    let mut sectors = Vec::with_capacity(count);
    let mut tracks = file_tracks();
    let mut track = tracks.next().unwrap_or(1);
    let mut sector = 0u8;
    while sectors.len() < count {
      let spt = sectors_per_track(track);
      let free = (0..spt).map(|i| (sector + i) % spt).find(|&s| self.is_free(track, s));
      match free {
        Some(s) => {
          self.set_free(track, s, false)?;
          sectors.push((track, s));
          sector = (s + FILE_INTERLEAVE) % spt;
        }
        None => {
          let Some(next) = tracks.next() else {
            break;
          };
          track = next;
          sector = 0;
        }
      }
    }
    Ok(sectors)
  }

  /// Offset of the first unused directory slot, extending the chain if needed.
  ///
  /// The returned offset points at the file-type byte of the entry.
  fn free_dir_slot(&mut self) -> Result<usize, ImageError> {
    let chain = self.dir_chain()?;
    for &sector in &chain {
      let at = offset(DIR_TRACK, sector);
      for slot in 0..DIR_ENTRIES_PER_SECTOR {
        let entry = at + slot * 32 + 2;
        if self.data[entry] == 0 {
          return Ok(entry);
        }
      }
    }

    let spt = sectors_per_track(DIR_TRACK);
    let last = chain.last().copied().unwrap_or(1);
    let next = (0..spt)
      .map(|i| (last + DIR_INTERLEAVE + i) % spt)
      .find(|&s| s != 0 && self.is_free(DIR_TRACK, s))
      .ok_or(ImageError::ImageFull {
        resource: "directory entries",
        needed: 1,
        available: 0,
      })?;
    self.set_free(DIR_TRACK, next, false)?;
    let prev = offset(DIR_TRACK, last);
    self.data[prev] = DIR_TRACK;
    self.data[prev + 1] = next;
    let at = offset(DIR_TRACK, next);
    self.data[at..at + SECTOR_SIZE].fill(0);
    self.data[at + 1] = 0xFF;
    Ok(at + 2)
  }

  fn dir_chain(&self) -> Result<Vec<u8>, ImageError> {
    let mut chain = Vec::new();
    let mut sector = 1u8;
    loop {
      if chain.contains(&sector) || sector >= sectors_per_track(DIR_TRACK) {
        return Err(ImageError::Corrupt(format!("directory chain loops at 18/{}", sector)));
      }
      chain.push(sector);
      let at = offset(DIR_TRACK, sector);
      if self.data[at] != DIR_TRACK {
        return Ok(chain);
      }
      sector = self.data[at + 1];
    }
  }

  /// All files in directory order.
  pub fn files(&self) -> Result<Vec<CbmFile>, ImageError> {
    let mut files = Vec::new();
    for sector in self.dir_chain()? {
      let at = offset(DIR_TRACK, sector);
      for slot in 0..DIR_ENTRIES_PER_SECTOR {
        let entry = &self.data[at + slot * 32 + 2..at + slot * 32 + 32];
        if entry[0] == 0 {
          continue;
        }
        let raw_name = &entry[3..19];
        let end = raw_name.iter().position(|&b| b == PAD).unwrap_or(raw_name.len());
        files.push(CbmFile {
          name: from_petscii(&raw_name[..end]),
          file_type: entry[0],
          track: entry[1],
          sector: entry[2],
          blocks: u16::from_le_bytes([entry[28], entry[29]]),
        });
      }
    }
    Ok(files)
  }

  /// Follow a file's sector chain.
  pub fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>, ImageError> {
    let Some(file) = self.files()?.into_iter().find(|f| f.name == name) else {
      return Ok(None);
    };
    let mut contents = Vec::new();
    let (mut track, mut sector) = (file.track, file.sector);
    for _ in 0..=D64_SIZE / SECTOR_SIZE {
      if track == 0 || track > TRACKS || sector >= sectors_per_track(track) {
        return Err(ImageError::Corrupt(format!("bad link {}/{} in '{}'", track, sector, name)));
      }
      let at = offset(track, sector);
      let block = &self.data[at..at + SECTOR_SIZE];
      if block[0] == 0 {
        let last = (block[1] as usize).clamp(1, SECTOR_SIZE - 1);
        contents.extend_from_slice(&block[2..=last]);
        return Ok(Some(contents));
      }
      contents.extend_from_slice(&block[2..]);
      track = block[0];
      sector = block[1];
    }
    Err(ImageError::Corrupt(format!("sector chain of '{}' loops", name)))
  }

  fn cpm_sectors() -> impl Iterator<Item = (u8, u8)> {
    (CPM_FIRST_TRACK..=TRACKS).flat_map(|t| (0..CPM_SECTORS).map(move |s| (t, s)))
  }

  pub fn region_state(&self) -> RegionState {
    let (mut free, mut used) = (0, 0);
    for (t, s) in Self::cpm_sectors() {
      if self.is_free(t, s) {
        free += 1;
      } else {
        used += 1;
      }
    }
    match (free, used) {
      (_, 0) => RegionState::Free,
      (0, _) => RegionState::Reserved,
      _ => RegionState::Mixed,
    }
  }

  /// Mark the whole CP/M region as used.
  pub fn reserve_region(&mut self) -> Result<(), ImageError> {
    for (t, s) in Self::cpm_sectors() {
      self.set_free(t, s, false)?;
    }
    Ok(())
  }

  /// The CP/M region as a flat image, track-major.
  pub fn extract_region(&self) -> Vec<u8> {
    let mut region = Vec::with_capacity(Self::cpm_sectors().count() * SECTOR_SIZE);
    for (t, s) in Self::cpm_sectors() {
      let at = offset(t, s);
      region.extend_from_slice(&self.data[at..at + SECTOR_SIZE]);
    }
    region
  }

  pub fn store_region(&mut self, region: &[u8]) -> Result<(), ImageError> {
    let expected = Self::cpm_sectors().count() * SECTOR_SIZE;
    if region.len() != expected {
      return Err(ImageError::UnsupportedGeometry(format!(
        "CP/M region is {} bytes, got {}",
        expected,
        region.len()
      )));
    }
    for ((t, s), chunk) in Self::cpm_sectors().zip(region.chunks(SECTOR_SIZE)) {
      let at = offset(t, s);
      self.data[at..at + SECTOR_SIZE].copy_from_slice(chunk);
    }
    Ok(())
  }
}
