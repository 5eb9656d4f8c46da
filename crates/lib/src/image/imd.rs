//! ImageDisk (`.imd`) serialization.
//!
//! Layout: an ASCII header line, a free-form comment terminated by `0x1A`,
//! then one record per track:
//!
//! ```text
//! mode | cylinder | head | sector count | size code | sector map[count] | sectors...
//! ```
//!
//! Each sector is `0x01` followed by its data, or `0x02` followed by a single
//! fill byte when every byte of the sector is the same.

use super::{Geometry, ImageError};

/// Fixed header; the timestamp is pinned so output is reproducible.
pub const HEADER: &str = "IMD 1.18: 01/01/1980 00:00:00\r\n";
const COMMENT_END: u8 = 0x1A;

const MODE_500K_FM: u8 = 0x00;
const MODE_500K_MFM: u8 = 0x03;

/// Largest size code, for 8192-byte sectors.
const MAX_SIZE_CODE: u8 = 6;

const SECTOR_NORMAL: u8 = 0x01;
const SECTOR_COMPRESSED: u8 = 0x02;

fn size_code(sector_size: usize) -> Option<u8> {
  (0..=MAX_SIZE_CODE).find(|code| 128usize << code == sector_size)
}

/// Serialize a flat sector image.
pub fn encode(image: &[u8], geometry: &Geometry, comment: &str) -> Result<Vec<u8>, ImageError> {
  let unsupported = |reason: String| Err(ImageError::UnsupportedGeometry(reason));
  let Some(code) = size_code(geometry.sector_size) else {
    return unsupported(format!("sector size {} has no IMD size code", geometry.sector_size));
  };
  if geometry.track_count > 256 || geometry.sectors_per_track > 255 {
    return unsupported(format!(
      "{} tracks of {} sectors do not fit IMD track records",
      geometry.track_count, geometry.sectors_per_track
    ));
  }
  if image.len() != geometry.total() {
    return unsupported(format!(
      "image is {} bytes but the geometry describes {}",
      image.len(),
      geometry.total()
    ));
  }
  if comment.as_bytes().contains(&COMMENT_END) {
    return unsupported("comment may not contain 0x1A".to_string());
  }

  let mode = if geometry.sector_size == 128 {
    MODE_500K_FM
  } else {
    MODE_500K_MFM
  };

  let mut out = Vec::with_capacity(image.len() + 1024);
  out.extend_from_slice(HEADER.as_bytes());
  out.extend_from_slice(comment.as_bytes());
  out.push(COMMENT_END);

  let track_size = geometry.sector_size * geometry.sectors_per_track;
  for (cylinder, track) in image.chunks(track_size).enumerate() {
    out.extend_from_slice(&[mode, cylinder as u8, 0, geometry.sectors_per_track as u8, code]);
    out.extend((1..=geometry.sectors_per_track).map(|s| s as u8));
    for sector in track.chunks(geometry.sector_size) {
      let first = sector[0];
      if sector.iter().all(|&b| b == first) {
        out.extend_from_slice(&[SECTOR_COMPRESSED, first]);
      } else {
        out.push(SECTOR_NORMAL);
        out.extend_from_slice(sector);
      }
    }
  }
  Ok(out)
}

/// Parse an IMD image back into its comment, geometry and flat data.
///
/// Only the single-sided, uniform layouts produced by [`encode`] are
/// accepted.
pub fn decode(bytes: &[u8]) -> Result<(String, Geometry, Vec<u8>), ImageError> {
  let corrupt = |what: &str| ImageError::Corrupt(format!("IMD: {}", what));
  let end = bytes
    .iter()
    .position(|&b| b == COMMENT_END)
    .ok_or_else(|| corrupt("missing comment terminator"))?;
  let text = String::from_utf8_lossy(&bytes[..end]);
  let comment = text
    .strip_prefix(HEADER)
    .ok_or_else(|| corrupt("bad header"))?
    .to_string();

  let mut pos = end + 1;
  let mut data = Vec::new();
  let mut geometry: Option<Geometry> = None;
  let mut tracks = 0;
  while pos < bytes.len() {
    let header = bytes.get(pos..pos + 5).ok_or_else(|| corrupt("truncated track header"))?;
    let count = header[3] as usize;
    if header[4] > MAX_SIZE_CODE {
      return Err(corrupt(&format!("sector size code {} is out of range", header[4])));
    }
    let sector_size = 128usize << header[4];
    pos += 5 + count;
    match geometry {
      Some(g) if g.sectors_per_track != count || g.sector_size != sector_size => {
        return Err(corrupt("tracks are not uniform"));
      }
      _ => {
        geometry = Some(Geometry {
          sector_size,
          sectors_per_track: count,
          track_count: 0,
        })
      }
    }
    for _ in 0..count {
      match bytes.get(pos) {
        Some(&SECTOR_NORMAL) => {
          let sector = bytes
            .get(pos + 1..pos + 1 + sector_size)
            .ok_or_else(|| corrupt("truncated sector"))?;
          data.extend_from_slice(sector);
          pos += 1 + sector_size;
        }
        Some(&SECTOR_COMPRESSED) => {
          let fill = *bytes.get(pos + 1).ok_or_else(|| corrupt("truncated sector"))?;
          data.extend(std::iter::repeat_n(fill, sector_size));
          pos += 2;
        }
        _ => return Err(corrupt("unsupported sector record")),
      }
    }
    tracks += 1;
  }

  let mut geometry = geometry.ok_or_else(|| corrupt("no tracks"))?;
  geometry.track_count = tracks;
  Ok((comment, geometry, data))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn geometry(sector_size: usize, sectors_per_track: usize, track_count: usize) -> Geometry {
    Geometry {
      sector_size,
      sectors_per_track,
      track_count,
    }
  }

  #[test]
  fn header_and_track_layout() {
    let g = geometry(128, 2, 1);
    let mut image = vec![0xE5; 256];
    image[0] = 1;
    let out = encode(&image, &g, "hi").unwrap();

    let prefix = format!("{}hi\x1a", HEADER);
    assert!(out.starts_with(prefix.as_bytes()));
    let track = &out[prefix.len()..];
    assert_eq!(&track[..7], &[0x00, 0, 0, 2, 0, 1, 2]);
    assert_eq!(track[7], SECTOR_NORMAL);
    assert_eq!(&track[8 + 128..], &[SECTOR_COMPRESSED, 0xE5]);
  }

  #[test]
  fn mfm_for_larger_sectors() {
    let g = geometry(256, 26, 77);
    let out = encode(&vec![0; g.total()], &g, "").unwrap();
    let track = &out[HEADER.len() + 1..];
    assert_eq!(track[0], MODE_500K_MFM);
    assert_eq!(track[4], 1);
    // every sector compresses to two bytes
    assert_eq!(out.len(), HEADER.len() + 1 + 77 * (5 + 26 + 26 * 2));
  }

  #[test]
  fn decode_inverts_encode() {
    let g = geometry(128, 26, 77);
    let image: Vec<u8> = (0..g.total()).map(|i| (i / 100) as u8).collect();
    let (comment, decoded, data) = decode(&encode(&image, &g, "cp/m-65").unwrap()).unwrap();
    assert_eq!(comment, "cp/m-65");
    assert_eq!(decoded, g);
    assert_eq!(data, image);
  }

  #[test]
  fn rejects_unrepresentable_geometry() {
    let sd = geometry(512, 16, 4096);
    assert!(matches!(
      encode(&[], &sd, ""),
      Err(ImageError::UnsupportedGeometry(_))
    ));
    let odd = geometry(300, 10, 10);
    assert!(matches!(
      encode(&vec![0; 30_000], &odd, ""),
      Err(ImageError::UnsupportedGeometry(_))
    ));
  }

  #[test]
  fn decode_rejects_unknown_size_codes() {
    let g = geometry(128, 1, 1);
    let mut out = encode(&[0; 128], &g, "").unwrap();
    out[HEADER.len() + 1 + 4] = 0xFF;
    let err = decode(&out).unwrap_err();
    assert!(matches!(err, ImageError::Corrupt(ref m) if m.contains("size code 255")), "{err:?}");
  }

  #[test]
  fn rejects_size_mismatch() {
    let g = geometry(128, 26, 77);
    assert!(matches!(
      encode(&[0; 10], &g, ""),
      Err(ImageError::UnsupportedGeometry(_))
    ));
  }
}
