//! Deterministic `ar` and zip containers.

use std::io::{Cursor, Read, Write};

use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

const AR_MAGIC: &[u8] = b"!<arch>\n";
const AR_HEADER_LEN: usize = 60;

#[derive(Debug, Error)]
pub enum ArchiveError {
  #[error("not an ar archive")]
  NotAr,

  #[error("malformed ar member header at offset {0}")]
  BadHeader(usize),

  #[error("duplicate archive entry '{0}'")]
  DuplicateEntry(String),

  #[error(transparent)]
  Zip(#[from] zip::result::ZipError),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

/// Write objects as an `ar` archive with zeroed metadata.
///
/// Members are named `obj<N>.o` in input order.
pub fn write_ar(objects: &[Vec<u8>]) -> Vec<u8> {
  let mut out = AR_MAGIC.to_vec();
  for (idx, object) in objects.iter().enumerate() {
    let header = format!(
      "{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}`\n",
      format!("obj{}.o/", idx),
      0,
      0,
      0,
      644,
      object.len()
    );
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(object);
    if object.len() % 2 == 1 {
      out.push(b'\n');
    }
  }
  out
}

/// Member contents of an `ar` archive, in order.
pub fn read_ar(bytes: &[u8]) -> Result<Vec<Vec<u8>>, ArchiveError> {
  let mut rest = bytes.strip_prefix(AR_MAGIC).ok_or(ArchiveError::NotAr)?;
  let mut offset = AR_MAGIC.len();
  let mut members = Vec::new();
  while !rest.is_empty() {
    if rest.len() < AR_HEADER_LEN || &rest[58..60] != b"`\n" {
      return Err(ArchiveError::BadHeader(offset));
    }
    let size: usize = std::str::from_utf8(&rest[48..58])
      .ok()
      .and_then(|s| s.trim().parse().ok())
      .ok_or(ArchiveError::BadHeader(offset))?;
    let body = rest
      .get(AR_HEADER_LEN..AR_HEADER_LEN + size)
      .ok_or(ArchiveError::BadHeader(offset))?;
    members.push(body.to_vec());
    let advance = (AR_HEADER_LEN + size + size % 2).min(rest.len());
    rest = &rest[advance..];
    offset += advance;
  }
  Ok(members)
}

/// Build a zip file with fixed timestamps and permissions.
pub fn write_zip<'a>(entries: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Result<Vec<u8>, ArchiveError> {
  let options = SimpleFileOptions::default()
    .compression_method(CompressionMethod::Deflated)
    .last_modified_time(DateTime::default())
    .unix_permissions(0o644);

  let mut names: Vec<&str> = Vec::new();
  let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
  for (name, contents) in entries {
    if names.contains(&name) {
      return Err(ArchiveError::DuplicateEntry(name.to_string()));
    }
    names.push(name);
    writer.start_file(name, options)?;
    writer.write_all(contents)?;
  }
  Ok(writer.finish()?.into_inner())
}

/// Entries of a zip file, in archive order.
pub fn read_zip(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>, ArchiveError> {
  let mut archive = ZipArchive::new(Cursor::new(bytes))?;
  let mut entries = Vec::with_capacity(archive.len());
  for i in 0..archive.len() {
    let mut file = archive.by_index(i)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;
    entries.push((file.name().to_string(), contents));
  }
  Ok(entries)
}
