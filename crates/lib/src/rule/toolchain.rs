//! Assembler/linker collaborators.
//!
//! Rules never run a compiler directly; they go through a [`Toolchain`].
//! [`FlatToolchain`] works in-process on pre-assembled blobs and is what tests
//! and toolchain-less builds use. [`CommandToolchain`] drives an external
//! compiler such as llvm-mos `mos-kim1-clang`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ToolchainError {
  #[error("link failed: {0}")]
  Link(String),

  #[error("'{cmd}' exited with {}: {stderr}", exit_status(.code))]
  Command {
    cmd: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("toolchain I/O error: {0}")]
  Io(#[from] std::io::Error),
}

fn exit_status(code: &Option<i32>) -> String {
  match code {
    Some(code) => format!("status {}", code),
    None => "a signal".to_string(),
  }
}

/// A named source file handed to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
  pub name: String,
  pub bytes: Arc<[u8]>,
}

pub trait Toolchain: Send + Sync + fmt::Debug {
  /// Identity folded into cache keys.
  fn id(&self) -> String;

  /// Assemble sources into one object.
  fn assemble(
    &self,
    sources: &[SourceUnit],
    flags: &[String],
    headers: &BTreeMap<String, Arc<[u8]>>,
  ) -> Result<Vec<u8>, ToolchainError>;

  /// Link objects into a flat binary, laid out by `script` if given.
  fn link(&self, objects: &[Vec<u8>], script: Option<&str>) -> Result<Vec<u8>, ToolchainError>;
}

/// The first region of a GNU-ld `MEMORY` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
  pub name: String,
  pub origin: u64,
  pub length: u64,
}

fn parse_number(raw: &str) -> Option<u64> {
  let raw = raw.trim();
  let (digits, scale) = match raw.as_bytes().last()? {
    b'K' | b'k' => (&raw[..raw.len() - 1], 1024),
    b'M' | b'm' => (&raw[..raw.len() - 1], 1024 * 1024),
    _ => (raw, 1),
  };
  let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
    Some(hex) => u64::from_str_radix(hex, 16).ok()?,
    None => digits.parse().ok()?,
  };
  value.checked_mul(scale)
}

const ORIGIN_KEYS: [&str; 3] = ["ORIGIN", "org", "o"];
const LENGTH_KEYS: [&str; 3] = ["LENGTH", "len", "l"];

/// `key = value` pairs of a region's attribute list.
fn attributes(attrs: &str) -> impl Iterator<Item = (&str, &str)> {
  attrs
    .split(',')
    .filter_map(|part| part.split_once('='))
    .map(|(key, value)| (key.trim(), value.trim()))
}

/// Find the first `MEMORY` region of a link script.
pub fn parse_memory_region(script: &str) -> Result<MemoryRegion, ToolchainError> {
  let no_region = || ToolchainError::Link("link script declares no MEMORY region".to_string());
  let start = script.find("MEMORY").ok_or_else(no_region)?;
  let Some(body) = script[start + "MEMORY".len()..].trim_start().strip_prefix('{') else {
    return Err(ToolchainError::Link("MEMORY must be followed by '{'".to_string()));
  };
  let close = body
    .find('}')
    .ok_or_else(|| ToolchainError::Link("unterminated MEMORY block".to_string()))?;

  let (name, attrs) = body[..close]
    .split(['\n', ';'])
    .filter_map(|line| line.split_once(':'))
    .find(|(_, attrs)| attributes(attrs).any(|(key, _)| ORIGIN_KEYS.contains(&key)))
    .ok_or_else(no_region)?;
  let name = name.split('(').next().unwrap_or_default().trim().to_string();

  let mut origin = None;
  let mut length = None;
  for (key, value) in attributes(attrs) {
    let slot = if ORIGIN_KEYS.contains(&key) {
      &mut origin
    } else if LENGTH_KEYS.contains(&key) {
      &mut length
    } else {
      continue;
    };
    let parsed = parse_number(value)
      .ok_or_else(|| ToolchainError::Link(format!("cannot evaluate '{}' in region '{}'", value, name)))?;
    *slot = Some(parsed);
  }
  match (origin, length) {
    (Some(origin), Some(length)) => Ok(MemoryRegion { name, origin, length }),
    _ => Err(ToolchainError::Link(format!(
      "region '{}' needs both ORIGIN and LENGTH",
      name
    ))),
  }
}

/// In-process toolchain over pre-assembled sources.
///
/// Assembly concatenates source bytes; linking concatenates objects and checks
/// the result against the script's first memory region.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatToolchain;

impl Toolchain for FlatToolchain {
  fn id(&self) -> String {
    "flat".to_string()
  }

  fn assemble(
    &self,
    sources: &[SourceUnit],
    _flags: &[String],
    _headers: &BTreeMap<String, Arc<[u8]>>,
  ) -> Result<Vec<u8>, ToolchainError> {
    Ok(sources.iter().flat_map(|s| s.bytes.iter().copied()).collect())
  }

  fn link(&self, objects: &[Vec<u8>], script: Option<&str>) -> Result<Vec<u8>, ToolchainError> {
    let binary = objects.concat();
    if let Some(script) = script {
      let region = parse_memory_region(script)?;
      if binary.len() as u64 > region.length {
        return Err(ToolchainError::Link(format!(
          "{} bytes do not fit region '{}' ({} bytes at {:#06x})",
          binary.len(),
          region.name,
          region.length,
          region.origin
        )));
      }
    }
    Ok(binary)
  }
}

/// External compiler driver run in a scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandToolchain {
  pub cc: String,
}

impl CommandToolchain {
  pub fn new(cc: impl Into<String>) -> Self {
    Self { cc: cc.into() }
  }

  fn run(&self, dir: &Path, args: &[String]) -> Result<(), ToolchainError> {
    let rendered = format!("{} {}", self.cc, args.join(" "));
    debug!(cmd = %rendered, "running toolchain");

    let mut command = Command::new(&self.cc);
    command
      .args(args)
      .current_dir(dir)
      .env_clear()
      .env("HOME", "/homeless-shelter")
      .env("TMPDIR", dir)
      .env("LANG", "C")
      .env("LC_ALL", "C")
      // 1980-01-01, the zip epoch
      .env("SOURCE_DATE_EPOCH", "315532800");
    if let Some(path) = std::env::var_os("PATH") {
      command.env("PATH", path);
    }

    let output = command.output()?;
    if !output.status.success() {
      return Err(ToolchainError::Command {
        cmd: rendered,
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    Ok(())
  }
}

impl Toolchain for CommandToolchain {
  fn id(&self) -> String {
    format!("command:{}", self.cc)
  }

  fn assemble(
    &self,
    sources: &[SourceUnit],
    flags: &[String],
    headers: &BTreeMap<String, Arc<[u8]>>,
  ) -> Result<Vec<u8>, ToolchainError> {
    let dir = tempfile::tempdir()?;
    let include = dir.path().join("include");
    std::fs::create_dir_all(&include)?;
    for (name, bytes) in headers {
      let path = include.join(name);
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
      }
      std::fs::write(path, bytes)?;
    }

    let mut objects = Vec::with_capacity(sources.len());
    for (idx, source) in sources.iter().enumerate() {
      let file_name = Path::new(&source.name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("src{}.S", idx));
      let src = format!("{}-{}", idx, file_name);
      std::fs::write(dir.path().join(&src), &source.bytes)?;

      let object = format!("obj{}.o", idx);
      let mut args = vec!["-c".to_string(), "-I".to_string(), "include".to_string()];
      args.extend(flags.iter().cloned());
      args.extend([src, "-o".to_string(), object.clone()]);
      self.run(dir.path(), &args)?;
      objects.push(object);
    }

    let result = match objects.as_slice() {
      [single] => single.clone(),
      _ => {
        let mut args = vec!["-r".to_string(), "-nostdlib".to_string()];
        args.extend(objects.iter().cloned());
        args.extend(["-o".to_string(), "combined.o".to_string()]);
        self.run(dir.path(), &args)?;
        "combined.o".to_string()
      }
    };
    Ok(std::fs::read(dir.path().join(result))?)
  }

  fn link(&self, objects: &[Vec<u8>], script: Option<&str>) -> Result<Vec<u8>, ToolchainError> {
    let dir = tempfile::tempdir()?;
    let mut args = vec!["-nostdlib".to_string(), "-o".to_string(), "out.bin".to_string()];
    if let Some(script) = script {
      std::fs::write(dir.path().join("link.ld"), script)?;
      args.extend(["-T".to_string(), "link.ld".to_string()]);
    }
    for (idx, object) in objects.iter().enumerate() {
      let name = format!("obj{}.o", idx);
      std::fs::write(dir.path().join(&name), object)?;
      args.push(name);
    }
    self.run(dir.path(), &args)?;
    Ok(std::fs::read(dir.path().join("out.bin"))?)
  }
}
