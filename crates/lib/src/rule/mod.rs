//! Rule kinds and their evaluation.
//!
//! A [`Rule`] is a declaration whose references have been resolved into
//! [`Input`]s. Evaluation is a pure function of the rule, the bytes of its
//! inputs and the toolchain: equal inputs always give equal artifacts.

pub mod archive;
pub mod multilink;
pub mod toolchain;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::artifact::Artifact;
use crate::graph::TargetId;
use crate::image::cpmfs::{CpmImage, CpmName};
use crate::image::d64::{D64, RegionState};
use crate::image::{DiskDef, Geometry, ImageError, imd};
use crate::items::{Item, ItemMapping};
use crate::target::RuleKind;
use crate::util::hash::{ContentHash, Hashable, hash_bytes};

use self::archive::ArchiveError;
use self::toolchain::{SourceUnit, Toolchain, ToolchainError};

#[derive(Debug, Error)]
pub enum RuleError {
  #[error(transparent)]
  Toolchain(#[from] ToolchainError),

  #[error(transparent)]
  Image(#[from] ImageError),

  #[error(transparent)]
  Archive(#[from] ArchiveError),

  #[error("cannot read {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("input {0} was not provided")]
  MissingInput(String),

  #[error("evaluation task failed: {0}")]
  Task(String),
}

impl RuleError {
  /// Short machine-readable label for reports.
  pub fn label(&self) -> &'static str {
    match self {
      RuleError::Toolchain(ToolchainError::Link(_)) => "link",
      RuleError::Toolchain(_) => "toolchain",
      RuleError::Image(ImageError::BootImageTooLarge { .. }) => "boot_image_too_large",
      RuleError::Image(ImageError::ImageFull { .. }) => "image_full",
      RuleError::Image(ImageError::UnsupportedGeometry(_)) => "unsupported_geometry",
      RuleError::Image(ImageError::InvalidItem { .. }) => "invalid_item",
      RuleError::Image(ImageError::Corrupt(_)) => "corrupt_image",
      RuleError::Archive(_) => "archive",
      RuleError::Io { .. } => "io",
      RuleError::MissingInput(_) => "missing_input",
      RuleError::Task(_) => "task",
    }
  }
}

/// A resolved rule input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Input {
  Target(TargetId),
  File(PathBuf),
}

impl Input {
  pub fn target(&self) -> Option<TargetId> {
    match self {
      Input::Target(id) => Some(*id),
      Input::File(_) => None,
    }
  }

  fn describe(&self) -> String {
    match self {
      Input::Target(id) => format!("target {}", id),
      Input::File(path) => path.display().to_string(),
    }
  }
}

/// Compile options shared by libraries and raw programs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompileRule {
  pub srcs: Vec<Input>,
  /// Own headers plus those of every library dependency, transitively.
  pub headers: BTreeMap<String, Input>,
  /// Library dependencies, transitively, nearest first.
  pub libraries: Vec<TargetId>,
  pub cflags: Vec<String>,
  pub linkscript: Option<Input>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpmFsRule {
  pub format: DiskDef,
  pub size: Option<u64>,
  pub boot: Option<Input>,
  pub template: Option<Input>,
  pub items: ItemMapping<Input>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
  NativeLibrary(CompileRule),
  RawProgram(CompileRule),
  Multilink {
    core: Input,
    zp: Input,
    mem: Input,
  },
  CpmFs(CpmFsRule),
  Imd {
    src: Input,
    /// Geometry of the source filesystem, when it is a flat CP/M image.
    geometry: Option<Geometry>,
    comment: String,
  },
  CbmFs {
    title: String,
    items: ItemMapping<Input>,
  },
  Zip {
    items: ItemMapping<Input>,
  },
}

impl Hashable for Rule {}

impl Rule {
  pub fn kind(&self) -> RuleKind {
    match self {
      Rule::NativeLibrary(_) => RuleKind::NativeLibrary,
      Rule::RawProgram(_) => RuleKind::RawProgram,
      Rule::Multilink { .. } => RuleKind::Multilink,
      Rule::CpmFs(_) => RuleKind::CpmFs,
      Rule::Imd { .. } => RuleKind::Imd,
      Rule::CbmFs { .. } => RuleKind::CbmFs,
      Rule::Zip { .. } => RuleKind::Zip,
    }
  }

  /// Every input in a fixed order.
  pub fn inputs(&self) -> Vec<Input> {
    match self {
      Rule::NativeLibrary(c) | Rule::RawProgram(c) => c
        .srcs
        .iter()
        .cloned()
        .chain(c.headers.values().cloned())
        .chain(c.libraries.iter().map(|id| Input::Target(*id)))
        .chain(c.linkscript.iter().cloned())
        .collect(),
      Rule::Multilink { core, zp, mem } => vec![core.clone(), zp.clone(), mem.clone()],
      Rule::CpmFs(fs) => fs
        .boot
        .iter()
        .chain(fs.template.iter())
        .chain(fs.items.iter().map(|i| &i.source))
        .cloned()
        .collect(),
      Rule::Imd { src, .. } => vec![src.clone()],
      Rule::CbmFs { items, .. } | Rule::Zip { items } => items.iter().map(|i| i.source.clone()).collect(),
    }
  }

  /// Targets this rule depends on, deduplicated, in input order.
  pub fn dependencies(&self) -> Vec<TargetId> {
    let mut deps = Vec::new();
    for id in self.inputs().iter().filter_map(Input::target) {
      if !deps.contains(&id) {
        deps.push(id);
      }
    }
    deps
  }

  /// Produce this rule's artifact.
  pub fn evaluate(&self, inputs: &InputSet, toolchain: &dyn Toolchain) -> Result<Artifact, RuleError> {
    match self {
      Rule::NativeLibrary(c) => {
        let headers = inputs.headers(&c.headers)?;
        let objects = c
          .srcs
          .iter()
          .map(|src| Ok(toolchain.assemble(&[inputs.unit(src)?], &c.cflags, &headers)?))
          .collect::<Result<Vec<_>, RuleError>>()?;
        Ok(Artifact::new(archive::write_ar(&objects)))
      }
      Rule::RawProgram(c) => {
        let headers = inputs.headers(&c.headers)?;
        let mut objects = c
          .srcs
          .iter()
          .map(|src| Ok(toolchain.assemble(&[inputs.unit(src)?], &c.cflags, &headers)?))
          .collect::<Result<Vec<_>, RuleError>>()?;
        for library in &c.libraries {
          objects.extend(archive::read_ar(inputs.bytes(&Input::Target(*library))?)?);
        }
        let script = c
          .linkscript
          .as_ref()
          .map(|s| inputs.bytes(s).map(|b| String::from_utf8_lossy(b).into_owned()))
          .transpose()?;
        Ok(Artifact::new(toolchain.link(&objects, script.as_deref())?))
      }
      Rule::Multilink { core, zp, mem } => {
        let core = inputs.bytes(core)?;
        let linked = multilink::multilink(core, inputs.bytes(zp)?, inputs.bytes(mem)?)?;
        Ok(Artifact::with_logical_size(linked, core.len()))
      }
      Rule::CpmFs(fs) => Ok(Artifact::new(evaluate_cpmfs(fs, inputs)?)),
      Rule::Imd {
        src,
        geometry,
        comment,
      } => {
        let geometry = geometry.ok_or_else(|| {
          ImageError::UnsupportedGeometry("IMD source must be a flat CP/M filesystem image".to_string())
        })?;
        Ok(Artifact::new(imd::encode(inputs.bytes(src)?, &geometry, comment)?))
      }
      Rule::CbmFs { title, items } => {
        let mut disk = D64::new(title)?;
        for item in items.iter() {
          reject_attribute(item)?;
          disk.add_file(&item.key.destination, inputs.bytes(&item.source)?)?;
        }
        Ok(Artifact::new(disk.into_bytes()))
      }
      Rule::Zip { items } => {
        let entries = items
          .iter()
          .map(|item| {
            reject_attribute(item)?;
            Ok((item.key.destination.as_str(), inputs.bytes(&item.source)?))
          })
          .collect::<Result<Vec<_>, RuleError>>()?;
        Ok(Artifact::new(archive::write_zip(entries)?))
      }
    }
  }
}

fn reject_attribute(item: &Item<Input>) -> Result<(), ImageError> {
  match &item.key.attribute {
    Some(attr) => Err(ImageError::InvalidItem {
      key: item.key.to_string(),
      reason: format!("attribute '{}' has no meaning here", attr),
    }),
    None => Ok(()),
  }
}

fn populate(image: &mut CpmImage, items: &ItemMapping<Input>, inputs: &InputSet) -> Result<(), RuleError> {
  for item in items.iter() {
    let name = CpmName::parse(&item.key.destination, item.key.attribute.as_deref())?;
    let contents = inputs.bytes(&item.source)?;
    debug!(file = %name, source = %item.source.describe(), "adding to filesystem");
    image.add_file(&name, contents)?;
  }
  Ok(())
}

fn evaluate_cpmfs(fs: &CpmFsRule, inputs: &InputSet) -> Result<Vec<u8>, RuleError> {
  let def = fs.format;
  if let Some(size) = fs.size
    && size != def.total_size() as u64
  {
    return Err(
      ImageError::UnsupportedGeometry(format!(
        "declared size {} does not match {} geometry ({} bytes)",
        size,
        def.name,
        def.total_size()
      ))
      .into(),
    );
  }

  let Some(template) = &fs.template else {
    let mut image = CpmImage::format(def);
    if let Some(boot) = &fs.boot {
      image.write_boot(inputs.bytes(boot)?)?;
    }
    populate(&mut image, &fs.items, inputs)?;
    return Ok(image.into_bytes());
  };

  let mut disk = D64::open(inputs.bytes(template)?.to_vec())?;
  let mut image = match disk.region_state() {
    RegionState::Free => {
      disk.reserve_region()?;
      CpmImage::format(def)
    }
    RegionState::Reserved => CpmImage::open(def, disk.extract_region())?,
    RegionState::Mixed => {
      return Err(
        ImageError::UnsupportedGeometry("template's CP/M region is partially allocated".to_string()).into(),
      );
    }
  };
  if let Some(boot) = &fs.boot {
    image.write_boot(inputs.bytes(boot)?)?;
  }
  populate(&mut image, &fs.items, inputs)?;
  disk.store_region(image.as_bytes())?;
  Ok(disk.into_bytes())
}

/// The bytes a rule reads, gathered before evaluation.
#[derive(Debug, Default, Clone)]
pub struct InputSet {
  artifacts: HashMap<TargetId, Artifact>,
  files: HashMap<PathBuf, Arc<[u8]>>,
}

impl InputSet {
  /// Collect dependency artifacts and read source files under `root`.
  pub fn gather(rule: &Rule, artifacts: &HashMap<TargetId, Artifact>, root: &Path) -> Result<Self, RuleError> {
    let mut set = Self::default();
    for input in rule.inputs() {
      match input {
        Input::Target(id) => {
          let artifact = artifacts
            .get(&id)
            .ok_or_else(|| RuleError::MissingInput(format!("target {}", id)))?;
          set.artifacts.insert(id, artifact.clone());
        }
        Input::File(path) => {
          if set.files.contains_key(&path) {
            continue;
          }
          let full = root.join(&path);
          let bytes = std::fs::read(&full).map_err(|source| RuleError::Io { path: full, source })?;
          set.files.insert(path, bytes.into());
        }
      }
    }
    Ok(set)
  }

  pub fn bytes(&self, input: &Input) -> Result<&[u8], RuleError> {
    let found = match input {
      Input::Target(id) => self.artifacts.get(id).map(Artifact::bytes),
      Input::File(path) => self.files.get(path).map(|b| &b[..]),
    };
    found.ok_or_else(|| RuleError::MissingInput(input.describe()))
  }

  /// Content identity of an input, for cache keys.
  pub fn content_hash(&self, input: &Input) -> Result<ContentHash, RuleError> {
    match input {
      Input::Target(id) => self
        .artifacts
        .get(id)
        .map(|a| a.hash.clone())
        .ok_or_else(|| RuleError::MissingInput(input.describe())),
      Input::File(_) => self.bytes(input).map(hash_bytes),
    }
  }

  fn unit(&self, input: &Input) -> Result<SourceUnit, RuleError> {
    let bytes: Arc<[u8]> = match input {
      Input::Target(id) => self.artifacts.get(id).map(Artifact::shared),
      Input::File(path) => self.files.get(path).cloned(),
    }
    .ok_or_else(|| RuleError::MissingInput(input.describe()))?;
    let name = match input {
      Input::Target(id) => format!("target{}.S", id.0),
      Input::File(path) => path.display().to_string(),
    };
    Ok(SourceUnit { name, bytes })
  }

  fn headers(&self, headers: &BTreeMap<String, Input>) -> Result<BTreeMap<String, Arc<[u8]>>, RuleError> {
    headers
      .iter()
      .map(|(name, input)| Ok((name.clone(), self.unit(input)?.bytes)))
      .collect()
  }
}
