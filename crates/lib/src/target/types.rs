use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::name::{QualifiedName, Reference};
use crate::graph::GraphError;
use crate::items::ItemMapping;

/// The rule kinds a target can be declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
  NativeLibrary,
  RawProgram,
  Multilink,
  CpmFs,
  Imd,
  CbmFs,
  Zip,
}

impl RuleKind {
  pub const ALL: [RuleKind; 7] = [
    RuleKind::NativeLibrary,
    RuleKind::RawProgram,
    RuleKind::Multilink,
    RuleKind::CpmFs,
    RuleKind::Imd,
    RuleKind::CbmFs,
    RuleKind::Zip,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      RuleKind::NativeLibrary => "native_library",
      RuleKind::RawProgram => "raw_program",
      RuleKind::Multilink => "multilink",
      RuleKind::CpmFs => "cpmfs",
      RuleKind::Imd => "imd",
      RuleKind::CbmFs => "cbmfs",
      RuleKind::Zip => "zip",
    }
  }

  /// Name of the declaration helper exposed to build scripts.
  pub fn helper(self) -> &'static str {
    match self {
      RuleKind::NativeLibrary => "llvmclibrary",
      RuleKind::RawProgram => "llvmrawprogram",
      RuleKind::Multilink => "multilink",
      RuleKind::CpmFs => "mkcpmfs",
      RuleKind::Imd => "mkimd",
      RuleKind::CbmFs => "mkcbmfs",
      RuleKind::Zip => "zip",
    }
  }
}

impl fmt::Display for RuleKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for RuleKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    RuleKind::ALL
      .into_iter()
      .find(|kind| kind.as_str() == s || kind.helper() == s)
      .ok_or_else(|| format!("unknown rule kind '{}'", s))
  }
}

/// Raw declaration options, as written by the caller.
///
/// This is the language-agnostic shape of
/// `rule(kind, name, {srcs, deps, hdrs, cflags, linkscript, format, size,
/// bootimage, template, items, title, src, core, zp, mem})`. References are
/// still strings; [`RuleArgs::into_decl`] anchors them to a package and
/// checks that only options meaningful for the kind were given.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleArgs {
  pub srcs: Option<Vec<String>>,
  pub deps: Option<Vec<String>>,
  pub hdrs: Option<BTreeMap<String, String>>,
  pub cflags: Option<Vec<String>>,
  pub linkscript: Option<String>,
  pub format: Option<String>,
  pub size: Option<u64>,
  pub bootimage: Option<String>,
  pub template: Option<String>,
  pub items: Option<ItemMapping<String>>,
  pub title: Option<String>,
  pub src: Option<String>,
  pub core: Option<String>,
  pub zp: Option<String>,
  pub mem: Option<String>,
}

/// Options shared by the compile-style rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompileDecl {
  pub srcs: Vec<Reference>,
  pub hdrs: BTreeMap<String, Reference>,
  pub deps: Vec<Reference>,
  pub cflags: Vec<String>,
  pub linkscript: Option<Reference>,
}

/// Options of a CP/M filesystem image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpmFsDecl {
  pub format: String,
  pub size: Option<u64>,
  pub bootimage: Option<Reference>,
  pub template: Option<Reference>,
  pub items: ItemMapping<Reference>,
}

/// A rule declaration with references anchored to its package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleDecl {
  NativeLibrary(CompileDecl),
  RawProgram(CompileDecl),
  Multilink {
    core: Reference,
    zp: Reference,
    mem: Reference,
  },
  CpmFs(CpmFsDecl),
  Imd {
    src: Reference,
  },
  CbmFs {
    title: String,
    items: ItemMapping<Reference>,
  },
  Zip {
    items: ItemMapping<Reference>,
  },
}

impl RuleDecl {
  pub fn kind(&self) -> RuleKind {
    match self {
      RuleDecl::NativeLibrary(_) => RuleKind::NativeLibrary,
      RuleDecl::RawProgram(_) => RuleKind::RawProgram,
      RuleDecl::Multilink { .. } => RuleKind::Multilink,
      RuleDecl::CpmFs(_) => RuleKind::CpmFs,
      RuleDecl::Imd { .. } => RuleKind::Imd,
      RuleDecl::CbmFs { .. } => RuleKind::CbmFs,
      RuleDecl::Zip { .. } => RuleKind::Zip,
    }
  }

  /// Every reference in declaration order.
  pub fn references(&self) -> Vec<&Reference> {
    match self {
      RuleDecl::NativeLibrary(c) | RuleDecl::RawProgram(c) => c
        .srcs
        .iter()
        .chain(c.hdrs.values())
        .chain(c.deps.iter())
        .chain(c.linkscript.iter())
        .collect(),
      RuleDecl::Multilink { core, zp, mem } => vec![core, zp, mem],
      RuleDecl::CpmFs(fs) => fs
        .bootimage
        .iter()
        .chain(fs.template.iter())
        .chain(fs.items.iter().map(|i| &i.source))
        .collect(),
      RuleDecl::Imd { src } => vec![src],
      RuleDecl::CbmFs { items, .. } | RuleDecl::Zip { items } => items.iter().map(|i| &i.source).collect(),
    }
  }
}

/// A declared target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDecl {
  pub name: QualifiedName,
  pub rule: RuleDecl,
}

impl RuleArgs {
  /// Turn raw options into a typed declaration for `name` in `package`.
  pub fn into_decl(self, kind: RuleKind, package: &str, name: &str) -> Result<TargetDecl, GraphError> {
    let qualified = QualifiedName::declared(package, name).map_err(|source| GraphError::InvalidName {
      target: QualifiedName::declared_display(package, name),
      source,
    })?;
    let target = qualified.to_string();

    let reference = |raw: &str| {
      Reference::parse(raw, package).map_err(|source| GraphError::InvalidName {
        target: target.clone(),
        source,
      })
    };
    let references = |raws: Option<Vec<String>>| -> Result<Vec<Reference>, GraphError> {
      raws.unwrap_or_default().iter().map(|r| reference(r)).collect()
    };
    let items = |items: Option<ItemMapping<String>>| items.unwrap_or_default().try_map(|raw| reference(raw));
    let required = |value: Option<String>, field: &str| {
      value.ok_or_else(|| GraphError::invalid_rule(&target, format!("{} requires '{}'", kind, field)))
    };

    self.reject_unused(kind, &target)?;

    let rule = match kind {
      RuleKind::NativeLibrary | RuleKind::RawProgram => {
        let decl = CompileDecl {
          srcs: references(self.srcs)?,
          hdrs: self
            .hdrs
            .unwrap_or_default()
            .into_iter()
            .map(|(header, raw)| Ok((header, reference(&raw)?)))
            .collect::<Result<_, GraphError>>()?,
          deps: references(self.deps)?,
          cflags: self.cflags.unwrap_or_default(),
          linkscript: self.linkscript.as_deref().map(reference).transpose()?,
        };
        if kind == RuleKind::NativeLibrary {
          RuleDecl::NativeLibrary(decl)
        } else {
          RuleDecl::RawProgram(decl)
        }
      }
      RuleKind::Multilink => RuleDecl::Multilink {
        core: reference(&required(self.core, "core")?)?,
        zp: reference(&required(self.zp, "zp")?)?,
        mem: reference(&required(self.mem, "mem")?)?,
      },
      RuleKind::CpmFs => RuleDecl::CpmFs(CpmFsDecl {
        format: required(self.format, "format")?,
        size: self.size,
        bootimage: self.bootimage.as_deref().map(reference).transpose()?,
        template: self.template.as_deref().map(reference).transpose()?,
        items: items(self.items)?,
      }),
      RuleKind::Imd => RuleDecl::Imd {
        src: reference(&required(self.src, "src")?)?,
      },
      RuleKind::CbmFs => RuleDecl::CbmFs {
        title: self.title.unwrap_or_default(),
        items: items(self.items)?,
      },
      RuleKind::Zip => RuleDecl::Zip {
        items: items(self.items)?,
      },
    };

    Ok(TargetDecl { name: qualified, rule })
  }

  fn reject_unused(&self, kind: RuleKind, target: &str) -> Result<(), GraphError> {
    let given = [
      ("srcs", self.srcs.is_some()),
      ("deps", self.deps.is_some()),
      ("hdrs", self.hdrs.is_some()),
      ("cflags", self.cflags.is_some()),
      ("linkscript", self.linkscript.is_some()),
      ("format", self.format.is_some()),
      ("size", self.size.is_some()),
      ("bootimage", self.bootimage.is_some()),
      ("template", self.template.is_some()),
      ("items", self.items.is_some()),
      ("title", self.title.is_some()),
      ("src", self.src.is_some()),
      ("core", self.core.is_some()),
      ("zp", self.zp.is_some()),
      ("mem", self.mem.is_some()),
    ];
    let accepted: &[&str] = match kind {
      RuleKind::NativeLibrary => &["srcs", "deps", "hdrs", "cflags"],
      RuleKind::RawProgram => &["srcs", "deps", "hdrs", "cflags", "linkscript"],
      RuleKind::Multilink => &["core", "zp", "mem"],
      RuleKind::CpmFs => &["format", "size", "bootimage", "template", "items"],
      RuleKind::Imd => &["src"],
      RuleKind::CbmFs => &["title", "items"],
      RuleKind::Zip => &["items"],
    };
    match given.iter().find(|(field, present)| *present && !accepted.contains(field)) {
      Some((field, _)) => Err(GraphError::invalid_rule(
        target,
        format!("option '{}' is not valid for {}", field, kind),
      )),
      None => Ok(()),
    }
  }
}
