//! Qualified target names and declaration references.
//!
//! A qualified name is `<package>+<local-id>` or `<package>:<attribute>`,
//! where the package is a `/`-separated path relative to the project root
//! (empty for the root build file). The separator is part of the identity.
//! A declaration named `:objects` declares the attribute `<package>:objects`.
//!
//! References written in declarations are parsed relative to the declaring
//! package:
//!
//! | Reference      | Meaning                                               |
//! |----------------|-------------------------------------------------------|
//! | `.+bios`       | target `bios` in the declaring package                |
//! | `.:objects`    | attribute `objects` in the declaring package          |
//! | `src/lib+bios` | target `bios` in package `src/lib`                    |
//! | `./bios.S`     | source file `bios.S` next to the build file           |
//! | `src/bdos`     | target `src/bdos+bdos` if declared, else a plain file |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing names and references.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
  #[error("empty target reference")]
  Empty,

  #[error("invalid target name '{name}': {reason}")]
  Invalid { name: String, reason: String },

  #[error("path '{path}' escapes the project root")]
  EscapesRoot { path: String },
}

/// Separator between the package path and the local part of a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Separator {
  /// `<path>+<local-id>`
  Plus,
  /// `<path>:<attribute>`
  Colon,
}

impl Separator {
  pub fn as_char(self) -> char {
    match self {
      Separator::Plus => '+',
      Separator::Colon => ':',
    }
  }
}

/// A unique target identifier within a registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualifiedName {
  package: String,
  separator: Separator,
  local: String,
}

impl QualifiedName {
  /// Create a `<package>+<local>` name.
  pub fn new(package: &str, local: &str) -> Result<Self, NameError> {
    Self::with_separator(package, Separator::Plus, local)
  }

  pub fn with_separator(package: &str, separator: Separator, local: &str) -> Result<Self, NameError> {
    let display = format!("{}{}{}", package, separator.as_char(), local);
    if local.is_empty() {
      return Err(NameError::Invalid {
        name: display,
        reason: "the local part is empty".to_string(),
      });
    }
    if local.contains(['+', ':', '/']) {
      return Err(NameError::Invalid {
        name: display,
        reason: "the local part may not contain '+', ':' or '/'".to_string(),
      });
    }
    let package = normalize_package(package)?;
    Ok(Self {
      package,
      separator,
      local: local.to_string(),
    })
  }

  /// Name declared as `name` inside `package`.
  ///
  /// A leading `:` declares an attribute (`<package>:<attribute>`); otherwise
  /// the name is a plain `<package>+<local>`, with an optional leading `+`.
  pub fn declared(package: &str, name: &str) -> Result<Self, NameError> {
    match name.strip_prefix(':') {
      Some(attribute) => Self::with_separator(package, Separator::Colon, attribute),
      None => Self::new(package, name.strip_prefix('+').unwrap_or(name)),
    }
  }

  /// How `name` declared in `package` is shown before it is validated.
  pub fn declared_display(package: &str, name: &str) -> String {
    if name.starts_with([':', '+']) {
      format!("{}{}", package, name)
    } else {
      format!("{}+{}", package, name)
    }
  }

  pub fn package(&self) -> &str {
    &self.package
  }

  pub fn separator(&self) -> Separator {
    self.separator
  }

  pub fn local(&self) -> &str {
    &self.local
  }
}

impl fmt::Display for QualifiedName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}{}{}", self.package, self.separator.as_char(), self.local)
  }
}

impl FromStr for QualifiedName {
  type Err = NameError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let Some(pos) = s.find(['+', ':']) else {
      return Err(NameError::Invalid {
        name: s.to_string(),
        reason: "expected '<path>+<name>' or '<path>:<attribute>'".to_string(),
      });
    };
    let separator = if s.as_bytes()[pos] == b'+' {
      Separator::Plus
    } else {
      Separator::Colon
    };
    Self::with_separator(&s[..pos], separator, &s[pos + 1..])
  }
}

/// A reference as written in a declaration, already anchored to its package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reference {
  /// An explicit target name.
  Target(QualifiedName),
  /// A source file relative to the project root.
  File(PathBuf),
  /// A bare path: the target `<path>+<basename>` when declared, else a file.
  Path(String),
}

impl Reference {
  /// Parse a reference written inside `package`.
  pub fn parse(raw: &str, package: &str) -> Result<Self, NameError> {
    let raw = raw.trim();
    if raw.is_empty() {
      return Err(NameError::Empty);
    }

    if let Some(rest) = raw.strip_prefix('.')
      && (rest.starts_with('+') || rest.starts_with(':'))
    {
      return Ok(Reference::Target(format!("{}{}", package, rest).parse()?));
    }

    if raw.starts_with("./") || raw.starts_with("../") {
      let joined = if package.is_empty() {
        raw.to_string()
      } else {
        format!("{}/{}", package, raw)
      };
      return Ok(Reference::File(PathBuf::from(normalize_package(&joined)?)));
    }

    if raw.contains(['+', ':']) {
      return Ok(Reference::Target(raw.parse()?));
    }

    Ok(Reference::Path(normalize_package(raw)?))
  }

  /// The target a bare path would name, if it were declared.
  pub fn implied_target(path: &str) -> Option<QualifiedName> {
    let basename = path.rsplit('/').next()?;
    QualifiedName::new(path, basename).ok()
  }
}

impl fmt::Display for Reference {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Reference::Target(name) => write!(f, "{}", name),
      Reference::File(path) => write!(f, "{}", path.display()),
      Reference::Path(path) => write!(f, "{}", path),
    }
  }
}

/// Lexically normalize a `/`-separated package path.
fn normalize_package(path: &str) -> Result<String, NameError> {
  let mut parts: Vec<&str> = Vec::new();
  for part in path.split('/') {
    match part {
      "" | "." => {}
      ".." => {
        if parts.pop().is_none() {
          return Err(NameError::EscapesRoot { path: path.to_string() });
        }
      }
      other => parts.push(other),
    }
  }
  Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
  use super::*;

  mod qualified_name {
    use super::*;

    #[test]
    fn parses_plus_form() {
      let name: QualifiedName = "src/arch/kim-1+bios-k1013".parse().unwrap();
      assert_eq!(name.package(), "src/arch/kim-1");
      assert_eq!(name.local(), "bios-k1013");
      assert_eq!(name.separator(), Separator::Plus);
      assert_eq!(name.to_string(), "src/arch/kim-1+bios-k1013");
    }

    #[test]
    fn parses_colon_form() {
      let name: QualifiedName = "src/lib:objects".parse().unwrap();
      assert_eq!(name.separator(), Separator::Colon);
      assert_eq!(name.local(), "objects");
    }

    #[test]
    fn declared_names_pick_their_separator() {
      let attribute = QualifiedName::declared("src/lib", ":objects").unwrap();
      assert_eq!(attribute.separator(), Separator::Colon);
      assert_eq!(attribute.to_string(), "src/lib:objects");

      assert_eq!(QualifiedName::declared("src/lib", "bios").unwrap().to_string(), "src/lib+bios");
      assert_eq!(QualifiedName::declared("src/lib", "+bios").unwrap().to_string(), "src/lib+bios");
      assert!(QualifiedName::declared("src/lib", ":").is_err());
      assert!(QualifiedName::declared("src/lib", ":a:b").is_err());
      assert_eq!(QualifiedName::declared_display("src/lib", ":"), "src/lib:");
    }

    #[test]
    fn separator_is_part_of_identity() {
      let plus: QualifiedName = "src+ccp".parse().unwrap();
      let colon: QualifiedName = "src:ccp".parse().unwrap();
      assert_ne!(plus, colon);
    }

    #[test]
    fn local_may_contain_dots() {
      let name: QualifiedName = "src/arch/kim-1/boot+boot.bin".parse().unwrap();
      assert_eq!(name.local(), "boot.bin");
    }

    #[test]
    fn root_package_is_empty() {
      let name: QualifiedName = "+distro".parse().unwrap();
      assert_eq!(name.package(), "");
      assert_eq!(name.to_string(), "+distro");
    }

    #[test]
    fn rejects_missing_separator() {
      assert!("src/bdos".parse::<QualifiedName>().is_err());
    }

    #[test]
    fn rejects_empty_local() {
      assert!("src+".parse::<QualifiedName>().is_err());
    }

    #[test]
    fn package_is_normalized() {
      let name: QualifiedName = "src/./arch//kim-1+x".parse().unwrap();
      assert_eq!(name.package(), "src/arch/kim-1");
    }
  }

  mod reference {
    use super::*;

    #[test]
    fn relative_target() {
      let r = Reference::parse(".+bios-k1013", "src/arch/kim-1").unwrap();
      assert_eq!(
        r,
        Reference::Target(QualifiedName::new("src/arch/kim-1", "bios-k1013").unwrap())
      );
    }

    #[test]
    fn relative_file() {
      let r = Reference::parse("./kim-1.S", "src/arch/kim-1").unwrap();
      assert_eq!(r, Reference::File(PathBuf::from("src/arch/kim-1/kim-1.S")));
    }

    #[test]
    fn parent_relative_file() {
      let r = Reference::parse("../common.inc", "src/arch/kim-1").unwrap();
      assert_eq!(r, Reference::File(PathBuf::from("src/arch/common.inc")));
    }

    #[test]
    fn absolute_target() {
      let r = Reference::parse("apps+scrvt100", "src/arch/kim-1").unwrap();
      assert_eq!(r, Reference::Target(QualifiedName::new("apps", "scrvt100").unwrap()));
    }

    #[test]
    fn bare_path_is_deferred() {
      let r = Reference::parse("src/bdos", "src/arch/kim-1").unwrap();
      assert_eq!(r, Reference::Path("src/bdos".to_string()));
      assert_eq!(
        Reference::implied_target("src/bdos").unwrap().to_string(),
        "src/bdos+bdos"
      );
    }

    #[test]
    fn escaping_root_is_rejected() {
      assert!(matches!(
        Reference::parse("../../x", "src"),
        Err(NameError::EscapesRoot { .. })
      ));
    }

    #[test]
    fn empty_reference_is_rejected() {
      assert_eq!(Reference::parse("  ", ""), Err(NameError::Empty));
    }
  }
}
