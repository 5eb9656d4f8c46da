//! Global Lua functions of a build script.
//!
//! This module registers:
//! - `rule(kind, name, opts)` - declare a target of any kind
//! - one helper per rule kind (`llvmclibrary{}`, `llvmrawprogram{}`,
//!   `multilink{}`, `mkcpmfs{}`, `mkimd{}`, `mkcbmfs{}`, `zip{}`), each taking
//!   the options table with a `name` field
//! - `include(path)` - evaluate another build file as its own package
//! - `items{}` and `union(...)` - ordered item sets and their merge
//! - `imgforge` - version and the current package
//!
//! Every declaring function returns the qualified name of the new target, so
//! scripts can pass it straight into another target's options.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

use mlua::prelude::*;
use thiserror::Error;
use tracing::debug;

use crate::consts::DEFAULT_BUILD_FILE;
use crate::graph::GraphError;
use crate::items::{ItemError, ItemMapping};
use crate::lua::runtime;
use crate::registry::Registry;
use crate::target::{QualifiedName, RuleArgs, RuleKind};

/// Everything a running build script has declared so far.
#[derive(Debug)]
pub struct DeclState {
  pub registry: Registry,
  root: PathBuf,
  packages: Vec<String>,
  included: HashSet<PathBuf>,
  error: Option<GraphError>,
}

impl DeclState {
  pub fn new(root: &Path) -> Self {
    Self {
      registry: Registry::new(),
      root: root.canonicalize().unwrap_or_else(|_| root.to_path_buf()),
      packages: Vec::new(),
      included: HashSet::new(),
      error: None,
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Package of the build file currently being evaluated.
  pub fn package(&self) -> &str {
    self.packages.last().map(String::as_str).unwrap_or("")
  }

  /// The first declaration error raised by the script, if any.
  pub fn take_error(&mut self) -> Option<GraphError> {
    self.error.take()
  }

  fn fail(&mut self, err: GraphError) -> LuaError {
    let lua_err = LuaError::external(err.clone());
    self.error.get_or_insert(err);
    lua_err
  }

  fn package_for(&self, dir: &Path) -> LuaResult<String> {
    let relative = dir.strip_prefix(&self.root).map_err(|_| {
      LuaError::external(format!(
        "'{}' is outside the project root '{}'",
        dir.display(),
        self.root.display()
      ))
    })?;
    let parts: Vec<String> = relative
      .components()
      .filter_map(|c| match c {
        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
        _ => None,
      })
      .collect();
    Ok(parts.join("/"))
  }
}

/// Evaluate the build file at `path` as a package.
///
/// A directory means its `build.lua`. Files already evaluated are skipped.
pub fn load_build_file(lua: &Lua, state: &Rc<RefCell<DeclState>>, path: &Path) -> LuaResult<()> {
  let path = if path.is_dir() {
    path.join(DEFAULT_BUILD_FILE)
  } else {
    path.to_path_buf()
  };
  let canonical = path
    .canonicalize()
    .map_err(|e| LuaError::external(format!("cannot include '{}': {}", path.display(), e)))?;

  {
    let mut s = state.borrow_mut();
    if !s.included.insert(canonical.clone()) {
      debug!(path = %canonical.display(), "build file already included");
      return Ok(());
    }
    let package = s.package_for(canonical.parent().unwrap_or(Path::new("")))?;
    debug!(path = %canonical.display(), package = %package, "evaluating build file");
    s.packages.push(package);
  }

  let result = runtime::load_file(lua, &canonical);
  state.borrow_mut().packages.pop();
  result.map(|_| ())
}

/// An ordered item set as seen from Lua.
#[derive(Debug, Clone, Default)]
pub struct LuaItems(pub ItemMapping<String>);

impl LuaUserData for LuaItems {
  fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
    methods.add_method("keys", |_, this, ()| {
      Ok(this.0.iter().map(|item| item.key.to_string()).collect::<Vec<_>>())
    });

    methods.add_method("get", |_, this, destination: String| {
      Ok(this.0.get(&destination).map(|item| item.source.clone()))
    });

    methods.add_meta_method(LuaMetaMethod::Len, |_, this, ()| Ok(this.0.len()));

    methods.add_meta_method(LuaMetaMethod::ToString, |_, this, ()| {
      let keys: Vec<String> = this.0.iter().map(|item| item.key.to_string()).collect();
      Ok(format!("items{{{}}}", keys.join(", ")))
    });

    methods.add_meta_function(LuaMetaMethod::BOr, |_, (base, overlay): (LuaValue, LuaValue)| {
      let base = items_from_value(base).map_err(LuaError::external)?;
      let overlay = items_from_value(overlay).map_err(LuaError::external)?;
      Ok(LuaItems(base.union(overlay)))
    });
  }
}

#[derive(Debug, Error)]
pub enum ItemsError {
  #[error("{0}")]
  Shape(String),

  #[error("invalid item '{key}': {source}")]
  Item {
    key: String,
    #[source]
    source: ItemError,
  },
}

/// Convert an item set given in Lua.
///
/// Accepts an `items{}` value, a sequence of `{destination, source}` pairs
/// (order kept) or a map table (sorted by destination).
pub fn items_from_value(value: LuaValue) -> Result<ItemMapping<String>, ItemsError> {
  match value {
    LuaValue::UserData(ud) => ud
      .borrow::<LuaItems>()
      .map(|items| items.0.clone())
      .map_err(|_| ItemsError::Shape("expected an item set".to_string())),
    LuaValue::Table(table) => items_from_table(&table),
    LuaValue::Nil => Ok(ItemMapping::new()),
    other => Err(ItemsError::Shape(format!(
      "expected an item set, got {}",
      other.type_name()
    ))),
  }
}

fn items_from_table(table: &LuaTable) -> Result<ItemMapping<String>, ItemsError> {
  let shape = |e: LuaError| ItemsError::Shape(e.to_string());
  let mut mapping = ItemMapping::new();

  let len = table.raw_len();
  if len > 0 {
    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
      let (key, _) = pair.map_err(shape)?;
      if !matches!(key, LuaValue::Integer(i) if i >= 1 && (i as usize) <= len) {
        let key = match key {
          LuaValue::String(s) => format!("'{}'", s.to_string_lossy()),
          other => other.type_name().to_string(),
        };
        return Err(ItemsError::Shape(format!(
          "item tables cannot mix {{destination, source}} pairs with keyed entries (found key {})",
          key
        )));
      }
    }
    for entry in table.clone().sequence_values::<LuaValue>() {
      let LuaValue::Table(pair) = entry.map_err(shape)? else {
        return Err(ItemsError::Shape(
          "item sequences must hold {destination, source} pairs".to_string(),
        ));
      };
      let key: String = pair.get(1).map_err(shape)?;
      let source: String = pair.get(2).map_err(shape)?;
      mapping
        .insert_str(&key, source)
        .map_err(|source| ItemsError::Item { key, source })?;
    }
    return Ok(mapping);
  }

  let mut sorted = BTreeMap::new();
  for pair in table.clone().pairs::<String, String>() {
    let (key, source) = pair.map_err(shape)?;
    sorted.insert(key, source);
  }
  for (key, source) in sorted {
    mapping
      .insert_str(&key, source)
      .map_err(|source| ItemsError::Item { key, source })?;
  }
  Ok(mapping)
}

fn string_value(option: &str, value: LuaValue) -> Result<String, String> {
  match value {
    LuaValue::String(s) => s
      .to_str()
      .map(|s| s.to_string())
      .map_err(|e| format!("option '{}': {}", option, e)),
    other => Err(format!("option '{}' must be a string, got {}", option, other.type_name())),
  }
}

fn string_list(option: &str, value: LuaValue) -> Result<Vec<String>, String> {
  match value {
    LuaValue::Table(table) => table
      .sequence_values::<LuaValue>()
      .map(|v| {
        let v = v.map_err(|e| format!("option '{}': {}", option, e))?;
        string_value(option, v)
      })
      .collect(),
    LuaValue::String(_) => Ok(vec![string_value(option, value)?]),
    other => Err(format!("option '{}' must be a list of strings, got {}", option, other.type_name())),
  }
}

fn string_map(option: &str, value: LuaValue) -> Result<BTreeMap<String, String>, String> {
  let LuaValue::Table(table) = value else {
    return Err(format!("option '{}' must be a table", option));
  };
  table
    .pairs::<String, String>()
    .map(|pair| pair.map_err(|e| format!("option '{}': {}", option, e)))
    .collect()
}

fn integer_value(option: &str, value: LuaValue) -> Result<u64, String> {
  match value {
    LuaValue::Integer(i) if i >= 0 => Ok(i as u64),
    LuaValue::Number(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as u64),
    other => Err(format!(
      "option '{}' must be a non-negative integer, got {}",
      option,
      other.type_name()
    )),
  }
}

/// Convert a declaration's options table.
///
/// `skip` names keys consumed by the caller, such as a helper's `name`.
fn parse_args(table: &LuaTable, target: &str, skip: &[&str]) -> Result<RuleArgs, GraphError> {
  let invalid = |message: String| GraphError::invalid_rule(target, message);
  let mut args = RuleArgs::default();

  for pair in table.clone().pairs::<LuaValue, LuaValue>() {
    let (key, value) = pair.map_err(|e| invalid(e.to_string()))?;
    let LuaValue::String(key) = key else {
      return Err(invalid("option names must be strings".to_string()));
    };
    let key = key.to_str().map_err(|e| invalid(e.to_string()))?.to_string();
    if skip.contains(&key.as_str()) {
      continue;
    }

    match key.as_str() {
      "srcs" => args.srcs = Some(string_list(&key, value).map_err(invalid)?),
      "deps" => args.deps = Some(string_list(&key, value).map_err(invalid)?),
      "cflags" => args.cflags = Some(string_list(&key, value).map_err(invalid)?),
      "hdrs" => args.hdrs = Some(string_map(&key, value).map_err(invalid)?),
      "linkscript" => args.linkscript = Some(string_value(&key, value).map_err(invalid)?),
      "format" => args.format = Some(string_value(&key, value).map_err(invalid)?),
      "size" => args.size = Some(integer_value(&key, value).map_err(invalid)?),
      "bootimage" => args.bootimage = Some(string_value(&key, value).map_err(invalid)?),
      "template" => args.template = Some(string_value(&key, value).map_err(invalid)?),
      "title" => args.title = Some(string_value(&key, value).map_err(invalid)?),
      "src" => args.src = Some(string_value(&key, value).map_err(invalid)?),
      "core" => args.core = Some(string_value(&key, value).map_err(invalid)?),
      "zp" => args.zp = Some(string_value(&key, value).map_err(invalid)?),
      "mem" => args.mem = Some(string_value(&key, value).map_err(invalid)?),
      "items" => {
        let items = items_from_value(value).map_err(|e| match e {
          ItemsError::Shape(message) => invalid(message),
          ItemsError::Item { key, source } => GraphError::item(target, &key, source),
        })?;
        args.items = Some(items);
      }
      other => return Err(invalid(format!("unknown option '{}'", other))),
    }
  }
  Ok(args)
}

fn declare(
  state: &Rc<RefCell<DeclState>>,
  kind: RuleKind,
  name: &str,
  opts: Option<&LuaTable>,
  skip: &[&str],
) -> LuaResult<String> {
  let package = state.borrow().package().to_string();
  let target = QualifiedName::declared_display(&package, name);

  let result = match opts {
    Some(table) => parse_args(table, &target, skip),
    None => Ok(RuleArgs::default()),
  }
  .and_then(|args| state.borrow_mut().registry.declare_rule(&package, kind, name, args));

  match result {
    Ok(qualified) => Ok(qualified.to_string()),
    Err(err) => Err(state.borrow_mut().fail(err)),
  }
}

/// Register the declaration globals in the Lua runtime.
pub fn register_globals(lua: &Lua, state: Rc<RefCell<DeclState>>) -> LuaResult<()> {
  let globals = lua.globals();

  // rule(kind, name, opts)
  let rule_state = state.clone();
  let rule = lua.create_function(move |_, (kind, name, opts): (String, String, Option<LuaTable>)| {
    let kind: RuleKind = kind.parse().map_err(LuaError::external)?;
    declare(&rule_state, kind, &name, opts.as_ref(), &[])
  })?;
  globals.set("rule", rule)?;

  for kind in RuleKind::ALL {
    let helper_state = state.clone();
    let helper = lua.create_function(move |_, opts: LuaTable| {
      let name: Option<String> = opts.get("name")?;
      let name = name.ok_or_else(|| LuaError::external(format!("{}{{}} requires a 'name'", kind.helper())))?;
      declare(&helper_state, kind, &name, Some(&opts), &["name"])
    })?;
    globals.set(kind.helper(), helper)?;
  }

  // include(path), relative to the including file
  let include_state = state.clone();
  let include = lua.create_function(move |lua, path: String| {
    let base = {
      let s = include_state.borrow();
      s.root().join(s.package())
    };
    load_build_file(lua, &include_state, &base.join(path))
  })?;
  globals.set("include", include)?;

  let items = lua.create_function(|_, value: LuaValue| {
    items_from_value(value).map(LuaItems).map_err(LuaError::external)
  })?;
  globals.set("items", items)?;

  let union = lua.create_function(|_, values: LuaVariadic<LuaValue>| {
    let mut merged = ItemMapping::new();
    for value in values.iter().cloned() {
      merged = merged.union(items_from_value(value).map_err(LuaError::external)?);
    }
    Ok(LuaItems(merged))
  })?;
  globals.set("union", union)?;

  let imgforge = lua.create_table()?;
  imgforge.set("version", env!("CARGO_PKG_VERSION"))?;
  let package_state = state;
  imgforge.set(
    "package",
    lua.create_function(move |_, ()| Ok(package_state.borrow().package().to_string()))?,
  )?;
  globals.set("imgforge", imgforge)?;

  Ok(())
}
