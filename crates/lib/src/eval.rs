//! Build script evaluation.
//!
//! This module provides the `evaluate_build_file` function which takes a path
//! to a Lua build script and returns the [`Registry`] of every target it (and
//! the files it includes) declared.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use mlua::prelude::*;
use tracing::info;

use crate::graph::{BuildGraph, GraphError};
use crate::lua::globals::{self, DeclState};
use crate::lua::runtime;
use crate::registry::Registry;

/// Errors that can occur while evaluating a build script.
///
/// The Lua error is kept as its rendered message so the error stays `Send`
/// and `Sync` and can be wrapped by `anyhow`.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
  /// Lua evaluation error.
  #[error("lua error: {0}")]
  Lua(String),

  /// A declaration was rejected.
  #[error(transparent)]
  Graph(#[from] GraphError),
}

impl From<LuaError> for ScriptError {
  fn from(err: LuaError) -> Self {
    ScriptError::Lua(err.to_string())
  }
}

/// Evaluate a build script and return the declared targets.
///
/// Packages are named after the directory of the declaring file relative to
/// the directory of `path`, so the root file declares into the `""` package.
///
/// # Example
/// ```ignore
/// use std::path::Path;
/// use imgforge_lib::eval::evaluate_build_file;
///
/// let registry = evaluate_build_file(Path::new("build.lua"))?;
/// println!("Targets: {}", registry.len());
/// ```
pub fn evaluate_build_file(path: &Path) -> Result<Registry, ScriptError> {
  let root = path.parent().unwrap_or(Path::new("."));
  let root = if root.as_os_str().is_empty() { Path::new(".") } else { root };
  let state = Rc::new(RefCell::new(DeclState::new(root)));

  // Evaluate in a block so the runtime releases its handles on the state
  let result = {
    let lua = runtime::create_runtime(state.clone())?;
    globals::load_build_file(&lua, &state, path)
  };
  let registry = finish(&state, result)?;
  info!(path = %path.display(), targets = registry.len(), "evaluated build script");
  Ok(registry)
}

/// Evaluate a build script given as a string, declaring into the root package.
///
/// Source file references resolve against `root`.
pub fn evaluate_str(source: &str, root: &Path) -> Result<Registry, ScriptError> {
  let state = Rc::new(RefCell::new(DeclState::new(root)));
  let result = {
    let lua = runtime::create_runtime(state.clone())?;
    lua.load(source).set_name("=build").exec()
  };
  finish(&state, result)
}

/// Evaluate a build script and resolve its graph.
pub fn load_graph(path: &Path) -> Result<BuildGraph, ScriptError> {
  let registry = evaluate_build_file(path)?;
  Ok(BuildGraph::from_registry(&registry)?)
}

fn finish(state: &Rc<RefCell<DeclState>>, result: LuaResult<()>) -> Result<Registry, ScriptError> {
  let mut state = state.borrow_mut();
  if let Err(err) = result {
    // Prefer the typed declaration error over its Lua wrapping
    return Err(match state.take_error() {
      Some(graph_err) => ScriptError::Graph(graph_err),
      None => ScriptError::from(err),
    });
  }
  Ok(std::mem::take(&mut state.registry))
}
