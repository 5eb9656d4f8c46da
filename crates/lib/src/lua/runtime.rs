use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use mlua::prelude::*;

use crate::lua::globals::{self, DeclState};

/// Create a new Lua runtime with the declaration globals registered.
pub fn create_runtime(state: Rc<RefCell<DeclState>>) -> LuaResult<Lua> {
  let lua = Lua::new();
  globals::register_globals(&lua, state)?;
  Ok(lua)
}

/// Load and execute a Lua file in its own environment.
///
/// The environment carries `__dir`, the directory of the file, and falls
/// back to the globals for everything else.
pub fn load_file(lua: &Lua, path: &Path) -> LuaResult<LuaValue> {
  let canonical_path = path
    .canonicalize()
    .map_err(|e| LuaError::external(format!("cannot canonicalize '{}': {}", path.display(), e)))?;
  let content = std::fs::read_to_string(&canonical_path)
    .map_err(|e| LuaError::external(format!("cannot read '{}': {}", canonical_path.display(), e)))?;

  let env = lua.create_table()?;
  env.set(
    "__dir",
    canonical_path
      .parent()
      .unwrap_or(Path::new(""))
      .to_string_lossy()
      .to_string(),
  )?;
  let mt = lua.create_table()?;
  mt.set("__index", lua.globals())?;
  mt.set("__newindex", lua.globals())?;
  env.set_metatable(Some(mt))?;

  lua
    .load(&content)
    .set_name(format!("@{}", canonical_path.display()))
    .set_environment(env)
    .eval::<LuaValue>()
}
