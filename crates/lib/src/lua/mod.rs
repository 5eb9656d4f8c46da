//! Lua runtime for build scripts.
//!
//! This module provides the Lua execution environment that turns `build.lua`
//! files into a target registry.
//!
//! # Submodules
//!
//! - [`globals`] - Declaration functions (`rule()`, `mkcpmfs{}`, `items{}`, etc.)
//! - [`runtime`] - Low-level Lua VM management

pub mod globals;
pub mod runtime;
