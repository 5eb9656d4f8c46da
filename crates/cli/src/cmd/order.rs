//! Implementation of the `imgforge order` command.
//!
//! Prints the transitive closure of one target in the order the engine would
//! evaluate it: every dependency before its dependents.

use std::path::Path;

use anyhow::{Context, Result};

use crate::output::{OutputFormat, print_json};

pub fn cmd_order(file: &Path, target: &str, format: OutputFormat) -> Result<()> {
  let graph = super::load(file)?;
  let id = graph.lookup(target).with_context(|| format!("Cannot order '{}'", target))?;

  let order: Vec<String> = graph
    .build_order(&[id])
    .into_iter()
    .map(|id| graph.name(id).to_string())
    .collect();

  if format.is_json() {
    return print_json(&order);
  }
  for (idx, name) in order.iter().enumerate() {
    println!("{:>3}. {}", idx + 1, name);
  }
  Ok(())
}
