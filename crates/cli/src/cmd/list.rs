//! Implementation of the `imgforge list` command.

use std::path::Path;

use anyhow::Result;
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

use crate::output::{OutputFormat, print_json, print_stat, symbols};

#[derive(Debug, Serialize)]
struct TargetEntry {
  name: String,
  kind: String,
  dependencies: Vec<String>,
  top_level: bool,
}

/// Print every declared target with its kind and direct dependencies, in
/// declaration order. Top-level targets are marked.
pub fn cmd_list(file: &Path, format: OutputFormat) -> Result<()> {
  let graph = super::load(file)?;

  let entries: Vec<TargetEntry> = graph
    .ids()
    .map(|id| TargetEntry {
      name: graph.name(id).to_string(),
      kind: graph.rule(id).kind().to_string(),
      dependencies: graph.dependencies(id).into_iter().map(|dep| graph.name(dep).to_string()).collect(),
      top_level: graph.dependents(id).is_empty(),
    })
    .collect();

  if format.is_json() {
    return print_json(&entries);
  }

  for entry in &entries {
    let marker = if entry.top_level { symbols::INFO } else { " " };
    println!(
      "{} {} {}",
      marker,
      entry.name,
      format!("({})", entry.kind).if_supports_color(Stream::Stdout, |s| s.dimmed())
    );
    for dep in &entry.dependencies {
      println!("    {} {}", symbols::ARROW, dep);
    }
  }
  println!();
  print_stat("Targets", &entries.len().to_string());
  print_stat("Top level", &entries.iter().filter(|e| e.top_level).count().to_string());
  Ok(())
}
