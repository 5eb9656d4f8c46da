//! Dependency resolution over declared targets.
//!
//! [`BuildGraph::from_registry`] resolves every string reference into a
//! [`TargetId`] once, turns declarations into evaluable [`Rule`]s and rejects
//! cycles. Edges point from a dependency to its dependent, so a target is
//! ready once all of its incoming neighbours are done.

mod types;

pub use types::*;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::image::DiskDef;
use crate::items::ItemMapping;
use crate::output;
use crate::registry::Registry;
use crate::rule::{CompileRule, CpmFsRule, Input, Rule};
use crate::target::{CompileDecl, QualifiedName, Reference, RuleDecl, TargetDecl};

/// Source extensions that are headers rather than translation units.
const HEADER_EXTENSIONS: [&str; 2] = ["inc", "h"];

/// A resolved target.
#[derive(Debug, Clone)]
pub struct TargetNode {
  pub name: QualifiedName,
  pub rule: Rule,
}

#[derive(Debug)]
pub struct BuildGraph {
  graph: DiGraph<TargetId, ()>,
  nodes: Vec<TargetNode>,
  by_name: HashMap<QualifiedName, TargetId>,
}

struct Resolver<'a> {
  registry: &'a Registry,
}

impl Resolver<'_> {
  fn decl(&self, id: TargetId) -> &TargetDecl {
    // ids come from the registry itself
    &self.registry.targets()[id.0]
  }

  fn reference(&self, reference: &Reference, from: &TargetDecl) -> Result<Input, GraphError> {
    let id_of = |name: &QualifiedName| self.registry.position(name).map(TargetId);
    match reference {
      Reference::Target(name) => id_of(name).map(Input::Target).ok_or_else(|| GraphError::UnknownTarget {
        reference: name.to_string(),
        from: from.name.to_string(),
      }),
      Reference::File(path) => Ok(Input::File(path.clone())),
      Reference::Path(path) => Ok(
        Reference::implied_target(path)
          .and_then(|name| id_of(&name))
          .map(Input::Target)
          .unwrap_or_else(|| Input::File(PathBuf::from(path))),
      ),
    }
  }

  fn target(&self, reference: &Reference, from: &TargetDecl) -> Result<TargetId, GraphError> {
    match self.reference(reference, from)? {
      Input::Target(id) => Ok(id),
      Input::File(_) => Err(GraphError::UnknownTarget {
        reference: reference.to_string(),
        from: from.name.to_string(),
      }),
    }
  }

  fn items(&self, items: &ItemMapping<Reference>, from: &TargetDecl) -> Result<ItemMapping<Input>, GraphError> {
    items.try_map(|r| self.reference(r, from))
  }

  /// Split sources from headers and collect declared headers.
  fn own_sources(
    &self,
    decl: &CompileDecl,
    from: &TargetDecl,
  ) -> Result<(Vec<Input>, Vec<(String, Input)>), GraphError> {
    let mut srcs = Vec::new();
    let mut headers = Vec::new();
    for reference in &decl.srcs {
      let input = self.reference(reference, from)?;
      match &input {
        Input::File(path) if is_header(path) => {
          let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
          headers.push((name, input));
        }
        _ => srcs.push(input),
      }
    }
    for (name, reference) in &decl.hdrs {
      headers.push((name.clone(), self.reference(reference, from)?));
    }
    Ok((srcs, headers))
  }

  fn compile(&self, decl: &CompileDecl, from: &TargetDecl) -> Result<CompileRule, GraphError> {
    let (srcs, own_headers) = self.own_sources(decl, from)?;
    let mut headers: BTreeMap<String, Input> = own_headers.into_iter().collect();

    let mut libraries: Vec<TargetId> = Vec::new();
    let mut queue: VecDeque<(TargetId, &TargetDecl)> = VecDeque::new();
    for dep in &decl.deps {
      queue.push_back((self.target(dep, from)?, from));
    }
    while let Some((id, referrer)) = queue.pop_front() {
      if libraries.contains(&id) {
        continue;
      }
      let dep = self.decl(id);
      let RuleDecl::NativeLibrary(library) = &dep.rule else {
        return Err(GraphError::invalid_rule(
          &referrer.name.to_string(),
          format!("dependency {} is a {}, not a native library", dep.name, dep.rule.kind()),
        ));
      };
      libraries.push(id);
      let (_, inherited) = self.own_sources(library, dep)?;
      for (name, input) in inherited {
        headers.entry(name).or_insert(input);
      }
      for next in &library.deps {
        queue.push_back((self.target(next, dep)?, dep));
      }
    }

    Ok(CompileRule {
      srcs,
      headers,
      libraries,
      cflags: decl.cflags.clone(),
      linkscript: decl.linkscript.as_ref().map(|r| self.reference(r, from)).transpose()?,
    })
  }

  fn resolve(&self, decl: &TargetDecl) -> Result<Rule, GraphError> {
    let target = decl.name.to_string();
    Ok(match &decl.rule {
      RuleDecl::NativeLibrary(c) => Rule::NativeLibrary(self.compile(c, decl)?),
      RuleDecl::RawProgram(c) => Rule::RawProgram(self.compile(c, decl)?),
      RuleDecl::Multilink { core, zp, mem } => Rule::Multilink {
        core: self.reference(core, decl)?,
        zp: self.reference(zp, decl)?,
        mem: self.reference(mem, decl)?,
      },
      RuleDecl::CpmFs(fs) => {
        let format = DiskDef::lookup(&fs.format)
          .ok_or_else(|| GraphError::invalid_rule(&target, format!("unknown disk format '{}'", fs.format)))?;
        if fs.template.is_some() && format.boottrk > 0 {
          return Err(GraphError::invalid_rule(
            &target,
            format!("format {} reserves boot tracks and cannot use a template", format.name),
          ));
        }
        if fs.bootimage.is_none() && fs.template.is_none() && format.boottrk > 0 {
          return Err(GraphError::invalid_rule(
            &target,
            format!("format {} reserves {} boot track(s) and needs a bootimage", format.name, format.boottrk),
          ));
        }
        if fs.bootimage.is_some() && format.boottrk == 0 {
          return Err(GraphError::invalid_rule(
            &target,
            format!("format {} has no boot tracks for a bootimage", format.name),
          ));
        }
        Rule::CpmFs(CpmFsRule {
          format,
          size: fs.size,
          boot: fs.bootimage.as_ref().map(|r| self.reference(r, decl)).transpose()?,
          template: fs.template.as_ref().map(|r| self.reference(r, decl)).transpose()?,
          items: self.items(&fs.items, decl)?,
        })
      }
      RuleDecl::Imd { src } => {
        let input = self.reference(src, decl)?;
        let source = input.target().map(|id| self.decl(id));
        let geometry = match source.map(|s| &s.rule) {
          Some(RuleDecl::CpmFs(fs)) if fs.template.is_none() => DiskDef::lookup(&fs.format).map(|d| d.geometry()),
          _ => None,
        };
        let comment = source.map(|s| s.name.to_string()).unwrap_or_else(|| src.to_string());
        Rule::Imd {
          src: input,
          geometry,
          comment,
        }
      }
      RuleDecl::CbmFs { title, items } => Rule::CbmFs {
        title: title.clone(),
        items: self.items(items, decl)?,
      },
      RuleDecl::Zip { items } => Rule::Zip {
        items: self.items(items, decl)?,
      },
    })
  }
}

fn is_header(path: &Path) -> bool {
  path
    .extension()
    .and_then(|e| e.to_str())
    .is_some_and(|e| HEADER_EXTENSIONS.contains(&e))
}

impl BuildGraph {
  /// Resolve all declarations of `registry`.
  ///
  /// # Errors
  ///
  /// Any unresolvable reference, inconsistent rule or dependency cycle.
  pub fn from_registry(registry: &Registry) -> Result<Self, GraphError> {
    let resolver = Resolver { registry };
    let mut graph = DiGraph::new();
    let mut nodes = Vec::with_capacity(registry.len());
    let mut by_name = HashMap::with_capacity(registry.len());

    // First pass: one node per target, in declaration order
    for (idx, decl) in registry.iter().enumerate() {
      graph.add_node(TargetId(idx));
      by_name.insert(decl.name.clone(), TargetId(idx));
    }

    // Second pass: resolve rules and add dependency edges
    for (idx, decl) in registry.iter().enumerate() {
      let rule = resolver.resolve(decl)?;
      for dep in rule.dependencies() {
        graph.add_edge(NodeIndex::new(dep.0), NodeIndex::new(idx), ());
      }
      nodes.push(TargetNode {
        name: decl.name.clone(),
        rule,
      });
    }

    let resolved = Self { graph, nodes, by_name };
    resolved.verify_acyclic()?;
    resolved.verify_outputs()?;
    debug!(targets = resolved.len(), edges = resolved.graph.edge_count(), "resolved build graph");
    Ok(resolved)
  }

  fn verify_acyclic(&self) -> Result<(), GraphError> {
    let mut cycles: Vec<Vec<TargetId>> = tarjan_scc(&self.graph)
      .into_iter()
      .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
      .map(|scc| {
        let mut ids: Vec<TargetId> = scc.into_iter().map(|n| self.graph[n]).collect();
        ids.sort();
        ids
      })
      .collect();
    cycles.sort();
    match cycles.first() {
      Some(members) => Err(GraphError::CyclicDependency {
        chain: self.cycle_chain(members).iter().map(|id| self.name(*id).to_string()).collect(),
      }),
      None => Ok(()),
    }
  }

  /// Every target owns a distinct output path, and no output file sits where
  /// another target needs a directory.
  fn verify_outputs(&self) -> Result<(), GraphError> {
    let collision = |target: TargetId, other: TargetId, path: &Path| GraphError::OutputCollision {
      target: self.name(target).to_string(),
      other: self.name(other).to_string(),
      path: path.display().to_string(),
    };

    let mut owners: HashMap<PathBuf, TargetId> = HashMap::with_capacity(self.len());
    for id in self.ids() {
      let path = output::relative_path(self.name(id));
      if let Some(&first) = owners.get(&path) {
        return Err(collision(first, id, &path));
      }
      owners.insert(path, id);
    }
    for id in self.ids() {
      let path = output::relative_path(self.name(id));
      for dir in path.ancestors().skip(1) {
        if let Some(&file_owner) = owners.get(dir) {
          return Err(collision(file_owner, id, dir));
        }
      }
    }
    Ok(())
  }

  /// Shortest dependency path from the first member back to itself.
  fn cycle_chain(&self, members: &[TargetId]) -> Vec<TargetId> {
    let start = members[0];
    let inside: HashSet<TargetId> = members.iter().copied().collect();
    let mut parent: HashMap<TargetId, TargetId> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(current) = queue.pop_front() {
      for dep in self.dependencies(current) {
        if !inside.contains(&dep) {
          continue;
        }
        if dep == start {
          let mut path = vec![current];
          let mut at = current;
          while let Some(&prev) = parent.get(&at) {
            path.push(prev);
            at = prev;
          }
          path.reverse();
          path.push(start);
          return path;
        }
        if dep != current && !parent.contains_key(&dep) {
          parent.insert(dep, current);
          queue.push_back(dep);
        }
      }
    }
    members.to_vec()
  }

  /// Find a target by its qualified name.
  pub fn id(&self, name: &QualifiedName) -> Option<TargetId> {
    self.by_name.get(name).copied()
  }

  /// Parse and look up a qualified name given by a caller.
  pub fn lookup(&self, raw: &str) -> Result<TargetId, GraphError> {
    let name: QualifiedName = raw.parse().map_err(|source| GraphError::InvalidName {
      target: raw.to_string(),
      source,
    })?;
    self.id(&name).ok_or_else(|| GraphError::UnknownTarget {
      reference: raw.to_string(),
      from: "the build request".to_string(),
    })
  }

  pub fn node(&self, id: TargetId) -> &TargetNode {
    &self.nodes[id.0]
  }

  pub fn name(&self, id: TargetId) -> &QualifiedName {
    &self.nodes[id.0].name
  }

  pub fn rule(&self, id: TargetId) -> &Rule {
    &self.nodes[id.0].rule
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub fn ids(&self) -> impl Iterator<Item = TargetId> + '_ {
    (0..self.nodes.len()).map(TargetId)
  }

  /// Direct dependencies, in declaration order.
  pub fn dependencies(&self, id: TargetId) -> Vec<TargetId> {
    self.neighbors(id, Direction::Incoming)
  }

  /// Direct dependents, in declaration order.
  pub fn dependents(&self, id: TargetId) -> Vec<TargetId> {
    self.neighbors(id, Direction::Outgoing)
  }

  fn neighbors(&self, id: TargetId, direction: Direction) -> Vec<TargetId> {
    let set: BTreeSet<TargetId> = self
      .graph
      .neighbors_directed(NodeIndex::new(id.0), direction)
      .map(|n| self.graph[n])
      .collect();
    set.into_iter().collect()
  }

  /// Targets nothing else depends on.
  pub fn top_level(&self) -> Vec<TargetId> {
    self.ids().filter(|&id| self.dependents(id).is_empty()).collect()
  }

  /// `roots` and everything they transitively depend on.
  pub fn closure(&self, roots: &[TargetId]) -> BTreeSet<TargetId> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<TargetId> = roots.to_vec();
    while let Some(id) = stack.pop() {
      if seen.insert(id) {
        stack.extend(self.dependencies(id));
      }
    }
    seen
  }

  /// The closure of `roots` in evaluation order.
  ///
  /// Every dependency precedes its dependents. Among targets that are ready
  /// at the same time, the earliest declared comes first.
  pub fn build_order(&self, roots: &[TargetId]) -> Vec<TargetId> {
    self.waves_by(roots, false).into_iter().flatten().collect()
  }

  /// The closure of `roots` grouped into waves of mutually independent
  /// targets. Each wave only depends on earlier waves.
  pub fn waves(&self, roots: &[TargetId]) -> Vec<Vec<TargetId>> {
    self.waves_by(roots, true)
  }

  fn waves_by(&self, roots: &[TargetId], levelled: bool) -> Vec<Vec<TargetId>> {
    let closure = self.closure(roots);
    let mut in_degree: HashMap<TargetId, usize> = closure
      .iter()
      .map(|&id| (id, self.dependencies(id).len()))
      .collect();

    let mut result = Vec::new();
    let mut ready: BTreeSet<TargetId> = closure.iter().copied().filter(|id| in_degree[id] == 0).collect();
    while !ready.is_empty() {
      let current: Vec<TargetId> = if levelled {
        std::mem::take(&mut ready).into_iter().collect()
      } else {
        ready.pop_first().into_iter().collect()
      };
      for &id in &current {
        for dependent in self.dependents(id) {
          if let Some(deg) = in_degree.get_mut(&dependent) {
            *deg = deg.saturating_sub(1);
            if *deg == 0 {
              ready.insert(dependent);
            }
          }
        }
      }
      result.push(current);
    }
    result
  }
}
