//! Ordering invariants over generated dependency graphs.

use std::collections::{BTreeSet, HashMap};

use imgforge_lib::graph::{BuildGraph, TargetId};
use imgforge_lib::items::ItemMapping;
use imgforge_lib::registry::Registry;
use imgforge_lib::target::{RuleArgs, RuleKind};

/// Small deterministic generator so every run checks the same graphs.
struct Lcg(u64);

impl Lcg {
  fn next(&mut self) -> u64 {
    self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    self.0 >> 33
  }

  fn below(&mut self, bound: usize) -> usize {
    (self.next() % bound as u64) as usize
  }
}

/// A random DAG of zip targets `+n0..+nN`.
///
/// Dependencies follow a shuffled rank rather than declaration order, so
/// targets regularly depend on ones declared after them.
fn generate(seed: u64) -> (BuildGraph, Vec<(usize, usize)>) {
  let mut rng = Lcg(seed);
  let count = 2 + rng.below(30);
  let mut rank: Vec<usize> = (0..count).collect();
  for i in (1..count).rev() {
    rank.swap(i, rng.below(i + 1));
  }

  let mut edges = Vec::new();
  let mut registry = Registry::new();
  for target in 0..count {
    let mut items = ItemMapping::new();
    for dep in 0..count {
      if rank[dep] < rank[target] && rng.below(4) == 0 {
        items.insert_str(&format!("n{}.zip", dep), format!(".+n{}", dep)).unwrap();
        edges.push((dep, target));
      }
    }
    let args = RuleArgs {
      items: Some(items),
      ..Default::default()
    };
    registry.declare_rule("", RuleKind::Zip, &format!("n{}", target), args).unwrap();
  }
  (BuildGraph::from_registry(&registry).unwrap(), edges)
}

#[test]
fn generated_graphs_order_dependencies_first() {
  for seed in 0..64 {
    let (graph, edges) = generate(seed);
    let roots = graph.top_level();
    let order = graph.build_order(&roots);
    assert_eq!(order.len(), graph.len(), "seed {seed}: every target is reachable from the top level");

    let position: HashMap<TargetId, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let waves = graph.waves(&roots);
    let wave: HashMap<TargetId, usize> = waves
      .iter()
      .enumerate()
      .flat_map(|(i, ids)| ids.iter().map(move |id| (*id, i)))
      .collect();

    for &(dep, dependent) in &edges {
      let (dep, dependent) = (TargetId(dep), TargetId(dependent));
      assert!(position[&dep] < position[&dependent], "seed {seed}: {dep} after {dependent}");
      assert!(wave[&dep] < wave[&dependent], "seed {seed}: {dep} not in an earlier wave than {dependent}");
    }
  }
}

#[test]
fn generated_graphs_break_ties_by_declaration() {
  for seed in 0..64 {
    let (graph, _) = generate(seed);
    let order = graph.build_order(&graph.top_level());

    // Each step takes the earliest declared target whose dependencies are done
    let mut done = BTreeSet::new();
    for &chosen in &order {
      let earliest_ready = graph
        .ids()
        .filter(|id| !done.contains(id))
        .find(|&id| graph.dependencies(id).iter().all(|dep| done.contains(dep)));
      assert_eq!(Some(chosen), earliest_ready, "seed {seed}");
      done.insert(chosen);
    }
  }
}

#[test]
fn generated_waves_are_longest_path_levels() {
  for seed in 0..64 {
    let (graph, _) = generate(seed);
    let waves = graph.waves(&graph.top_level());

    let mut level: HashMap<TargetId, usize> = HashMap::new();
    for (index, wave) in waves.iter().enumerate() {
      assert!(wave.windows(2).all(|w| w[0] < w[1]), "seed {seed}: wave not in declaration order");
      for &id in wave {
        let expected = graph.dependencies(id).iter().map(|dep| level[dep] + 1).max().unwrap_or(0);
        assert_eq!(index, expected, "seed {seed}: {id}");
        level.insert(id, index);
      }
    }
    assert_eq!(level.len(), graph.len());
  }
}
