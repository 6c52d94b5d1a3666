//! Dependency graph assembly.
//!
//! The graph is built from the requested roots by walking recorded dependencies. Cycles are
//! rejected here, before any path is resolved or any builder runs. The resulting DAG provides:
//! - a topological order (dependencies before dependents)
//! - parallel execution waves (groups of independent builders)
//! - dependency and dependent queries

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::builder::BuilderId;
use crate::env::Environment;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
  Active,
  Done,
}

/// Builders reachable from a set of roots, with an edge from each dependency to its
/// dependent.
#[derive(Debug)]
pub struct BuildGraph {
  graph: DiGraph<BuilderId, ()>,
  nodes: HashMap<BuilderId, NodeIndex>,
  /// Post-order of the assembly walk; a valid topological order.
  order: Vec<BuilderId>,
  roots: Vec<BuilderId>,
}

impl BuildGraph {
  /// Assemble the graph reachable from `roots`.
  ///
  /// Targets of every registered builder are declared first, so that a builder claiming a
  /// path another builder consumes is found even when it was registered later. A builder
  /// depends on the builders recorded at declaration and on the producer of each source.
  ///
  /// # Errors
  ///
  /// `CyclicDependency` names the builders along the cycle, e.g. `["a", "b", "a"]`.
  pub fn assemble(env: &mut Environment, roots: &[BuilderId]) -> Result<Self, ConfigError> {
    let mut marks: HashMap<BuilderId, Mark> = HashMap::new();
    let mut stack: Vec<BuilderId> = Vec::new();
    let mut order: Vec<BuilderId> = Vec::new();

    for &root in roots {
      env.slot(root)?;
    }
    for index in 0..env.builder_count() {
      env.targets_of(BuilderId(index))?;
    }

    for &root in roots {
      visit(env, root, &mut marks, &mut stack, &mut order)?;
    }

    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    for &id in &order {
      let idx = graph.add_node(id);
      nodes.insert(id, idx);
    }

    for &id in &order {
      let dependent_idx = nodes[&id];
      for dep in dependencies(env, id)? {
        if let Some(&dep_idx) = nodes.get(&dep) {
          // Edge from dependency to dependent
          graph.update_edge(dep_idx, dependent_idx, ());
        }
      }
    }

    let mut unique_roots = Vec::new();
    for &root in roots {
      if !unique_roots.contains(&root) {
        unique_roots.push(root);
      }
    }

    debug!(builders = order.len(), edges = graph.edge_count(), "assembled build graph");

    Ok(Self {
      graph,
      nodes,
      order,
      roots: unique_roots,
    })
  }

  /// Builders in an order where dependencies come before dependents.
  pub fn topological_order(&self) -> &[BuilderId] {
    &self.order
  }

  /// Builders organized into parallel execution waves.
  ///
  /// Each wave contains builders whose dependencies are all in previous waves. Builders
  /// within a wave are ordered by id.
  pub fn waves(&self) -> Result<Vec<Vec<BuilderId>>, ConfigError> {
    // Kahn's algorithm, level by level
    let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
    for idx in self.graph.node_indices() {
      in_degree.insert(idx, self.graph.neighbors_directed(idx, Direction::Incoming).count());
    }

    let mut remaining: HashSet<NodeIndex> = self.graph.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().filter(|&&idx| in_degree[&idx] == 0).copied().collect();

      if ready.is_empty() {
        let mut cycle: Vec<String> = remaining.iter().map(|idx| self.graph[*idx].to_string()).collect();
        cycle.sort();
        return Err(ConfigError::CyclicDependency { cycle });
      }

      for &idx in &ready {
        remaining.remove(&idx);
        for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&neighbor) {
            *deg = deg.saturating_sub(1);
          }
        }
      }

      let mut wave: Vec<BuilderId> = ready.into_iter().map(|idx| self.graph[idx]).collect();
      wave.sort();
      waves.push(wave);
    }

    Ok(waves)
  }

  /// Direct dependencies of a builder within the graph.
  pub fn dependencies(&self, id: BuilderId) -> Vec<BuilderId> {
    self.neighbors(id, Direction::Incoming)
  }

  /// Direct dependents of a builder within the graph.
  pub fn dependents(&self, id: BuilderId) -> Vec<BuilderId> {
    self.neighbors(id, Direction::Outgoing)
  }

  pub fn contains(&self, id: BuilderId) -> bool {
    self.nodes.contains_key(&id)
  }

  pub fn roots(&self) -> &[BuilderId] {
    &self.roots
  }

  pub fn len(&self) -> usize {
    self.order.len()
  }

  pub fn is_empty(&self) -> bool {
    self.order.is_empty()
  }

  fn neighbors(&self, id: BuilderId, direction: Direction) -> Vec<BuilderId> {
    let Some(&idx) = self.nodes.get(&id) else {
      return Vec::new();
    };

    let mut ids: Vec<BuilderId> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|other| self.graph[other])
      .collect();
    ids.sort();
    ids
  }
}

/// Recorded dependencies plus the producers of the builder's sources.
fn dependencies(env: &Environment, id: BuilderId) -> Result<Vec<BuilderId>, ConfigError> {
  let mut deps = env.dependencies_of(id)?.to_vec();
  for &source in env.sources_of(id)? {
    if let Some(producer) = env.producer_of(source)
      && !deps.contains(&producer)
    {
      deps.push(producer);
    }
  }
  Ok(deps)
}

fn visit(
  env: &Environment,
  id: BuilderId,
  marks: &mut HashMap<BuilderId, Mark>,
  stack: &mut Vec<BuilderId>,
  order: &mut Vec<BuilderId>,
) -> Result<(), ConfigError> {
  match marks.get(&id) {
    Some(Mark::Done) => return Ok(()),
    Some(Mark::Active) => {
      let start = stack.iter().position(|b| *b == id).unwrap_or(0);
      let mut cycle: Vec<String> = stack[start..].iter().map(|b| env.builder_name(*b)).collect();
      cycle.push(env.builder_name(id));
      return Err(ConfigError::CyclicDependency { cycle });
    }
    None => {}
  }

  marks.insert(id, Mark::Active);
  stack.push(id);

  for dep in dependencies(env, id)? {
    visit(env, dep, marks, stack, order)?;
  }

  stack.pop();
  marks.insert(id, Mark::Done);
  order.push(id);
  Ok(())
}
