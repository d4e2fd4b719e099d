use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::pipeline::Pipeline;

/// Dependency graph over a pipeline's effective edges.
///
/// Multiple port edges between the same pair of nodes collapse into one
/// dependency. Edges naming nodes that do not exist are ignored here; the
/// validator reports them.
#[derive(Debug, Clone)]
pub struct Graph {
  /// Node ids in pipeline order.
  order: Vec<String>,
  /// Position of each node id in `order`.
  index: HashMap<String, usize>,
  /// Adjacency list: node_id -> list of downstream node_ids.
  adjacency: HashMap<String, Vec<String>>,
  /// Reverse adjacency: node_id -> list of upstream node_ids.
  reverse_adjacency: HashMap<String, Vec<String>>,
  /// Nodes with no incoming edges.
  entry_points: Vec<String>,
}

impl Graph {
  pub fn new(pipeline: &Pipeline) -> Self {
    let mut order: Vec<String> = Vec::with_capacity(pipeline.nodes.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();

    // Initialize all nodes
    for node in &pipeline.nodes {
      if index.contains_key(&node.node_id) {
        continue;
      }
      index.insert(node.node_id.clone(), order.len());
      order.push(node.node_id.clone());
      adjacency.entry(node.node_id.clone()).or_default();
      reverse_adjacency.entry(node.node_id.clone()).or_default();
    }

    // Build adjacency lists, one entry per node pair
    let mut seen: HashSet<(String, String)> = HashSet::new();
    for edge in pipeline.effective_edges() {
      let from = edge.source.node_id;
      let to = edge.target.node_id;
      if !index.contains_key(&from) || !index.contains_key(&to) {
        continue;
      }
      if !seen.insert((from.clone(), to.clone())) {
        continue;
      }
      adjacency.entry(from.clone()).or_default().push(to.clone());
      reverse_adjacency.entry(to).or_default().push(from);
    }

    // Find entry points (no incoming edges)
    let entry_points: Vec<String> = order
      .iter()
      .filter(|id| reverse_adjacency.get(*id).is_none_or(|v| v.is_empty()))
      .cloned()
      .collect();

    Self {
      order,
      index,
      adjacency,
      reverse_adjacency,
      entry_points,
    }
  }

  /// Node ids in pipeline order.
  pub fn nodes(&self) -> &[String] {
    &self.order
  }

  /// Get entry points (nodes with no incoming edges).
  pub fn entry_points(&self) -> &[String] {
    &self.entry_points
  }

  /// Get downstream nodes for a given node.
  pub fn downstream(&self, node_id: &str) -> &[String] {
    self
      .adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Get upstream nodes for a given node.
  pub fn upstream(&self, node_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Number of distinct upstream nodes.
  pub fn in_degree(&self, node_id: &str) -> usize {
    self.upstream(node_id).len()
  }

  /// Every node reachable downstream of `node_id`, excluding itself, in
  /// breadth-first order.
  pub fn dependents(&self, node_id: &str) -> Vec<String> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    let mut result = Vec::new();

    visited.insert(node_id);
    queue.push_back(node_id);
    while let Some(current) = queue.pop_front() {
      for next in self.downstream(current) {
        if visited.insert(next.as_str()) {
          result.push(next.clone());
          queue.push_back(next.as_str());
        }
      }
    }

    result
  }

  /// Kahn's algorithm, breaking ties by pipeline node order.
  ///
  /// On success returns every node in a valid execution order. If the graph
  /// has a cycle, returns the sorted ids of the nodes that could not be
  /// ordered (the cycle members and everything downstream of them).
  pub fn topological_order(&self) -> Result<Vec<String>, Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = self
      .order
      .iter()
      .map(|id| (id.as_str(), self.in_degree(id)))
      .collect();

    let mut ready: BTreeSet<usize> = self
      .order
      .iter()
      .enumerate()
      .filter(|(_, id)| in_degree.get(id.as_str()) == Some(&0))
      .map(|(i, _)| i)
      .collect();

    let mut sorted = Vec::with_capacity(self.order.len());
    while let Some(i) = ready.pop_first() {
      let id = &self.order[i];
      sorted.push(id.clone());
      for next in self.downstream(id) {
        if let Some(degree) = in_degree.get_mut(next.as_str()) {
          *degree -= 1;
          if *degree == 0
            && let Some(&j) = self.index.get(next)
          {
            ready.insert(j);
          }
        }
      }
    }

    if sorted.len() == self.order.len() {
      return Ok(sorted);
    }

    let done: HashSet<&String> = sorted.iter().collect();
    let mut remainder: Vec<String> = self
      .order
      .iter()
      .filter(|id| !done.contains(id))
      .cloned()
      .collect();
    remainder.sort();
    Err(remainder)
  }
}
