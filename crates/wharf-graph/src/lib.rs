//! Dependency graph construction and topological ordering.
//!
//! Mirrors the teacher's `cargo_metadata`-driven topological sort (name -> dependency
//! edges, `BTreeSet` ready-queue for deterministic lexicographic tie-break) but generalized
//! to arbitrary named nodes instead of `cargo_metadata::PackageId`s, since there is no
//! workspace manifest here — nodes arrive directly from a build submission.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use wharf_types::DagNode;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("package {0:?} already present in graph")]
    DuplicatePackage(String),
    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// A directed dependency graph over package nodes.
///
/// Nodes are stored in a flat sequence plus a name -> index map; dependency edges live on
/// each node as a set of names, never as pointers, so the graph is trivially deep-copyable
/// and free of cyclic ownership.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<DagNode>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        config_yaml: impl Into<String>,
        dependencies: impl IntoIterator<Item = String>,
    ) -> Result<(), GraphError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(GraphError::DuplicatePackage(name));
        }
        let deps: BTreeSet<String> = dependencies.into_iter().collect();
        self.index.insert(name.clone(), self.nodes.len());
        self.nodes.push(DagNode {
            name,
            config_yaml: config_yaml.into(),
            dependencies: deps,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&DagNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[DagNode] {
        &self.nodes
    }

    /// Intersect a dependency set with the names actually present in this graph.
    /// External dependencies (names not in the graph) never affect ordering or cascade.
    pub fn filter_in_graph<'a>(&self, deps: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
        deps.into_iter()
            .filter(|d| self.index.contains_key(d.as_str()))
            .cloned()
            .collect()
    }

    /// Names whose in-graph dependency set is empty.
    pub fn immediately_buildable(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .filter(|n| self.filter_in_graph(&n.dependencies).is_empty())
            .map(|n| n.name.clone())
            .collect()
    }

    /// Kahn's algorithm over the in-graph subgraph, with lexicographic tie-break among
    /// nodes that become ready simultaneously.
    pub fn topological_sort(&self) -> Result<Vec<DagNode>, GraphError> {
        if self.nodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents_of: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for node in &self.nodes {
            let in_graph_deps = self.filter_in_graph(&node.dependencies);
            indegree.insert(&node.name, in_graph_deps.len());
            for dep in &in_graph_deps {
                dependents_of.entry(self.node(dep).unwrap().name.as_str()).or_default().push(&node.name);
            }
        }

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&name, _)| name)
            .collect();

        let mut out: Vec<DagNode> = Vec::with_capacity(self.nodes.len());

        while let Some(&name) = ready.iter().next() {
            ready.remove(name);
            out.push(self.node(name).unwrap().clone());

            if let Some(dependents) = dependents_of.get(name) {
                for &dependent in dependents {
                    let deg = indegree.get_mut(dependent).expect("dependent tracked in indegree");
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if out.len() != self.nodes.len() {
            let cycle = self.detect_cycle().unwrap_or_else(|| vec!["<unknown>".to_string()]);
            return Err(GraphError::Cycle(cycle));
        }

        Ok(out)
    }

    /// DFS with parent pointers to extract one cycle path, used once Kahn's algorithm
    /// stalls before consuming every node.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = self.nodes.iter().map(|n| (n.name.as_str(), Mark::Unvisited)).collect();
        let mut parent: HashMap<&str, &str> = HashMap::new();

        for start in &self.nodes {
            if marks[start.name.as_str()] != Mark::Unvisited {
                continue;
            }

            let mut stack = vec![start.name.as_str()];
            while let Some(&name) = stack.last() {
                match marks[name] {
                    Mark::Unvisited => {
                        marks.insert(name, Mark::InProgress);
                        let node = self.node(name).expect("node in graph");
                        let mut pushed = false;
                        for dep in self.filter_in_graph(&node.dependencies) {
                            let dep_name = self.node(&dep).unwrap().name.as_str();
                            match marks[dep_name] {
                                Mark::Unvisited => {
                                    parent.insert(dep_name, name);
                                    stack.push(dep_name);
                                    pushed = true;
                                    break;
                                }
                                Mark::InProgress => {
                                    // Found the cycle: walk back from `name` to `dep_name`.
                                    let mut path = vec![dep_name.to_string()];
                                    let mut cur = name;
                                    while cur != dep_name {
                                        path.push(cur.to_string());
                                        cur = parent[cur];
                                    }
                                    path.push(dep_name.to_string());
                                    path.reverse();
                                    return Some(path);
                                }
                                Mark::Done => {}
                            }
                        }
                        if !pushed {
                            stack.pop();
                            marks.insert(name, Mark::Done);
                        }
                    }
                    _ => {
                        stack.pop();
                    }
                }
            }
        }

        None
    }
}
