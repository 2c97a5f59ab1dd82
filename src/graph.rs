//! Parent → children graph over a registration set, tree paths and a
//! children-first registration order.

use std::collections::{HashMap, HashSet};

use crate::error::StoreError;
use crate::metadata::StateDescriptor;

/// Name graph of one registration set, in input order.
#[derive(Debug, Clone)]
pub struct StateGraph {
    nodes: Vec<(StateDescriptor, Vec<String>)>,
    index: HashMap<String, usize>,
}

impl StateGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Names in input order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|(d, _)| d.name())
    }

    pub fn descriptor(&self, name: &str) -> Option<&StateDescriptor> {
        self.index.get(name).map(|&i| &self.nodes[i].0)
    }

    pub fn children(&self, name: &str) -> &[String] {
        self.index
            .get(name)
            .map(|&i| self.nodes[i].1.as_slice())
            .unwrap_or(&[])
    }
}

/// Build the name graph of `descriptors`.
///
/// Every declared child must itself be part of `descriptors`; two different
/// descriptors may not share a name. Listing one descriptor twice is fine.
pub fn build_graph(descriptors: &[StateDescriptor]) -> Result<StateGraph, StoreError> {
    let mut nodes: Vec<(StateDescriptor, Vec<String>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for descriptor in descriptors {
        if let Some(&i) = index.get(descriptor.name()) {
            let existing: &StateDescriptor = &nodes[i].0;
            if existing.ptr_eq(descriptor) {
                continue;
            }
            return Err(StoreError::Configuration(format!(
                "state name '{}' is used by both {} and {}",
                descriptor.name(),
                existing.type_name(),
                descriptor.type_name()
            )));
        }
        index.insert(descriptor.name().to_string(), nodes.len());
        nodes.push((descriptor.clone(), Vec::new()));
    }

    for i in 0..nodes.len() {
        let parent = nodes[i].0.clone();
        let mut names = Vec::new();
        for child in parent.children()? {
            let present = index
                .get(child.name())
                .is_some_and(|&j| nodes[j].0.ptr_eq(&child));
            if !present {
                return Err(StoreError::Configuration(format!(
                    "child state '{}' of '{}' is not part of the registered states",
                    child.name(),
                    parent.name()
                )));
            }
            names.push(child.name().to_string());
        }
        nodes[i].1 = names;
    }

    Ok(StateGraph { nodes, index })
}

/// Dotted tree path of every node.
///
/// A node's parent is the first node (in input order) listing it as a
/// child; nodes nobody lists are roots and their path is their name.
pub fn compute_paths(graph: &StateGraph) -> HashMap<String, String> {
    let mut parents: HashMap<&str, &str> = HashMap::new();
    for (descriptor, children) in &graph.nodes {
        for child in children {
            parents.entry(child.as_str()).or_insert(descriptor.name());
        }
    }

    let mut paths = HashMap::new();
    for name in graph.names() {
        let mut segments = vec![name];
        let mut seen: HashSet<&str> = HashSet::from([name]);
        let mut current = name;
        while let Some(&parent) = parents.get(current) {
            if !seen.insert(parent) {
                break;
            }
            segments.push(parent);
            current = parent;
        }
        segments.reverse();
        paths.insert(name.to_string(), segments.join("."));
    }
    paths
}

/// Registration order with every child before its parents.
///
/// Fails with `CircularDependency` when a node is reached again while it is
/// still on the current descent path.
pub fn topo_sort(graph: &StateGraph) -> Result<Vec<String>, StoreError> {
    let mut sorted = Vec::with_capacity(graph.len());
    let mut visited = HashSet::new();
    let mut ancestors = Vec::new();

    for name in graph.names() {
        visit(graph, name, &mut ancestors, &mut visited, &mut sorted)?;
    }
    Ok(sorted)
}

fn visit<'g>(
    graph: &'g StateGraph,
    name: &'g str,
    ancestors: &mut Vec<&'g str>,
    visited: &mut HashSet<&'g str>,
    sorted: &mut Vec<String>,
) -> Result<(), StoreError> {
    if visited.contains(name) {
        return Ok(());
    }
    ancestors.push(name);
    for child in graph.children(name) {
        if ancestors.contains(&child.as_str()) {
            let mut chain: Vec<String> = ancestors.iter().map(|s| s.to_string()).collect();
            chain.push(child.clone());
            return Err(StoreError::CircularDependency {
                dependency: child.clone(),
                dependent: name.to_string(),
                chain,
            });
        }
        visit(graph, child, ancestors, visited, sorted)?;
    }
    ancestors.pop();
    visited.insert(name);
    sorted.push(name.to_string());
    Ok(())
}
