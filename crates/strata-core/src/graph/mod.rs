//! Dependency graph
//!
//! Edges point from a dependent to its dependency: `A -> B` means B must be
//! settled before A runs. The graph is immutable once built and safe to share
//! across concurrent traversals.

mod builder;

pub use builder::{build, GraphBuilder};

use crate::descriptor::ResourceDescriptor;
use crate::types::NodeKey;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef, Reversed};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeOrigin {
    /// Declared ordering hint
    Explicit,
    /// The dependent consumes one of the dependency's outputs
    Data,
}

#[derive(Debug)]
pub struct DependencyGraph {
    inner: DiGraph<NodeKey, EdgeOrigin>,
    index: HashMap<NodeKey, NodeIndex>,
    descriptors: Vec<ResourceDescriptor>,
    /// Dependencies first; declaration order breaks ties
    order: Vec<NodeIndex>,
    position: HashMap<NodeIndex, usize>,
}

impl DependencyGraph {
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn descriptor(&self, key: &NodeKey) -> Option<&ResourceDescriptor> {
        self.index
            .get(key)
            .map(|idx| &self.descriptors[idx.index()])
    }

    /// Node keys, dependencies before dependents
    pub fn topological_order(&self) -> Vec<NodeKey> {
        self.order.iter().map(|idx| self.inner[*idx].clone()).collect()
    }

    /// Position of `key` in [`Self::topological_order`]
    pub fn position(&self, key: &NodeKey) -> Option<usize> {
        self.index
            .get(key)
            .and_then(|idx| self.position.get(idx))
            .copied()
    }

    /// Direct dependencies of `key` with the origin of each edge
    pub fn dependencies(&self, key: &NodeKey) -> Vec<(NodeKey, EdgeOrigin)> {
        self.neighbors(key, Direction::Outgoing)
    }

    /// Nodes that directly depend on `key`
    pub fn dependents(&self, key: &NodeKey) -> Vec<(NodeKey, EdgeOrigin)> {
        self.neighbors(key, Direction::Incoming)
    }

    /// Every node reachable from `key` through dependent edges, excluding `key`
    pub fn descendants(&self, key: &NodeKey) -> BTreeSet<NodeKey> {
        let Some(&start) = self.index.get(key) else {
            return BTreeSet::new();
        };
        let reversed = Reversed(&self.inner);
        let mut dfs = Dfs::new(reversed, start);
        let mut found = BTreeSet::new();
        while let Some(idx) = dfs.next(reversed) {
            if idx != start {
                found.insert(self.inner[idx].clone());
            }
        }
        found
    }

    /// All edges as `(dependent, dependency, origin)`
    pub fn edges(&self) -> Vec<(NodeKey, NodeKey, EdgeOrigin)> {
        self.inner
            .edge_references()
            .map(|e| {
                (
                    self.inner[e.source()].clone(),
                    self.inner[e.target()].clone(),
                    *e.weight(),
                )
            })
            .collect()
    }

    fn neighbors(&self, key: &NodeKey, direction: Direction) -> Vec<(NodeKey, EdgeOrigin)> {
        let Some(&idx) = self.index.get(key) else {
            return Vec::new();
        };
        let mut found: Vec<(usize, NodeKey, EdgeOrigin)> = self
            .inner
            .edges_directed(idx, direction)
            .map(|e| {
                let other = match direction {
                    Direction::Outgoing => e.target(),
                    Direction::Incoming => e.source(),
                };
                (self.position[&other], self.inner[other].clone(), *e.weight())
            })
            .collect();
        found.sort_by_key(|(pos, _, _)| *pos);
        found.into_iter().map(|(_, k, o)| (k, o)).collect()
    }
}
