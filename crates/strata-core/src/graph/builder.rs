//! Dependency Graph Builder
//!
//! Assembles descriptors into a [`DependencyGraph`]. Pure function of the
//! descriptor set: every reference must resolve to a declared producer and
//! the edge set must be acyclic.

use super::{DependencyGraph, EdgeOrigin};
use crate::descriptor::ResourceDescriptor;
use crate::error::ConfigurationError;
use crate::types::NodeKey;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{btree_map, BTreeMap, BTreeSet, HashMap};

/// Build a graph from a descriptor set
pub fn build(
    descriptors: impl IntoIterator<Item = ResourceDescriptor>,
) -> Result<DependencyGraph, ConfigurationError> {
    let mut builder = GraphBuilder::new();
    for descriptor in descriptors {
        builder.add(descriptor)?;
    }
    builder.build()
}

#[derive(Debug, Default)]
pub struct GraphBuilder {
    descriptors: Vec<ResourceDescriptor>,
    seen: HashMap<NodeKey, usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.descriptors.len()
    }

    pub fn add(&mut self, descriptor: ResourceDescriptor) -> Result<&mut Self, ConfigurationError> {
        if self.seen.contains_key(&descriptor.key) {
            return Err(ConfigurationError::DuplicateNode(descriptor.key));
        }
        descriptor.validate()?;
        self.seen
            .insert(descriptor.key.clone(), self.descriptors.len());
        self.descriptors.push(descriptor);
        Ok(self)
    }

    pub fn build(self) -> Result<DependencyGraph, ConfigurationError> {
        let adjacency = self.resolve_edges()?;
        self.check_acyclic(&adjacency)?;

        let mut inner = DiGraph::with_capacity(self.descriptors.len(), adjacency.len());
        let mut index = HashMap::with_capacity(self.descriptors.len());
        for descriptor in &self.descriptors {
            let idx = inner.add_node(descriptor.key.clone());
            index.insert(descriptor.key.clone(), idx);
        }
        for (from, targets) in adjacency.iter().enumerate() {
            for (to, origin) in targets {
                inner.add_edge(NodeIndex::new(from), NodeIndex::new(*to), *origin);
            }
        }

        let order = topological(&adjacency, self.descriptors.len());
        let position = order
            .iter()
            .enumerate()
            .map(|(pos, idx)| (*idx, pos))
            .collect();

        tracing::debug!(
            nodes = inner.node_count(),
            edges = inner.edge_count(),
            "dependency graph built"
        );

        Ok(DependencyGraph {
            inner,
            index,
            descriptors: self.descriptors,
            order,
            position,
        })
    }

    /// Per node (by declaration index): dependency index -> edge origin
    fn resolve_edges(&self) -> Result<Vec<BTreeMap<usize, EdgeOrigin>>, ConfigurationError> {
        let mut adjacency = vec![BTreeMap::new(); self.descriptors.len()];
        for (from, descriptor) in self.descriptors.iter().enumerate() {
            for dep in &descriptor.depends_on {
                let to = self.lookup(&descriptor.key, dep, || dep.to_string())?;
                adjacency[from].entry(to).or_insert(EdgeOrigin::Explicit);
            }
            for reference in descriptor.references() {
                let to = self.lookup(&descriptor.key, &reference.node, || reference.to_string())?;
                adjacency[from].insert(to, EdgeOrigin::Data);
            }
        }
        Ok(adjacency)
    }

    fn lookup(
        &self,
        from: &NodeKey,
        target: &NodeKey,
        render: impl FnOnce() -> String,
    ) -> Result<usize, ConfigurationError> {
        self.seen
            .get(target)
            .copied()
            .ok_or_else(|| ConfigurationError::UnresolvedReference {
                from: from.clone(),
                reference: render(),
            })
    }

    /// Three-color depth-first search; a back edge to an in-progress node
    /// reports the cycle path, first node repeated at the end. The search
    /// keeps its own stack, so chain depth is bounded by memory only.
    fn check_acyclic(&self, adjacency: &[BTreeMap<usize, EdgeOrigin>]) -> Result<(), ConfigurationError> {
        let mut marks = vec![Mark::Unvisited; self.descriptors.len()];
        // Current path from the root, each frame with its unexplored successors.
        let mut path: Vec<(usize, btree_map::Keys<'_, usize, EdgeOrigin>)> = Vec::new();

        for root in 0..self.descriptors.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            marks[root] = Mark::InProgress;
            path.push((root, adjacency[root].keys()));

            while let Some((node, successors)) = path.last_mut() {
                let node = *node;
                match successors.next().copied() {
                    Some(next) => match marks[next] {
                        Mark::InProgress => return Err(self.cycle(&path, next)),
                        Mark::Unvisited => {
                            marks[next] = Mark::InProgress;
                            path.push((next, adjacency[next].keys()));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[node] = Mark::Done;
                        path.pop();
                    }
                }
            }
        }
        Ok(())
    }

    fn cycle(
        &self,
        path: &[(usize, btree_map::Keys<'_, usize, EdgeOrigin>)],
        back_to: usize,
    ) -> ConfigurationError {
        let start = path.iter().position(|(n, _)| *n == back_to).unwrap_or(0);
        let mut keys: Vec<NodeKey> = path[start..]
            .iter()
            .map(|(n, _)| self.descriptors[*n].key.clone())
            .collect();
        keys.push(self.descriptors[back_to].key.clone());
        ConfigurationError::Cycle { path: keys }
    }
}

/// Kahn's algorithm over the acyclic adjacency; the lowest declaration index
/// among ready nodes goes first so the order is deterministic.
fn topological(adjacency: &[BTreeMap<usize, EdgeOrigin>], len: usize) -> Vec<NodeIndex> {
    let mut remaining: Vec<usize> = adjacency.iter().map(BTreeMap::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); len];
    for (from, targets) in adjacency.iter().enumerate() {
        for to in targets.keys() {
            dependents[*to].push(from);
        }
    }

    let mut ready: BTreeSet<usize> = (0..len).filter(|n| remaining[*n] == 0).collect();
    let mut order = Vec::with_capacity(len);
    while let Some(node) = ready.pop_first() {
        order.push(NodeIndex::new(node));
        for &dependent in &dependents[node] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceKind;
    use serde_json::json;

    fn manifest(name: &str) -> crate::descriptor::DescriptorBuilder {
        ResourceDescriptor::builder(ResourceKind::GenericManifest, name)
            .input("manifest", json!({ "kind": "ConfigMap", "name": name }))
    }

    fn key(name: &str) -> NodeKey {
        NodeKey::new(ResourceKind::GenericManifest, name)
    }

    #[test]
    fn orders_dependencies_first() {
        let graph = build([
            manifest("gateway").depends_on(key("cluster")).build().unwrap(),
            manifest("cluster")
                .input_ref("vpc", key("network").output("vpc_id"))
                .build()
                .unwrap(),
            manifest("network").build().unwrap(),
        ])
        .unwrap();

        assert_eq!(
            graph.topological_order(),
            vec![key("network"), key("cluster"), key("gateway")]
        );
        assert_eq!(graph.position(&key("gateway")), Some(2));
    }

    #[test]
    fn independent_nodes_keep_declaration_order() {
        let graph = build([
            manifest("c").build().unwrap(),
            manifest("a").build().unwrap(),
            manifest("b").build().unwrap(),
        ])
        .unwrap();
        assert_eq!(graph.topological_order(), vec![key("c"), key("a"), key("b")]);
    }

    #[test]
    fn unresolved_reference_names_the_reference() {
        let err = build([manifest("cluster")
            .input_ref("vpc", key("network").output("vpc_id"))
            .build()
            .unwrap()])
        .unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::UnresolvedReference {
                from: key("cluster"),
                reference: "generic-manifest/network.vpc_id".into(),
            }
        );
    }

    #[test]
    fn unresolved_explicit_dependency() {
        let err = build([manifest("a").depends_on(key("ghost")).build().unwrap()]).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::UnresolvedReference { ref reference, .. } if reference == "generic-manifest/ghost"
        ));
    }

    #[test]
    fn cycle_reports_full_path() {
        let err = build([
            manifest("a").depends_on(key("b")).build().unwrap(),
            manifest("b").depends_on(key("c")).build().unwrap(),
            manifest("c")
                .input_ref("x", key("a").output("id"))
                .build()
                .unwrap(),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::Cycle {
                path: vec![key("a"), key("b"), key("c"), key("a")]
            }
        );
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let err = build([manifest("a").depends_on(key("a")).build().unwrap()]).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::Cycle {
                path: vec![key("a"), key("a")]
            }
        );
    }

    fn deep_chain(len: usize, closed: bool) -> Vec<ResourceDescriptor> {
        // Node i depends on node i + 1, so the search from the first root
        // walks the whole chain.
        (0..len)
            .map(|i| {
                let next = match i + 1 {
                    n if n < len => Some(n),
                    _ if closed => Some(0),
                    _ => None,
                };
                let builder = manifest(&format!("n{i}"));
                let builder = match next {
                    Some(n) => builder.depends_on(key(&format!("n{n}"))),
                    None => builder,
                };
                builder.build().unwrap()
            })
            .collect()
    }

    #[test]
    fn very_deep_chain_is_accepted() {
        let graph = build(deep_chain(50_000, false)).unwrap();
        let order = graph.topological_order();
        assert_eq!(order.first(), Some(&key("n49999")));
        assert_eq!(order.last(), Some(&key("n0")));
    }

    #[test]
    fn very_deep_cycle_reports_the_full_path() {
        let err = build(deep_chain(50_000, true)).unwrap_err();
        match err {
            ConfigurationError::Cycle { path } => {
                assert_eq!(path.len(), 50_001);
                assert_eq!(path.first(), Some(&key("n0")));
                assert_eq!(path.last(), Some(&key("n0")));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_nodes_rejected() {
        let err = build([manifest("a").build().unwrap(), manifest("a").build().unwrap()])
            .unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateNode(key("a")));
    }
}
