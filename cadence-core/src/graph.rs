//! Asset graph
//!
//! Assets are registered into an [`AssetGraphBuilder`], which rejects
//! duplicate keys and dependency cycles as soon as they are introduced.
//! `build()` then resolves every edge's partition mapping and freezes the
//! result into an immutable [`AssetGraph`] with a precomputed deterministic
//! topological order. A running engine holds the graph through
//! [`SharedAssetGraph`], which swaps whole graphs atomically on redeploy.

use crate::asset::{AssetDefinition, AssetKey};
use crate::partition_mapping::{infer_mapping, PartitionMapping};
use crate::ConfigurationError;
use parking_lot::RwLock;
use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Mutable registration phase of an asset graph
///
/// Upstreams may be registered after the assets that depend on them; such
/// edges are held as pending until the upstream arrives, and `build()`
/// fails if any are still pending.
#[derive(Default)]
pub struct AssetGraphBuilder {
    graph: DiGraph<AssetKey, ()>,
    index: HashMap<AssetKey, NodeIndex>,
    definitions: HashMap<AssetKey, AssetDefinition>,
    /// upstream key -> downstream keys waiting for it
    pending: HashMap<AssetKey, Vec<AssetKey>>,
}

impl AssetGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition
    ///
    /// Fails with `DuplicateKey` on a key collision and `Cycle` if the
    /// definition's edges close a cycle. The builder is unchanged on failure.
    pub fn register(&mut self, definition: AssetDefinition) -> Result<(), ConfigurationError> {
        let key = definition.key.clone();
        if self.index.contains_key(&key) {
            return Err(ConfigurationError::DuplicateKey(key));
        }

        let node = self.graph.add_node(key.clone());
        for upstream in definition.upstream_keys() {
            if let Some(&up) = self.index.get(upstream) {
                self.graph.add_edge(up, node, ());
            }
        }
        for waiting in self.pending.get(&key).into_iter().flatten() {
            if let Some(&down) = self.index.get(waiting) {
                self.graph.add_edge(node, down, ());
            }
        }

        if is_cyclic_directed(&self.graph) {
            let path = self.cycle_through(node);
            // The new node has the highest index, so removing it leaves
            // every other index untouched.
            self.graph.remove_node(node);
            return Err(ConfigurationError::Cycle { path });
        }

        self.pending.remove(&key);
        for upstream in definition.upstream_keys() {
            if !self.index.contains_key(upstream) {
                self.pending
                    .entry(upstream.clone())
                    .or_default()
                    .push(key.clone());
            }
        }
        self.index.insert(key.clone(), node);
        self.definitions.insert(key, definition);
        Ok(())
    }

    /// Keys of the strongly connected component containing `node`, in
    /// dependency order starting and ending at the new asset
    fn cycle_through(&self, node: NodeIndex) -> Vec<AssetKey> {
        let component = tarjan_scc(&self.graph)
            .into_iter()
            .find(|scc| scc.contains(&node))
            .unwrap_or_else(|| vec![node]);

        // Walk forward from the new node inside the component.
        let members: BTreeSet<NodeIndex> = component.into_iter().collect();
        let mut path = vec![self.graph[node].clone()];
        let mut current = node;
        let mut visited = BTreeSet::from([node]);
        loop {
            let mut next: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(current, Direction::Outgoing)
                .filter(|n| members.contains(n))
                .collect();
            next.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

            if next.contains(&node) {
                path.push(self.graph[node].clone());
                return path;
            }
            match next.into_iter().find(|n| !visited.contains(n)) {
                Some(n) => {
                    visited.insert(n);
                    path.push(self.graph[n].clone());
                    current = n;
                }
                None => {
                    path.push(self.graph[node].clone());
                    return path;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Resolve partition mappings and freeze the graph
    pub fn build(self) -> Result<AssetGraph, ConfigurationError> {
        if let Some((upstream, waiting)) = self
            .pending
            .iter()
            .min_by(|a, b| a.0.cmp(b.0))
        {
            let mut waiting = waiting.clone();
            waiting.sort();
            return Err(ConfigurationError::UnknownDependency {
                asset: waiting[0].clone(),
                upstream: upstream.clone(),
            });
        }

        let mut graph: DiGraph<AssetKey, PartitionMapping> = DiGraph::new();
        let mut index = HashMap::new();

        let mut sorted: Vec<&AssetDefinition> = self.definitions.values().collect();
        sorted.sort_by(|a, b| a.key.cmp(&b.key));
        for definition in &sorted {
            index.insert(definition.key.clone(), graph.add_node(definition.key.clone()));
        }

        for definition in sorted {
            let down_idx = index[&definition.key];
            for dependency in &definition.dependencies {
                let upstream = &self.definitions[&dependency.upstream];
                let up_def = upstream.partitions.as_ref();
                let down_def = definition.partitions.as_ref();

                let mapping = match &dependency.mapping {
                    Some(explicit) => {
                        explicit.validate(up_def, down_def).map_err(|reason| {
                            ConfigurationError::IncompatiblePartitionMapping {
                                upstream: upstream.key.clone(),
                                downstream: definition.key.clone(),
                                reason,
                            }
                        })?;
                        explicit.clone()
                    }
                    None => infer_mapping(up_def, down_def).ok_or_else(|| {
                        ConfigurationError::MissingPartitionMapping {
                            upstream: upstream.key.clone(),
                            downstream: definition.key.clone(),
                        }
                    })?,
                };

                graph.add_edge(index[&upstream.key], down_idx, mapping);
            }
        }

        let order = kahn_order(&graph);
        let position = order
            .iter()
            .enumerate()
            .map(|(i, key)| (key.clone(), i))
            .collect();

        debug!(
            assets = graph.node_count(),
            edges = graph.edge_count(),
            "Asset graph built"
        );

        Ok(AssetGraph {
            graph,
            index,
            definitions: self.definitions,
            order,
            position,
        })
    }
}

/// Kahn's algorithm with ties broken by smallest asset key
fn kahn_order(graph: &DiGraph<AssetKey, PartitionMapping>) -> Vec<AssetKey> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();

    let mut ready: BinaryHeap<Reverse<(AssetKey, NodeIndex)>> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(&n, _)| Reverse((graph[n].clone(), n)))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse((key, node))) = ready.pop() {
        order.push(key);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(deg) = in_degree.get_mut(&next) {
                *deg -= 1;
                if *deg == 0 {
                    ready.push(Reverse((graph[next].clone(), next)));
                }
            }
        }
    }
    order
}

/// Immutable, validated asset graph
#[derive(Debug)]
pub struct AssetGraph {
    graph: DiGraph<AssetKey, PartitionMapping>,
    index: HashMap<AssetKey, NodeIndex>,
    definitions: HashMap<AssetKey, AssetDefinition>,
    order: Vec<AssetKey>,
    position: HashMap<AssetKey, usize>,
}

impl AssetGraph {
    /// Build a graph from definitions in one step
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = AssetDefinition>,
    ) -> Result<Self, ConfigurationError> {
        let mut builder = AssetGraphBuilder::new();
        for definition in definitions {
            builder.register(definition)?;
        }
        builder.build()
    }

    pub fn get(&self, key: &AssetKey) -> Option<&AssetDefinition> {
        self.definitions.get(key)
    }

    pub fn contains(&self, key: &AssetKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// All asset keys in topological order
    pub fn keys(&self) -> &[AssetKey] {
        &self.order
    }

    /// Direct upstream assets, in declaration order
    pub fn dependencies_of(&self, key: &AssetKey) -> Vec<&AssetKey> {
        self.definitions
            .get(key)
            .map(|d| d.upstream_keys().collect())
            .unwrap_or_default()
    }

    /// Direct downstream assets, ordered by key
    pub fn dependents_of(&self, key: &AssetKey) -> Vec<&AssetKey> {
        let Some(&node) = self.index.get(key) else {
            return Vec::new();
        };
        let mut dependents: Vec<&AssetKey> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .map(|n| &self.graph[n])
            .collect();
        dependents.sort();
        dependents
    }

    /// Resolved partition mapping of the edge `upstream -> downstream`
    pub fn mapping(&self, upstream: &AssetKey, downstream: &AssetKey) -> Option<&PartitionMapping> {
        let up = self.index.get(upstream)?;
        let down = self.index.get(downstream)?;
        self.graph
            .find_edge(*up, *down)
            .map(|edge| &self.graph[edge])
    }

    /// Position of an asset in the topological order
    pub fn topological_index(&self, key: &AssetKey) -> Option<usize> {
        self.position.get(key).copied()
    }

    /// Deterministic topological order of a subset of assets
    ///
    /// Keys not in the graph are dropped. Ties are broken by asset key.
    pub fn topological_order<'a, I>(&self, subset: I) -> Vec<AssetKey>
    where
        I: IntoIterator<Item = &'a AssetKey>,
    {
        let mut positions: Vec<usize> = subset
            .into_iter()
            .filter_map(|k| self.position.get(k).copied())
            .collect();
        positions.sort_unstable();
        positions.dedup();
        positions.into_iter().map(|i| self.order[i].clone()).collect()
    }

    /// The given assets and everything downstream of them
    pub fn downstream_closure<'a, I>(&self, roots: I) -> Vec<AssetKey>
    where
        I: IntoIterator<Item = &'a AssetKey>,
    {
        self.closure(roots, Direction::Outgoing)
    }

    /// The given assets and everything upstream of them
    pub fn upstream_closure<'a, I>(&self, roots: I) -> Vec<AssetKey>
    where
        I: IntoIterator<Item = &'a AssetKey>,
    {
        self.closure(roots, Direction::Incoming)
    }

    fn closure<'a, I>(&self, roots: I, direction: Direction) -> Vec<AssetKey>
    where
        I: IntoIterator<Item = &'a AssetKey>,
    {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeIndex> = roots
            .into_iter()
            .filter_map(|k| self.index.get(k).copied())
            .collect();
        while let Some(node) = queue.pop_front() {
            if seen.insert(node) {
                queue.extend(self.graph.neighbors_directed(node, direction));
            }
        }
        let keys: Vec<&AssetKey> = seen.into_iter().map(|n| &self.graph[n]).collect();
        self.topological_order(keys)
    }
}

/// Asset graph shared by a running engine
///
/// Readers take a snapshot and keep using it for a whole evaluation pass;
/// `replace` swaps in a new graph without readers ever seeing a partial one.
#[derive(Debug, Clone)]
pub struct SharedAssetGraph {
    inner: Arc<RwLock<Arc<AssetGraph>>>,
}

impl SharedAssetGraph {
    pub fn new(graph: AssetGraph) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(graph))),
        }
    }

    /// Current graph
    pub fn snapshot(&self) -> Arc<AssetGraph> {
        Arc::clone(&self.inner.read())
    }

    /// Replace the graph, returning the previous one
    pub fn replace(&self, graph: AssetGraph) -> Arc<AssetGraph> {
        std::mem::replace(&mut *self.inner.write(), Arc::new(graph))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{PartitionsDefinition, TimeWindowPartitions};

    fn asset(key: &str, deps: &[&str]) -> AssetDefinition {
        deps.iter()
            .fold(AssetDefinition::builder(key), |b, d| b.depends_on(*d))
            .build()
            .unwrap()
    }

    fn daily() -> PartitionsDefinition {
        PartitionsDefinition::Time(TimeWindowPartitions::daily("2024-01-01", None).unwrap())
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let graph = AssetGraph::from_definitions([
            asset("report", &["clean_orders", "clean_users"]),
            asset("clean_users", &["raw_users"]),
            asset("raw_users", &[]),
            asset("clean_orders", &["raw_orders"]),
            asset("raw_orders", &[]),
        ])
        .unwrap();

        let order = graph.keys();
        let pos = |k: &str| order.iter().position(|x| x.as_str() == k).unwrap();
        assert!(pos("raw_orders") < pos("clean_orders"));
        assert!(pos("raw_users") < pos("clean_users"));
        assert!(pos("clean_orders") < pos("report"));
        assert!(pos("clean_users") < pos("report"));
        // Ties broken by key.
        assert_eq!(order[0].as_str(), "raw_orders");
        assert_eq!(order[1].as_str(), "clean_orders");
    }

    #[test]
    fn test_topological_order_is_deterministic() {
        let defs = || {
            vec![
                asset("c", &["a"]),
                asset("b", &["a"]),
                asset("a", &[]),
                asset("d", &["b", "c"]),
            ]
        };
        let first = AssetGraph::from_definitions(defs()).unwrap();
        let mut reversed = defs();
        reversed.reverse();
        let second = AssetGraph::from_definitions(reversed).unwrap();

        assert_eq!(first.keys(), second.keys());
        let subset = [AssetKey::new("d"), AssetKey::new("a"), AssetKey::new("c")];
        assert_eq!(
            first.topological_order(subset.iter()),
            vec![AssetKey::new("a"), AssetKey::new("c"), AssetKey::new("d")]
        );
        assert_eq!(
            first.topological_order(subset.iter()),
            first.topological_order(subset.iter())
        );
    }

    #[test]
    fn test_cycle_rejected_and_builder_unchanged() {
        let mut builder = AssetGraphBuilder::new();
        builder.register(asset("a", &["c"])).unwrap();
        builder.register(asset("b", &["a"])).unwrap();

        let err = builder.register(asset("c", &["b"])).unwrap_err();
        match err {
            ConfigurationError::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }

        // c was not added; it can be registered without the cycle.
        assert_eq!(builder.len(), 2);
        builder.register(asset("c", &[])).unwrap();
        let graph = builder.build().unwrap();
        assert_eq!(graph.keys().len(), 3);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut builder = AssetGraphBuilder::new();
        builder.register(asset("a", &[])).unwrap();
        assert!(matches!(
            builder.register(asset("a", &[])),
            Err(ConfigurationError::DuplicateKey(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_fails_build() {
        let mut builder = AssetGraphBuilder::new();
        builder.register(asset("b", &["a"])).unwrap();
        assert!(matches!(
            builder.build(),
            Err(ConfigurationError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_neighbors() {
        let graph = AssetGraph::from_definitions([
            asset("a", &[]),
            asset("c", &["a"]),
            asset("b", &["a"]),
        ])
        .unwrap();

        assert_eq!(
            graph.dependents_of(&AssetKey::new("a")),
            vec![&AssetKey::new("b"), &AssetKey::new("c")]
        );
        assert_eq!(
            graph.dependencies_of(&AssetKey::new("c")),
            vec![&AssetKey::new("a")]
        );
        assert_eq!(
            graph.mapping(&AssetKey::new("a"), &AssetKey::new("b")),
            Some(&PartitionMapping::AllPartitions)
        );
    }

    #[test]
    fn test_missing_partition_mapping_fails_build() {
        let raw = AssetDefinition::builder("raw")
            .partitions(daily())
            .build()
            .unwrap();
        let by_region = AssetDefinition::builder("by_region")
            .partitions(PartitionsDefinition::static_keys(["us", "eu"]))
            .depends_on("raw")
            .build()
            .unwrap();

        assert!(matches!(
            AssetGraph::from_definitions([raw, by_region]),
            Err(ConfigurationError::MissingPartitionMapping { .. })
        ));
    }

    #[test]
    fn test_identity_inferred_for_matching_partitions() {
        let raw = AssetDefinition::builder("raw")
            .partitions(daily())
            .build()
            .unwrap();
        let clean = AssetDefinition::builder("clean")
            .partitions(daily())
            .depends_on("raw")
            .build()
            .unwrap();

        let graph = AssetGraph::from_definitions([raw, clean]).unwrap();
        assert_eq!(
            graph.mapping(&AssetKey::new("raw"), &AssetKey::new("clean")),
            Some(&PartitionMapping::Identity)
        );
    }

    #[test]
    fn test_closures() {
        let graph = AssetGraph::from_definitions([
            asset("a", &[]),
            asset("b", &["a"]),
            asset("c", &["b"]),
            asset("x", &[]),
        ])
        .unwrap();

        assert_eq!(
            graph.downstream_closure([AssetKey::new("b")].iter()),
            vec![AssetKey::new("b"), AssetKey::new("c")]
        );
        assert_eq!(
            graph.upstream_closure([AssetKey::new("b")].iter()),
            vec![AssetKey::new("a"), AssetKey::new("b")]
        );
    }

    #[test]
    fn test_shared_graph_replace() {
        let shared = SharedAssetGraph::new(AssetGraph::from_definitions([asset("a", &[])]).unwrap());
        let before = shared.snapshot();
        shared.replace(AssetGraph::from_definitions([asset("a", &[]), asset("b", &["a"])]).unwrap());

        assert_eq!(before.len(), 1);
        assert_eq!(shared.snapshot().len(), 2);
    }
}
