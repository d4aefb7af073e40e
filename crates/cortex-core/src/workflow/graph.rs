//! Task dependency graph: cycle detection, topological order, and batching.
//!
//! Edge insertion is cheap and unchecked; acyclicity is verified explicitly
//! with [`DependencyGraph::validate_acyclic`] once the graph is built. Batches
//! are computed by level-order Kahn reduction, so every task lands in the
//! earliest batch its dependencies allow.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use cortex_types::workflow::Workflow;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::Serialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while building or validating a dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// The graph contains a cycle through the named node.
    #[error("cycle detected involving task '{0}'")]
    CycleDetected(String),
}

// ---------------------------------------------------------------------------
// GraphInfo
// ---------------------------------------------------------------------------

/// Shape summary of a dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GraphInfo {
    pub total_nodes: usize,
    pub total_edges: usize,
    /// Number of execution batches (0 when the graph is cyclic).
    pub max_depth: usize,
    /// Size of the largest batch.
    pub max_parallelism: usize,
    pub is_acyclic: bool,
}

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// Directed graph over task ids. An edge `from -> to` means `to` depends on `from`.
///
/// `dependencies` and `dependents` are kept as exact inverses of each other,
/// and every id that appears in either map is also in `nodes`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: BTreeSet<String>,
    dependencies: BTreeMap<String, BTreeSet<String>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a workflow's tasks and dependency map.
    ///
    /// Does not check for cycles; call [`validate_acyclic`](Self::validate_acyclic).
    pub fn from_workflow(workflow: &Workflow) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for task in &workflow.tasks {
            graph.add_node(task.id.clone());
        }
        for (task_id, depends_on) in &workflow.dependencies {
            for dep in depends_on {
                graph.add_edge(dep, task_id)?;
            }
        }
        Ok(graph)
    }

    /// Insert a node. Inserting an existing id is a no-op.
    pub fn add_node(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.dependencies.entry(id.clone()).or_default();
        self.dependents.entry(id.clone()).or_default();
        self.nodes.insert(id);
    }

    /// Record that `to` depends on `from`.
    ///
    /// Both endpoints must already exist; otherwise the graph is left
    /// untouched. Self-edges are accepted here and rejected by
    /// [`validate_acyclic`](Self::validate_acyclic).
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        if !self.nodes.contains(from) {
            return Err(GraphError::NodeNotFound(from.to_string()));
        }
        if !self.nodes.contains(to) {
            return Err(GraphError::NodeNotFound(to.to_string()));
        }

        self.dependencies
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());
        self.dependents
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Full cycle check over the current edge set (self-edges included).
    pub fn validate_acyclic(&self) -> Result<(), GraphError> {
        let mut graph = DiGraph::<&str, ()>::new();
        let indices: HashMap<&str, _> = self
            .nodes
            .iter()
            .map(|id| (id.as_str(), graph.add_node(id.as_str())))
            .collect();

        for (to, froms) in &self.dependencies {
            for from in froms {
                if let (Some(&a), Some(&b)) = (indices.get(from.as_str()), indices.get(to.as_str())) {
                    graph.add_edge(a, b, ());
                }
            }
        }

        toposort(&graph, None).map_err(|cycle| {
            GraphError::CycleDetected(graph[cycle.node_id()].to_string())
        })?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Neighbourhood queries
    // -----------------------------------------------------------------------

    /// Direct dependencies of `id`.
    pub fn get_node_dependencies(&self, id: &str) -> Result<Vec<String>, GraphError> {
        self.require(id)?;
        Ok(self
            .dependencies
            .get(id)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Direct dependents of `id`.
    pub fn get_node_dependents(&self, id: &str) -> Result<Vec<String>, GraphError> {
        self.require(id)?;
        Ok(self
            .dependents
            .get(id)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Transitive closure of `id`'s dependencies, sorted by id.
    pub fn get_all_dependencies(&self, id: &str) -> Result<Vec<String>, GraphError> {
        self.require(id)?;

        let mut visited = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(deps) = self.dependencies.get(current) {
                for dep in deps {
                    if visited.insert(dep.as_str()) {
                        stack.push(dep.as_str());
                    }
                }
            }
        }

        Ok(visited.into_iter().map(str::to_string).collect())
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    /// Kahn linearization: every dependency precedes its dependents.
    ///
    /// Ties are broken by id so the order is deterministic.
    pub fn get_topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degree = self.in_degrees();
        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id.to_string());
            for dependent in self.dependents_of(id) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            return Err(self.residual_cycle(&order));
        }
        Ok(order)
    }

    /// Level-order Kahn reduction.
    ///
    /// Batch 0 holds every node without dependencies; batch `k + 1` is the
    /// zero in-degree frontier left after removing batch `k`. Each batch is
    /// sorted by id.
    pub fn get_execution_batches(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let mut in_degree = self.in_degrees();
        let mut frontier: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut batches: Vec<Vec<String>> = Vec::new();
        let mut assigned = 0usize;
        while !frontier.is_empty() {
            frontier.sort_unstable();
            let mut next = Vec::new();
            for id in &frontier {
                for dependent in self.dependents_of(id) {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }
            assigned += frontier.len();
            batches.push(frontier.iter().map(|id| id.to_string()).collect());
            frontier = next;
        }

        if assigned < self.nodes.len() {
            let placed: Vec<String> = batches.into_iter().flatten().collect();
            return Err(self.residual_cycle(&placed));
        }
        Ok(batches)
    }

    /// Nodes outside `completed` whose every dependency is in `completed`.
    pub fn get_ready_nodes(&self, completed: &BTreeSet<String>) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|id| !completed.contains(*id))
            .filter(|id| self.is_ready(id, completed))
            .cloned()
            .collect()
    }

    /// Whether all direct dependencies of `id` are in `completed`.
    pub fn is_ready(&self, id: &str, completed: &BTreeSet<String>) -> bool {
        self.dependencies
            .get(id)
            .is_none_or(|deps| deps.iter().all(|dep| completed.contains(dep)))
    }

    pub fn graph_info(&self) -> GraphInfo {
        let batches = self.get_execution_batches().ok();
        GraphInfo {
            total_nodes: self.nodes.len(),
            total_edges: self.edge_count(),
            max_depth: batches.as_ref().map_or(0, Vec::len),
            max_parallelism: batches
                .as_ref()
                .and_then(|b| b.iter().map(Vec::len).max())
                .unwrap_or(0),
            is_acyclic: batches.is_some(),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn require(&self, id: &str) -> Result<(), GraphError> {
        if self.nodes.contains(id) {
            Ok(())
        } else {
            Err(GraphError::NodeNotFound(id.to_string()))
        }
    }

    fn in_degrees(&self) -> BTreeMap<&str, usize> {
        self.nodes
            .iter()
            .map(|id| {
                let degree = self.dependencies.get(id).map_or(0, BTreeSet::len);
                (id.as_str(), degree)
            })
            .collect()
    }

    fn dependents_of<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.dependents
            .get(id)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    fn residual_cycle(&self, placed: &[String]) -> GraphError {
        let placed: BTreeSet<&str> = placed.iter().map(String::as_str).collect();
        let culprit = self
            .nodes
            .iter()
            .find(|id| !placed.contains(id.as_str()))
            .cloned()
            .unwrap_or_default();
        GraphError::CycleDetected(culprit)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_types::workflow::WorkflowTask;

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for n in nodes {
            g.add_node(*n);
        }
        for (from, to) in edges {
            g.add_edge(from, to).unwrap();
        }
        g
    }

    fn diamond() -> DependencyGraph {
        graph(
            &["A", "B", "C", "D"],
            &[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")],
        )
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    #[test]
    fn test_add_node_is_idempotent() {
        let mut g = DependencyGraph::new();
        g.add_node("A");
        g.add_node("A");
        assert_eq!(g.node_count(), 1);
    }

    #[test]
    fn test_add_edge_unknown_target_leaves_graph_unchanged() {
        let mut g = graph(&["A", "B"], &[("A", "B")]);
        let before = g.clone();

        let err = g.add_edge("A", "missing").unwrap_err();
        assert_eq!(err, GraphError::NodeNotFound("missing".into()));
        let err = g.add_edge("ghost", "B").unwrap_err();
        assert_eq!(err, GraphError::NodeNotFound("ghost".into()));

        assert_eq!(g, before);
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn test_duplicate_edges_are_idempotent() {
        let g = graph(&["A", "B"], &[("A", "B"), ("A", "B")]);
        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.get_node_dependents("A").unwrap(), vec!["B"]);
    }

    #[test]
    fn test_from_workflow_rejects_unknown_dependency() {
        let wf = Workflow::new("wf")
            .with_task(WorkflowTask::new("a"))
            .with_dependency("a", ["nope"]);
        assert_eq!(
            DependencyGraph::from_workflow(&wf).unwrap_err(),
            GraphError::NodeNotFound("nope".into())
        );
    }

    // -----------------------------------------------------------------------
    // Cycle detection
    // -----------------------------------------------------------------------

    #[test]
    fn test_three_node_cycle_detected() {
        let g = graph(&["A", "B", "C"], &[("A", "B"), ("B", "C"), ("C", "A")]);
        assert!(matches!(g.validate_acyclic(), Err(GraphError::CycleDetected(_))));
        assert!(matches!(g.get_topological_order(), Err(GraphError::CycleDetected(_))));
        assert!(matches!(g.get_execution_batches(), Err(GraphError::CycleDetected(_))));
        assert!(!g.graph_info().is_acyclic);
    }

    #[test]
    fn test_self_edge_is_a_cycle() {
        let g = graph(&["A"], &[("A", "A")]);
        assert_eq!(g.validate_acyclic(), Err(GraphError::CycleDetected("A".into())));
    }

    #[test]
    fn test_acyclic_graph_validates() {
        assert!(diamond().validate_acyclic().is_ok());
        assert!(DependencyGraph::new().validate_acyclic().is_ok());
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    #[test]
    fn test_diamond_batches() {
        let batches = diamond().get_execution_batches().unwrap();
        assert_eq!(batches, vec![vec!["A"], vec!["B", "C"], vec!["D"]]);
    }

    #[test]
    fn test_batches_use_longest_path_level() {
        // A -> B -> C and A -> C: C must wait for B even though A alone is a parent.
        let g = graph(&["A", "B", "C", "X"], &[("A", "B"), ("B", "C"), ("A", "C")]);
        let batches = g.get_execution_batches().unwrap();
        assert_eq!(batches, vec![vec!["A", "X"], vec!["B"], vec!["C"]]);
    }

    #[test]
    fn test_topological_order_respects_every_edge() {
        let g = graph(
            &["fetch", "parse", "index", "report", "notify"],
            &[
                ("fetch", "parse"),
                ("parse", "index"),
                ("parse", "report"),
                ("index", "report"),
                ("report", "notify"),
            ],
        );
        let order = g.get_topological_order().unwrap();
        assert_eq!(order.len(), 5);
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        for id in g.nodes() {
            for dep in g.get_node_dependencies(id).unwrap() {
                assert!(pos(&dep) < pos(id), "{dep} must precede {id}");
            }
        }
    }

    #[test]
    fn test_empty_graph_orders_to_nothing() {
        let g = DependencyGraph::new();
        assert!(g.get_topological_order().unwrap().is_empty());
        assert!(g.get_execution_batches().unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    #[test]
    fn test_direct_neighbours() {
        let g = diamond();
        assert_eq!(g.get_node_dependencies("D").unwrap(), vec!["B", "C"]);
        assert_eq!(g.get_node_dependents("A").unwrap(), vec!["B", "C"]);
        assert!(g.get_node_dependencies("A").unwrap().is_empty());
        assert!(matches!(
            g.get_node_dependents("Z"),
            Err(GraphError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_transitive_dependencies() {
        let g = diamond();
        assert_eq!(g.get_all_dependencies("D").unwrap(), vec!["A", "B", "C"]);
        assert!(g.get_all_dependencies("A").unwrap().is_empty());
    }

    #[test]
    fn test_ready_nodes() {
        let g = diamond();
        assert_eq!(g.get_ready_nodes(&set(&[])), vec!["A"]);
        assert_eq!(g.get_ready_nodes(&set(&["A"])), vec!["B", "C"]);
        assert_eq!(g.get_ready_nodes(&set(&["A", "B"])), vec!["C"]);
        assert_eq!(g.get_ready_nodes(&set(&["A", "B", "C"])), vec!["D"]);
        assert!(g.get_ready_nodes(&set(&["A", "B", "C", "D"])).is_empty());
        assert!(!g.is_ready("D", &set(&["A", "B"])));
    }

    #[test]
    fn test_graph_info() {
        let info = diamond().graph_info();
        assert_eq!(
            info,
            GraphInfo {
                total_nodes: 4,
                total_edges: 4,
                max_depth: 3,
                max_parallelism: 2,
                is_acyclic: true,
            }
        );
    }

    #[test]
    fn test_clone_is_independent() {
        let original = diamond();
        let mut copy = original.clone();
        copy.add_node("E");
        copy.add_edge("D", "E").unwrap();
        assert_eq!(original.node_count(), 4);
        assert_eq!(copy.node_count(), 5);
    }

    // -----------------------------------------------------------------------
    // Properties over random DAGs
    // -----------------------------------------------------------------------

    mod properties {
        use std::collections::BTreeMap;

        use proptest::prelude::*;

        use super::*;

        fn node(i: usize) -> String {
            format!("t{i:02}")
        }

        // Acyclic by construction: node i only depends on nodes 0..i.
        fn dag_strategy(max_nodes: usize) -> impl Strategy<Value = Vec<BTreeSet<usize>>> {
            (1..=max_nodes).prop_flat_map(|count| {
                proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..count), count).prop_map(
                    |raw| {
                        raw.into_iter()
                            .enumerate()
                            .map(|(i, picks)| {
                                if i == 0 {
                                    BTreeSet::new()
                                } else {
                                    picks.into_iter().map(|p| p % i).collect()
                                }
                            })
                            .collect()
                    },
                )
            })
        }

        fn build(deps: &[BTreeSet<usize>]) -> DependencyGraph {
            let mut g = DependencyGraph::new();
            for i in 0..deps.len() {
                g.add_node(node(i));
            }
            for (i, ds) in deps.iter().enumerate() {
                for d in ds {
                    g.add_edge(&node(*d), &node(i)).unwrap();
                }
            }
            g
        }

        proptest! {
            #[test]
            fn topological_order_respects_every_edge(deps in dag_strategy(12)) {
                let g = build(&deps);
                prop_assert!(g.validate_acyclic().is_ok());

                let order = g.get_topological_order().unwrap();
                prop_assert_eq!(order.len(), deps.len());
                let position: BTreeMap<&str, usize> =
                    order.iter().enumerate().map(|(p, id)| (id.as_str(), p)).collect();
                for (i, ds) in deps.iter().enumerate() {
                    for d in ds {
                        prop_assert!(position[node(*d).as_str()] < position[node(i).as_str()]);
                    }
                }
            }

            #[test]
            fn batches_partition_nodes_at_earliest_level(deps in dag_strategy(12)) {
                let g = build(&deps);
                let batches = g.get_execution_batches().unwrap();

                let mut level: BTreeMap<String, usize> = BTreeMap::new();
                for (index, batch) in batches.iter().enumerate() {
                    prop_assert!(!batch.is_empty());
                    for id in batch {
                        prop_assert!(level.insert(id.clone(), index).is_none(), "{} placed twice", id);
                    }
                }
                prop_assert_eq!(level.len(), deps.len());

                let roots: Vec<String> = (0..deps.len()).filter(|i| deps[*i].is_empty()).map(node).collect();
                prop_assert_eq!(&batches[0], &roots);

                // Each node sits exactly one level below its deepest dependency.
                for (i, ds) in deps.iter().enumerate() {
                    let expected = ds.iter().map(|d| level[&node(*d)] + 1).max().unwrap_or(0);
                    prop_assert_eq!(level[&node(i)], expected);
                    for d in ds {
                        prop_assert!(level[&node(*d)] < level[&node(i)]);
                    }
                }
            }

            #[test]
            fn ready_nodes_are_exactly_the_unblocked_ones(
                deps in dag_strategy(12),
                mask in proptest::collection::vec(any::<bool>(), 12),
            ) {
                let g = build(&deps);
                let completed: BTreeSet<String> =
                    (0..deps.len()).filter(|i| mask[*i]).map(node).collect();

                let expected: Vec<String> = (0..deps.len())
                    .filter(|i| !mask[*i] && deps[*i].iter().all(|d| mask[*d]))
                    .map(node)
                    .collect();
                prop_assert_eq!(g.get_ready_nodes(&completed), expected);
            }

            #[test]
            fn reversing_any_edge_creates_a_cycle(deps in dag_strategy(12)) {
                let edge = deps
                    .iter()
                    .enumerate()
                    .find_map(|(i, ds)| ds.iter().next().map(|d| (*d, i)));
                let Some((dep, task)) = edge else { return Ok(()) };

                let mut g = build(&deps);
                g.add_edge(&node(task), &node(dep)).unwrap();
                prop_assert!(g.validate_acyclic().is_err());
                prop_assert!(g.get_topological_order().is_err());
                prop_assert!(g.get_execution_batches().is_err());
            }
        }
    }
}
