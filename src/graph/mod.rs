//! Dependency graph and startup ordering.
//!
//! Builds a DAG from declared component dependencies and computes a
//! deterministic startup order (dependencies first). Shutdown order is the
//! exact reverse. Cycles are detected before any side effect occurs: a
//! failed `order()` returns no partial sequence and mutates nothing.

use std::collections::HashMap;

use crate::types::{Error, Result};

/// Three-color DFS marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Directed dependency graph over component names.
///
/// Node identity is the registration index, which makes ordering
/// deterministic: ties are broken by registration order, never by map
/// iteration order.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Node names in registration order.
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    /// `edges[i]` holds the registration indices node `i` depends on.
    edges: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Registration order is significant for tie-breaking.
    pub fn add_node(&mut self, name: &str) -> Result<()> {
        if self.index.contains_key(name) {
            return Err(Error::validation(format!("duplicate node: {name}")));
        }
        self.index.insert(name.to_string(), self.nodes.len());
        self.nodes.push(name.to_string());
        self.edges.push(Vec::new());
        Ok(())
    }

    /// Record "`from` depends on `to`". Both nodes must already exist.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        let from_idx = self.resolve(from)?;
        let to_idx = self.resolve(to)?;
        if from_idx == to_idx {
            return Err(Error::dependency_cycle(vec![
                from.to_string(),
                to.to_string(),
            ]));
        }
        if !self.edges[from_idx].contains(&to_idx) {
            self.edges[from_idx].push(to_idx);
        }
        Ok(())
    }

    /// Compute a startup order where every dependency precedes its
    /// dependent, or fail with [`Error::DependencyCycle`] naming the cycle
    /// members. For a fixed registration order and edge set the result is
    /// identical on every call.
    pub fn order(&self) -> Result<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut path: Vec<usize> = Vec::new();
        let mut out: Vec<usize> = Vec::with_capacity(self.nodes.len());

        for i in 0..self.nodes.len() {
            if marks[i] == Mark::Unvisited {
                self.visit(i, &mut marks, &mut path, &mut out)?;
            }
        }

        Ok(out.into_iter().map(|i| self.nodes[i].clone()).collect())
    }

    /// Shutdown order: the exact reverse of [`order`](Self::order).
    pub fn shutdown_order(&self) -> Result<Vec<String>> {
        let mut order = self.order()?;
        order.reverse();
        Ok(order)
    }

    /// Verify acyclicity without materializing an order.
    pub fn verify(&self) -> Result<()> {
        self.order().map(|_| ())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn resolve(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::not_found(format!("unknown node: {name}")))
    }

    fn visit(
        &self,
        node: usize,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
        out: &mut Vec<usize>,
    ) -> Result<()> {
        marks[node] = Mark::InProgress;
        path.push(node);

        // Visit dependencies in registration order for determinism.
        let mut deps = self.edges[node].clone();
        deps.sort_unstable();

        for dep in deps {
            match marks[dep] {
                Mark::Done => {}
                Mark::InProgress => {
                    // An in-progress node closes a cycle. Abort immediately;
                    // the caller receives no partial order.
                    let start = path.iter().position(|&p| p == dep).unwrap_or(0);
                    let mut members: Vec<String> =
                        path[start..].iter().map(|&p| self.nodes[p].clone()).collect();
                    members.push(self.nodes[dep].clone());
                    return Err(Error::dependency_cycle(members));
                }
                Mark::Unvisited => self.visit(dep, marks, path, out)?,
            }
        }

        path.pop();
        marks[node] = Mark::Done;
        out.push(node);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn graph_of(nodes: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for n in nodes {
            g.add_node(n).unwrap();
        }
        for (from, to) in edges {
            g.add_edge(from, to).unwrap();
        }
        g
    }

    #[test]
    fn test_chain_order() {
        // B depends on A, C depends on B
        let g = graph_of(&["a", "b", "c"], &[("b", "a"), ("c", "b")]);
        assert_eq!(g.order().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(g.shutdown_order().unwrap(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_no_edges_keeps_registration_order() {
        let g = graph_of(&["c", "b", "a"], &[]);
        assert_eq!(g.order().unwrap(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_two_node_cycle() {
        let g = graph_of(&["a", "b"], &[("a", "b"), ("b", "a")]);
        let err = g.order().unwrap_err();
        match err {
            Error::DependencyCycle { members } => {
                assert!(members.contains(&"a".to_string()));
                assert!(members.contains(&"b".to_string()));
            }
            other => panic!("expected DependencyCycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_edge_rejected() {
        let mut g = DependencyGraph::new();
        g.add_node("a").unwrap();
        assert!(matches!(
            g.add_edge("a", "a"),
            Err(Error::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_three_node_cycle_names_members() {
        let g = graph_of(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]);
        let err = g.order().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains('a') && msg.contains('b') && msg.contains('c'));
    }

    #[test]
    fn test_diamond() {
        // d depends on b and c, both depend on a
        let g = graph_of(
            &["a", "b", "c", "d"],
            &[("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")],
        );
        let order = g.order().unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut g = DependencyGraph::new();
        g.add_node("a").unwrap();
        assert!(g.add_node("a").is_err());
    }

    #[test]
    fn test_unknown_edge_endpoint() {
        let mut g = DependencyGraph::new();
        g.add_node("a").unwrap();
        assert!(g.add_edge("a", "ghost").is_err());
        assert!(g.add_edge("ghost", "a").is_err());
    }

    #[test]
    fn test_order_is_repeatable() {
        let g = graph_of(
            &["e", "d", "c", "b", "a"],
            &[("a", "b"), ("c", "d"), ("b", "e")],
        );
        let first = g.order().unwrap();
        for _ in 0..10 {
            assert_eq!(g.order().unwrap(), first);
        }
    }

    proptest! {
        /// For arbitrary acyclic graphs (edges only point to
        /// earlier-registered nodes), every dependency index is less than
        /// its dependent's index and shutdown is the exact reverse.
        #[test]
        fn prop_order_respects_dependencies(
            n in 1usize..12,
            raw_edges in proptest::collection::vec((0usize..12, 0usize..12), 0..30),
        ) {
            let names: Vec<String> = (0..n).map(|i| format!("c{i}")).collect();
            let mut g = DependencyGraph::new();
            for name in &names {
                g.add_node(name).unwrap();
            }
            let mut edges = Vec::new();
            for (a, b) in raw_edges {
                let (from, to) = (a % n, b % n);
                // Dependent always registered after dependency: acyclic.
                if to < from {
                    g.add_edge(&names[from], &names[to]).unwrap();
                    edges.push((from, to));
                }
            }

            let order = g.order().unwrap();
            let pos: std::collections::HashMap<&str, usize> = order
                .iter()
                .enumerate()
                .map(|(i, name)| (name.as_str(), i))
                .collect();
            for (from, to) in edges {
                prop_assert!(pos[names[to].as_str()] < pos[names[from].as_str()]);
            }

            let mut reversed = order.clone();
            reversed.reverse();
            prop_assert_eq!(g.shutdown_order().unwrap(), reversed);
        }
    }
}
