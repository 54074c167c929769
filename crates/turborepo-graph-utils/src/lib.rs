//! Utilities layered on `petgraph`: cycle validation with the offending
//! path reported, transitive closures for filtering, and a concurrent
//! walker that emits nodes in dependency order.

mod walker;

use std::{collections::HashSet, fmt::Display, hash::Hash};

use itertools::Itertools;
use petgraph::{
    Direction,
    graph::{Graph, NodeIndex},
    visit::{EdgeRef, Reversed, depth_first_search},
};
use thiserror::Error;
pub use walker::{WalkMessage, Walker};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cyclic dependency detected:\n\t{0}")]
    CycleDetected(String),
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

/// Validates that the graph is a DAG using a DFS coloring pass. On failure
/// the error carries the cycle path in traversal order.
pub fn validate_graph<N: Display, E>(graph: &Graph<N, E>) -> Result<(), Error> {
    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge endpoints exist in graph");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }

    // 0 = white, 1 = grey (on the current DFS stack), 2 = black
    let mut color = vec![0u8; graph.node_count()];
    let mut stack: Vec<NodeIndex> = Vec::new();

    for start in graph.node_indices() {
        if color[start.index()] != 0 {
            continue;
        }
        if let Some(cycle) = dfs_find_cycle(graph, start, &mut color, &mut stack) {
            let path = cycle
                .into_iter()
                .map(|ix| {
                    graph
                        .node_weight(ix)
                        .expect("cycle nodes exist in graph")
                        .to_string()
                })
                .join(" -> ");
            return Err(Error::CycleDetected(path));
        }
    }
    Ok(())
}

fn dfs_find_cycle<N, E>(
    graph: &Graph<N, E>,
    start: NodeIndex,
    color: &mut [u8],
    stack: &mut Vec<NodeIndex>,
) -> Option<Vec<NodeIndex>> {
    color[start.index()] = 1;
    stack.push(start);

    for neighbor in graph.neighbors_directed(start, Direction::Outgoing) {
        match color[neighbor.index()] {
            0 => {
                if let Some(cycle) = dfs_find_cycle(graph, neighbor, color, stack) {
                    return Some(cycle);
                }
            }
            1 => {
                // Found a back edge. The cycle is the stack suffix starting
                // at the first occurrence of `neighbor`, closed back on
                // itself.
                let from = stack
                    .iter()
                    .position(|ix| *ix == neighbor)
                    .expect("grey nodes are on the stack");
                let mut cycle: Vec<_> = stack[from..].to_vec();
                cycle.push(neighbor);
                return Some(cycle);
            }
            _ => (),
        }
    }

    stack.pop();
    color[start.index()] = 2;
    None
}

/// All node weights reachable from `indices` in the given direction,
/// including the starting nodes themselves.
pub fn transitive_closure<N: Hash + Eq, E, I: IntoIterator<Item = NodeIndex>>(
    graph: &Graph<N, E>,
    indices: I,
    direction: Direction,
) -> HashSet<&N> {
    let mut visited = HashSet::new();
    let visitor = |event| {
        if let petgraph::visit::DfsEvent::Discover(n, _) = event {
            visited.insert(
                graph
                    .node_weight(n)
                    .expect("node index found during dfs exists"),
            );
        }
    };
    match direction {
        Direction::Outgoing => depth_first_search(&graph, indices, visitor),
        Direction::Incoming => depth_first_search(Reversed(&graph), indices, visitor),
    }
    visited
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_valid_dag() {
        let mut g: Graph<&str, ()> = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(a, c, ());
        assert!(validate_graph(&g).is_ok());
    }

    #[test]
    fn test_cycle_reports_path() {
        let mut g: Graph<&str, ()> = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(c, a, ());
        let err = validate_graph(&g).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("a -> b -> c -> a"), "{message}");
    }

    #[test]
    fn test_self_dependency() {
        let mut g: Graph<&str, ()> = Graph::new();
        let a = g.add_node("a");
        g.add_edge(a, a, ());
        assert!(matches!(
            validate_graph(&g),
            Err(Error::SelfDependency(node)) if node == "a"
        ));
    }

    #[test]
    fn test_transitive_closure() {
        let mut g: Graph<&str, ()> = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(d, c, ());
        let deps = transitive_closure(&g, Some(a), Direction::Outgoing);
        assert_eq!(deps, ["a", "b", "c"].iter().collect());
        let dependents = transitive_closure(&g, Some(c), Direction::Incoming);
        assert_eq!(dependents, ["a", "b", "c", "d"].iter().collect());
    }
}
