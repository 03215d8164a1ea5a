use petgraph::algo::tarjan_scc;
use petgraph::graph::NodeIndex;
use petgraph::Direction;
use std::collections::HashSet;

use super::builder::DependencyGraph;

/// A strongly connected set of tests plus one concrete cycle through them
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cycle {
    /// Declaration indices of every test participating, ascending
    pub members: Vec<usize>,
    /// Test ids along one cycle in "depends on" order, first id repeated at the end
    pub path: Vec<String>,
}

/// Find every dependency cycle in the graph
pub fn find_cycles(dg: &DependencyGraph) -> Vec<Cycle> {
    let mut cycles: Vec<Cycle> = tarjan_scc(&dg.graph)
        .into_iter()
        .filter(|scc| {
            scc.len() > 1 || dg.graph.find_edge(scc[0], scc[0]).is_some()
        })
        .map(|scc| {
            let mut members: Vec<usize> = scc.iter().map(|n| n.index()).collect();
            members.sort_unstable();
            let within: HashSet<NodeIndex> = scc.into_iter().collect();
            let start = dg.node_indices[members[0]];
            let path = cycle_path(dg, start, &within)
                .into_iter()
                .map(|n| dg.graph[n].clone())
                .collect();
            Cycle { members, path }
        })
        .collect();
    cycles.sort_by_key(|c| c.members[0]);
    cycles
}

/// Depth-first search for a path that returns to `start`, staying inside the
/// component and walking "depends on" edges
fn cycle_path(dg: &DependencyGraph, start: NodeIndex, within: &HashSet<NodeIndex>) -> Vec<NodeIndex> {
    let mut visited = HashSet::new();
    let mut path = vec![start];
    if dfs_back_to(dg, start, start, within, &mut visited, &mut path) {
        path
    } else {
        // Unreachable for a strongly connected component
        vec![start, start]
    }
}

fn dfs_back_to(
    dg: &DependencyGraph,
    node: NodeIndex,
    start: NodeIndex,
    within: &HashSet<NodeIndex>,
    visited: &mut HashSet<NodeIndex>,
    path: &mut Vec<NodeIndex>,
) -> bool {
    visited.insert(node);
    let mut preds: Vec<NodeIndex> = dg
        .graph
        .neighbors_directed(node, Direction::Incoming)
        .filter(|n| within.contains(n))
        .collect();
    preds.sort_by_key(|n| n.index());

    for pred in preds {
        if pred == start {
            path.push(start);
            return true;
        }
        if !visited.contains(&pred) {
            path.push(pred);
            if dfs_back_to(dg, pred, start, within, visited, path) {
                return true;
            }
            path.pop();
        }
    }
    false
}

/// Group schedulable tests into dependency levels
///
/// Level 0 has no predecessors; each later level depends only on earlier
/// ones. Tests with discovery failures and tests downstream of them are
/// reported separately as unschedulable.
pub fn execution_levels(dg: &DependencyGraph) -> (Vec<Vec<usize>>, Vec<usize>) {
    let mut levels: Vec<Vec<usize>> = Vec::new();
    let mut assigned: HashSet<usize> = HashSet::new();
    let mut remaining: Vec<usize> = (0..dg.len())
        .filter(|&i| dg.discovery_failure(i).is_none())
        .collect();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<usize>, Vec<usize>) = remaining.into_iter().partition(|&i| {
            dg.predecessors(i)
                .iter()
                .all(|(pred, _)| assigned.contains(pred))
        });

        if ready.is_empty() {
            let mut unschedulable: Vec<usize> = (0..dg.len())
                .filter(|&i| dg.discovery_failure(i).is_some())
                .chain(blocked)
                .collect();
            unschedulable.sort_unstable();
            return (levels, unschedulable);
        }

        assigned.extend(ready.iter().copied());
        levels.push(ready);
        remaining = blocked;
    }

    let unschedulable = (0..dg.len())
        .filter(|&i| dg.discovery_failure(i).is_some())
        .collect();
    (levels, unschedulable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Dependency, TestDescriptor};
    use std::sync::Arc;

    fn graph(tests: Vec<TestDescriptor>) -> DependencyGraph {
        let tests: Vec<_> = tests.into_iter().map(Arc::new).collect();
        DependencyGraph::build(&tests).expect("build failed")
    }

    fn test(id: &str) -> TestDescriptor {
        TestDescriptor::new(id, "X", |_ctx, _cancel| async { Ok(()) })
    }

    #[test]
    fn finds_three_node_cycle_path() {
        let dg = graph(vec![
            test("a").depends_on(Dependency::on_test("c")),
            test("b").depends_on(Dependency::on_test("a")),
            test("c").depends_on(Dependency::on_test("b")),
        ]);
        let cycles = find_cycles(&dg);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].members, vec![0, 1, 2]);
        assert_eq!(cycles[0].path, vec!["a", "c", "b", "a"]);
    }

    #[test]
    fn acyclic_graph_has_no_cycles() {
        let dg = graph(vec![test("a"), test("b").depends_on(Dependency::on_test("a"))]);
        assert!(find_cycles(&dg).is_empty());
    }

    #[test]
    fn levels_follow_dependencies() {
        let dg = graph(vec![
            test("a"),
            test("b").depends_on(Dependency::on_test("a")),
            test("c"),
            test("d")
                .depends_on(Dependency::on_test("b"))
                .depends_on(Dependency::on_test("c")),
        ]);
        let (levels, unschedulable) = execution_levels(&dg);
        assert_eq!(levels, vec![vec![0, 2], vec![1], vec![3]]);
        assert!(unschedulable.is_empty());
    }

    #[test]
    fn levels_exclude_cycles_and_their_dependents() {
        let dg = graph(vec![
            test("a").depends_on(Dependency::on_test("b")),
            test("b").depends_on(Dependency::on_test("a")),
            test("c").depends_on(Dependency::on_test("a")),
            test("d"),
        ]);
        let (levels, unschedulable) = execution_levels(&dg);
        assert_eq!(levels, vec![vec![3]]);
        assert_eq!(unschedulable, vec![0, 1, 2]);
    }
}
