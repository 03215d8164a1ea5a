use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::analysis;
use crate::error::{EngineError, Result};
use crate::models::{DependencyTarget, NodeState, TestDescriptor};

/// Edge from a predecessor to the test that depends on it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DependencyEdge {
    pub proceed_on_failure: bool,
}

/// Whether a node may leave `Pending`/`Blocked`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Every predecessor is terminal and the continuation policy holds
    Ready,
    /// At least one predecessor is still in flight
    Waiting,
    /// A required predecessor did not pass
    Skip { dependency: String },
}

/// Directed graph of `DependsOn` declarations
///
/// Node indices equal declaration indices. Edges point from a predecessor to
/// its dependent, so incoming edges answer "what does X depend on" and
/// outgoing edges answer "what depends on X".
pub struct DependencyGraph {
    pub(super) graph: DiGraph<String, DependencyEdge>,
    pub(super) node_indices: Vec<NodeIndex>,
    index_by_id: HashMap<String, usize>,
    failures: HashMap<usize, EngineError>,
}

impl DependencyGraph {
    /// Build the graph for tests in declaration order
    ///
    /// Duplicate identifiers abort construction. Unknown dependency targets
    /// and cycles only fail the tests involved.
    pub fn build(tests: &[Arc<TestDescriptor>]) -> Result<Self> {
        let mut graph: DiGraph<String, DependencyEdge> = DiGraph::new();
        let mut index_by_id = HashMap::with_capacity(tests.len());
        let mut by_class: HashMap<&str, Vec<usize>> = HashMap::new();

        let node_indices: Vec<NodeIndex> = tests
            .iter()
            .map(|t| graph.add_node(t.id.clone()))
            .collect();

        for (i, test) in tests.iter().enumerate() {
            if index_by_id.insert(test.id.clone(), i).is_some() {
                return Err(EngineError::DuplicateTest {
                    test: test.id.clone(),
                });
            }
            by_class.entry(test.class.as_str()).or_default().push(i);
        }

        let mut failures = HashMap::new();

        for (i, test) in tests.iter().enumerate() {
            for dep in &test.depends_on {
                let predecessors: Vec<usize> = match &dep.target {
                    DependencyTarget::Test(id) => index_by_id.get(id).copied().into_iter().collect(),
                    DependencyTarget::Class(class) => by_class
                        .get(class.as_str())
                        .map(|members| members.iter().copied().filter(|&j| j != i).collect())
                        .unwrap_or_default(),
                };

                if predecessors.is_empty() {
                    warn!("Test {} depends on unknown {}", test.id, dep.target);
                    failures.entry(i).or_insert(EngineError::DependencyNotFound {
                        test: test.id.clone(),
                        target: dep.target.to_string(),
                    });
                    continue;
                }

                for j in predecessors {
                    let (from, to) = (node_indices[j], node_indices[i]);
                    match graph.find_edge(from, to) {
                        // The strictest declaration wins when a predecessor is named twice
                        Some(edge) => {
                            graph[edge].proceed_on_failure &= dep.proceed_on_failure;
                        }
                        None => {
                            graph.add_edge(
                                from,
                                to,
                                DependencyEdge {
                                    proceed_on_failure: dep.proceed_on_failure,
                                },
                            );
                        }
                    }
                }
            }
        }

        let mut resolved = Self {
            graph,
            node_indices,
            index_by_id,
            failures,
        };

        for cycle in analysis::find_cycles(&resolved) {
            for &member in &cycle.members {
                let test = resolved.id(member).to_string();
                warn!("Test {} is part of a dependency cycle", test);
                resolved.failures.insert(
                    member,
                    EngineError::CircularDependency {
                        test,
                        cycle: cycle.path.clone(),
                    },
                );
            }
        }

        debug!(
            "Dependency graph: {} tests, {} edges, {} discovery failures",
            resolved.len(),
            resolved.graph.edge_count(),
            resolved.failures.len()
        );

        Ok(resolved)
    }

    pub fn len(&self) -> usize {
        self.node_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_indices.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index_by_id.get(id).copied()
    }

    pub fn id(&self, index: usize) -> &str {
        &self.graph[self.node_indices[index]]
    }

    /// Tests `index` depends on, with their edge policy
    pub fn predecessors(&self, index: usize) -> Vec<(usize, DependencyEdge)> {
        let mut preds: Vec<_> = self
            .graph
            .edges_directed(self.node_indices[index], Direction::Incoming)
            .map(|e| (e.source().index(), *e.weight()))
            .collect();
        preds.sort_by_key(|(i, _)| *i);
        preds
    }

    /// Tests that depend on `index`
    pub fn dependents(&self, index: usize) -> Vec<usize> {
        let mut deps: Vec<usize> = self
            .graph
            .neighbors_directed(self.node_indices[index], Direction::Outgoing)
            .map(|n| n.index())
            .collect();
        deps.sort_unstable();
        deps
    }

    /// Error that fails this test before it can be scheduled
    pub fn discovery_failure(&self, index: usize) -> Option<&EngineError> {
        self.failures.get(&index)
    }

    pub fn discovery_failures(&self) -> impl Iterator<Item = (usize, &EngineError)> {
        self.failures.iter().map(|(i, e)| (*i, e))
    }

    /// Evaluate whether `index` is unblocked given the current node states
    pub fn readiness(&self, index: usize, state_of: impl Fn(usize) -> NodeState) -> Readiness {
        let mut waiting = false;
        for (pred, edge) in self.predecessors(index) {
            let state = state_of(pred);
            if !state.is_terminal() {
                waiting = true;
                continue;
            }
            if state != NodeState::Passed && !edge.proceed_on_failure {
                return Readiness::Skip {
                    dependency: self.id(pred).to_string(),
                };
            }
        }
        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tests", &self.len())
            .field("edges", &self.graph.edge_count())
            .field("failures", &self.failures.len())
            .finish()
    }
}
